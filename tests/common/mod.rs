//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use nl2sql_gateway::clarification::InMemoryClarificationStore;
use nl2sql_gateway::collaborators::{AuditRecord, AuditSink, Insights, ResultEnricher};
use nl2sql_gateway::db::{QueryOutput, SchemaCatalog, SchemaConnection, SchemaConnector};
use nl2sql_gateway::error::{ClassifierError, QueryError, Result};
use nl2sql_gateway::intent::{ClarificationQuestion, IntentAnalysis};
use nl2sql_gateway::llm::NlClassifier;
use nl2sql_gateway::org::{ConnectionParams, OrgContext, StaticOrgContextProvider};
use nl2sql_gateway::schema_index::SchemaTokenIndex;
use nl2sql_gateway::voting::ValidationResult;
use nl2sql_gateway::{Collaborators, Orchestrator, Settings};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn org(id: &str, schemas: &[&str]) -> OrgContext {
    OrgContext {
        org_id: id.to_string(),
        org_name: format!("{} inc", id),
        allowed_schemas: schemas.iter().map(|s| s.to_string()).collect(),
        connection: ConnectionParams {
            driver: "mysql".into(),
            host: "db.internal".into(),
            port: 3306,
            username: "reader".into(),
            password: "secret".into(),
            database: "main".into(),
            options: HashMap::new(),
        },
        business_context: "B2B wholesale".into(),
    }
}

pub fn clear_intent() -> IntentAnalysis {
    IntentAnalysis {
        confidence: 0.95,
        is_clear: true,
        ..Default::default()
    }
}

pub fn vague_intent() -> IntentAnalysis {
    IntentAnalysis {
        confidence: 0.4,
        is_clear: false,
        ambiguities: vec!["time period not specified".into()],
        questions: vec![ClarificationQuestion {
            id: "time_period".into(),
            text: "Which time period?".into(),
            options: vec!["last_month".into(), "this_year".into()],
        }],
        ..Default::default()
    }
}

pub fn mismatch_intent(missing: &str) -> IntentAnalysis {
    IntentAnalysis {
        confidence: 0.9,
        is_clear: true,
        schema_mismatch: true,
        missing_data: vec![missing.to_string()],
        questions: vec![ClarificationQuestion {
            id: "alternative".into(),
            text: "Would one of these help?".into(),
            options: vec!["customer orders".into()],
        }],
        ..Default::default()
    }
}

/// Classifier that replays fixed answers and counts calls.
pub struct ScriptedClassifier {
    pub pick: Option<String>,
    pub intent: Mutex<IntentAnalysis>,
    /// Generation answer per temperature; `default_sql` otherwise.
    pub sql_by_temperature: Vec<(f64, String)>,
    pub default_sql: String,
    pub corrections: Mutex<VecDeque<String>>,
    /// `None` makes the validation call fail.
    pub rules: Option<ValidationResult>,
    pub pick_calls: AtomicUsize,
    pub intent_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub correct_calls: AtomicUsize,
    pub questions_seen: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn new(default_sql: &str) -> Self {
        Self {
            pick: None,
            intent: Mutex::new(clear_intent()),
            sql_by_temperature: Vec::new(),
            default_sql: default_sql.to_string(),
            corrections: Mutex::new(VecDeque::new()),
            rules: Some(ValidationResult::permissive()),
            pick_calls: AtomicUsize::new(0),
            intent_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            correct_calls: AtomicUsize::new(0),
            questions_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pick(mut self, schema: &str) -> Self {
        self.pick = Some(schema.to_string());
        self
    }

    pub fn with_intent(self, analysis: IntentAnalysis) -> Self {
        *self.intent.lock().unwrap() = analysis;
        self
    }

    pub fn with_sql_at(mut self, temperature: f64, sql: &str) -> Self {
        self.sql_by_temperature.push((temperature, sql.to_string()));
        self
    }

    pub fn with_correction(self, sql: &str) -> Self {
        self.corrections.lock().unwrap().push_back(sql.to_string());
        self
    }

    pub fn with_rules(mut self, rules: Option<ValidationResult>) -> Self {
        self.rules = rules;
        self
    }

    pub fn set_intent(&self, analysis: IntentAnalysis) {
        *self.intent.lock().unwrap() = analysis;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NlClassifier for ScriptedClassifier {
    async fn pick_schema(&self, _allowed: &[String], _question: &str) -> Result<Option<String>> {
        self.pick_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pick.clone())
    }

    async fn analyze_intent(&self, _question: &str, _schema_summary: &str) -> Result<IntentAnalysis> {
        self.intent_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.intent.lock().unwrap().clone())
    }

    async fn generate_sql(
        &self,
        question: &str,
        _schema_summary: &str,
        _row_limit: u32,
        temperature: f64,
    ) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.questions_seen.lock().unwrap().push(question.to_string());
        let sql = self
            .sql_by_temperature
            .iter()
            .find(|(t, _)| (*t - temperature).abs() < f64::EPSILON)
            .map(|(_, sql)| sql.clone())
            .unwrap_or_else(|| self.default_sql.clone());
        Ok(format!("```sql\n{}\n```", sql))
    }

    async fn correct_sql(
        &self,
        _failed_sql: &str,
        _error: &str,
        _schema_summary: &str,
        _row_limit: u32,
    ) -> Result<String> {
        self.correct_calls.fetch_add(1, Ordering::SeqCst);
        self.corrections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ClassifierError::Malformed("no correction scripted".into()).into())
    }

    async fn validate_sql_semantics(
        &self,
        _question: &str,
        _schema_summary: &str,
    ) -> Result<ValidationResult> {
        self.rules
            .clone()
            .ok_or_else(|| ClassifierError::Timeout.into())
    }
}

#[derive(Default)]
pub struct ConnectorLog {
    pub connects: Vec<String>,
    pub closes: Vec<String>,
    pub executed: Vec<(String, String)>,
    pub column_name_calls: usize,
}

/// In-memory tenant databases keyed by schema name.
#[derive(Default)]
pub struct FakeConnector {
    catalogs: HashMap<String, SchemaCatalog>,
    /// Number of leading `execute` calls that fail, per schema.
    failing_executions: Mutex<HashMap<String, usize>>,
    unreachable: Vec<String>,
    pub log: Arc<Mutex<ConnectorLog>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, schema: &str, table: &str, columns: &[&str]) -> Self {
        let catalog = self
            .catalogs
            .entry(schema.to_string())
            .or_insert_with(|| SchemaCatalog::new(schema));
        for (i, column) in columns.iter().enumerate() {
            catalog.add_column(table, column, "varchar", i == 0);
        }
        self
    }

    pub fn failing_executions(self, schema: &str, count: usize) -> Self {
        self.failing_executions
            .lock()
            .unwrap()
            .insert(schema.to_string(), count);
        self
    }

    pub fn unreachable(mut self, schema: &str) -> Self {
        self.unreachable.push(schema.to_string());
        self
    }

    pub fn executed(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().executed.clone()
    }

    pub fn connects(&self) -> usize {
        self.log.lock().unwrap().connects.len()
    }

    pub fn closes(&self) -> usize {
        self.log.lock().unwrap().closes.len()
    }
}

#[async_trait]
impl SchemaConnector for FakeConnector {
    async fn connect(&self, _org: &OrgContext, schema: &str) -> Result<Box<dyn SchemaConnection>> {
        if self.unreachable.iter().any(|s| s == schema) {
            return Err(QueryError::Connection(format!("cannot connect to {}", schema)));
        }
        self.log.lock().unwrap().connects.push(schema.to_string());
        let failures = self
            .failing_executions
            .lock()
            .unwrap()
            .get(schema)
            .copied()
            .unwrap_or(0);
        Ok(Box::new(FakeConnection {
            schema: schema.to_string(),
            catalog: self
                .catalogs
                .get(schema)
                .cloned()
                .unwrap_or_else(|| SchemaCatalog::new(schema)),
            failures_left: failures,
            log: self.log.clone(),
        }))
    }

    async fn column_names(
        &self,
        _org: &OrgContext,
        schemas: &[String],
    ) -> Result<Vec<(String, String, String)>> {
        self.log.lock().unwrap().column_name_calls += 1;
        let mut rows = Vec::new();
        for schema in schemas {
            if let Some(catalog) = self.catalogs.get(schema) {
                for (table, info) in &catalog.tables {
                    for column in &info.columns {
                        rows.push((schema.clone(), table.clone(), column.name.clone()));
                    }
                }
            }
        }
        Ok(rows)
    }
}

pub struct FakeConnection {
    schema: String,
    catalog: SchemaCatalog,
    failures_left: usize,
    log: Arc<Mutex<ConnectorLog>>,
}

#[async_trait]
impl SchemaConnection for FakeConnection {
    async fn reflect_catalog(&mut self, _schema: &str) -> Result<SchemaCatalog> {
        Ok(self.catalog.clone())
    }

    async fn execute(&mut self, sql: &str) -> Result<QueryOutput> {
        self.log
            .lock()
            .unwrap()
            .executed
            .push((self.schema.clone(), sql.to_string()));
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(QueryError::Execution("Unknown column 'totl' in 'field list'".into()));
        }
        Ok(QueryOutput {
            columns: vec!["region".into(), "revenue".into()],
            rows: vec![
                vec![json!("north"), json!(1200)],
                vec![json!("south"), json!(800)],
            ],
            duration_ms: 7,
        })
    }

    async fn close(self: Box<Self>) {
        self.log.lock().unwrap().closes.push(self.schema.clone());
    }
}

#[derive(Default)]
pub struct RecordingAuditSink {
    pub records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    /// Audit writes are spawned, so wait until `count` records have landed.
    pub async fn wait_for(&self, count: usize) -> Vec<AuditRecord> {
        let poll = async {
            loop {
                {
                    let records = self.records.lock().unwrap();
                    if records.len() >= count {
                        return records.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), poll)
            .await
            .expect("audit record not written in time")
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn log_query(&self, record: AuditRecord) -> Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

pub struct FailingAuditSink;

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn log_query(&self, _record: AuditRecord) -> Result<()> {
        Err(QueryError::AuditWrite("audit table missing".into()))
    }
}

pub struct FixedEnricher {
    pub fail: bool,
}

#[async_trait]
impl ResultEnricher for FixedEnricher {
    async fn enrich(
        &self,
        _question: &str,
        columns: &[String],
        rows: &[Vec<Value>],
        _business_context: &str,
    ) -> Result<Insights> {
        if self.fail {
            return Err(QueryError::Classifier(ClassifierError::Timeout));
        }
        Ok(Insights {
            summary: Some(format!("{} rows over {} columns", rows.len(), columns.len())),
            chart_spec: Some(json!({"type": "bar", "x": columns[0]})),
        })
    }
}

pub struct Harness {
    pub classifier: Arc<ScriptedClassifier>,
    pub connector: Arc<FakeConnector>,
    pub audit: Arc<RecordingAuditSink>,
    pub clarifications: Arc<InMemoryClarificationStore>,
    pub orchestrator: Orchestrator,
}

pub struct HarnessBuilder {
    orgs: Vec<OrgContext>,
    classifier: ScriptedClassifier,
    connector: FakeConnector,
    settings: Settings,
    clarification_ttl: chrono::Duration,
    enricher: Option<Arc<dyn ResultEnricher>>,
}

impl HarnessBuilder {
    pub fn new(classifier: ScriptedClassifier, connector: FakeConnector) -> Self {
        Self {
            orgs: vec![org("acme", &["sales", "hr"])],
            classifier,
            connector,
            settings: Settings::default(),
            clarification_ttl: chrono::Duration::minutes(10),
            enricher: None,
        }
    }

    pub fn orgs(mut self, orgs: Vec<OrgContext>) -> Self {
        self.orgs = orgs;
        self
    }

    pub fn settings(mut self, f: impl FnOnce(&mut Settings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn clarification_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.clarification_ttl = ttl;
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn ResultEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn build(self) -> Harness {
        let classifier = Arc::new(self.classifier);
        let connector = Arc::new(self.connector);
        let audit = Arc::new(RecordingAuditSink::default());
        let clarifications = Arc::new(InMemoryClarificationStore::new(self.clarification_ttl));
        let deps = Collaborators {
            orgs: Arc::new(StaticOrgContextProvider::new(self.orgs)),
            connector: connector.clone(),
            classifier: classifier.clone(),
            schema_index: Arc::new(SchemaTokenIndex::new(Duration::from_secs(300))),
            clarifications: clarifications.clone(),
            audit: audit.clone(),
            enricher: self.enricher,
        };
        Harness {
            classifier,
            connector,
            audit,
            clarifications,
            orchestrator: Orchestrator::new(deps, self.settings),
        }
    }
}
