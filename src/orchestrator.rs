//! Request orchestration
//!
//! Drives one request end to end: tenant context, schema try-order, then per
//! schema a connection-scoped attempt through the pipeline phases. Per-schema
//! failures are tagged and the next schema is tried; only when every schema
//! failed does the last error reach the caller.

use crate::clarification::{ClarificationStore, NewSession};
use crate::collaborators::{best_effort, AuditRecord, AuditSink, Insights, ResultEnricher};
use crate::config::Settings;
use crate::db::catalog::SchemaCatalog;
use crate::db::connection::{SchemaConnection, SchemaConnector};
use crate::db::executor::QueryOutput;
use crate::error::{QueryError, Result};
use crate::generator::SqlGenerator;
use crate::guardrail;
use crate::intent::{build_clarified_question, ClarificationQuestion, IntentAnalysis, IntentAnalyzer, IntentOutcome};
use crate::llm::NlClassifier;
use crate::org::{OrgContext, OrgContextProvider};
use crate::pipeline::{PhaseEvent, PipelinePhase};
use crate::schema_index::{SchemaTokenIndex, SchemaTokens};
use crate::selector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub question: String,
    pub row_limit: u32,
    #[serde(default)]
    pub enrich: bool,
    #[serde(default)]
    pub clarification_id: Option<String>,
    #[serde(default)]
    pub clarification_answers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryResponse {
    Success {
        schema_used: String,
        sql: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        row_count: usize,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        insights: Option<Insights>,
    },
    NeedsClarification {
        clarification_id: String,
        questions: Vec<ClarificationQuestion>,
        ambiguities: Vec<String>,
        confidence: f64,
    },
    SchemaError {
        missing_data: Vec<String>,
        suggestions: Vec<String>,
    },
    Failure {
        message: String,
    },
}

/// Everything known about one request, filled in as the pipeline advances.
#[derive(Debug, Clone, Default)]
pub struct QueryExecutionContext {
    pub org_id: String,
    pub user_id: String,
    pub original_question: String,
    /// Question sent to the generator; the merged question on the
    /// clarification path.
    pub question: String,
    pub row_limit: u32,
    pub enrich: bool,
    pub clarification_id: Option<String>,
    pub schema_used: Option<String>,
    pub sql_generated: Option<String>,
    pub sql_executed: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub duration_ms: Option<u64>,
    pub insights: Option<Insights>,
}

/// Injected collaborators. Every field is a seam tests can replace.
#[derive(Clone)]
pub struct Collaborators {
    pub orgs: Arc<dyn OrgContextProvider>,
    pub connector: Arc<dyn SchemaConnector>,
    pub classifier: Arc<dyn NlClassifier>,
    pub schema_index: Arc<SchemaTokenIndex>,
    pub clarifications: Arc<dyn ClarificationStore>,
    pub audit: Arc<dyn AuditSink>,
    pub enricher: Option<Arc<dyn ResultEnricher>>,
}

enum AttemptOutcome {
    Executed(QueryOutput),
    NeedsClarification(IntentAnalysis),
}

#[derive(Default)]
struct AttemptState {
    analysis: Option<IntentAnalysis>,
    output: Option<QueryOutput>,
    failure: Option<QueryError>,
}

pub struct Orchestrator {
    deps: Collaborators,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(deps: Collaborators, settings: Settings) -> Self {
        Self { deps, settings }
    }

    /// Run one request. Errors are folded into [`QueryResponse::Failure`]
    /// with a user-safe message.
    pub async fn handle(&self, org_id: &str, user_id: &str, request: QueryRequest) -> QueryResponse {
        match self.run(org_id, user_id, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(org_id, error = %e, "query request failed");
                QueryResponse::Failure {
                    message: e.user_message(),
                }
            }
        }
    }

    fn validate_request(&self, request: &QueryRequest) -> Result<()> {
        if request.clarification_id.is_none() && request.question.trim().is_empty() {
            return Err(QueryError::InvalidRequest("question must not be empty".to_string()));
        }
        if request.row_limit == 0 || request.row_limit > self.settings.max_row_limit {
            return Err(QueryError::InvalidRequest(format!(
                "row_limit must be between 1 and {}",
                self.settings.max_row_limit
            )));
        }
        Ok(())
    }

    async fn run(&self, org_id: &str, user_id: &str, request: QueryRequest) -> Result<QueryResponse> {
        self.validate_request(&request)?;
        let org = self.deps.orgs.load(org_id).await?;

        let mut ctx = QueryExecutionContext {
            org_id: org.org_id.clone(),
            user_id: user_id.to_string(),
            original_question: request.question.trim().to_string(),
            question: request.question.trim().to_string(),
            row_limit: request.row_limit,
            enrich: request.enrich,
            clarification_id: request.clarification_id.clone(),
            ..Default::default()
        };

        let try_order = match &request.clarification_id {
            Some(id) => {
                let session = self.deps.clarifications.get(id).await?;
                if session.org_id != org.org_id {
                    warn!(org_id = %org.org_id, clarification_id = %id, "clarification session owned by another organisation");
                    return Err(QueryError::SessionNotFound);
                }
                ctx.original_question = session.original_question.clone();
                ctx.question =
                    build_clarified_question(&session.original_question, &request.clarification_answers);
                info!(clarification_id = %id, question = %ctx.question, "resuming clarified question");
                selector::clarification_try_order(&org, &session.schema_name)
            }
            None => {
                let index = self.schema_tokens(&org).await;
                selector::schema_try_order(&org, &index, &ctx.question, self.deps.classifier.as_ref()).await
            }
        };

        if try_order.is_empty() {
            return Err(QueryError::Configuration(format!(
                "organisation {} has no allowed schemas",
                org.org_id
            )));
        }

        let resumed = ctx.clarification_id.is_some();
        let mut last_error: Option<QueryError> = None;

        for schema in &try_order {
            info!(org_id = %org.org_id, schema = %schema, resumed, "trying schema");
            match self.attempt(&org, schema, &mut ctx, resumed).await {
                Ok(AttemptOutcome::Executed(output)) => {
                    if let Some(id) = &ctx.clarification_id {
                        if !self.deps.clarifications.delete(id).await? {
                            warn!(clarification_id = %id, "clarification session consumed concurrently");
                            return Err(QueryError::SessionNotFound);
                        }
                    }
                    return Ok(self.finish(&org, schema, &mut ctx, output).await);
                }
                Ok(AttemptOutcome::NeedsClarification(analysis)) => {
                    let session = self
                        .deps
                        .clarifications
                        .create(NewSession {
                            org_id: org.org_id.clone(),
                            user_id: ctx.user_id.clone(),
                            original_question: ctx.original_question.clone(),
                            schema_name: schema.clone(),
                            intent_analysis: analysis.clone(),
                        })
                        .await?;
                    return Ok(QueryResponse::NeedsClarification {
                        clarification_id: session.id,
                        questions: analysis.questions,
                        ambiguities: analysis.ambiguities,
                        confidence: analysis.confidence,
                    });
                }
                Err(QueryError::SchemaMismatch {
                    missing_data,
                    suggestions,
                    ..
                }) => {
                    return Ok(QueryResponse::SchemaError {
                        missing_data,
                        suggestions,
                    });
                }
                Err(e) => {
                    if e.is_retryable_on_other_schema() {
                        info!(schema = %schema, error = %e, "schema cannot answer, falling through");
                    } else {
                        warn!(schema = %schema, error = %e, "schema attempt failed");
                    }
                    last_error = Some(e.tag_schema(schema));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            QueryError::Configuration("no schema attempt was made".to_string())
        }))
    }

    async fn schema_tokens(&self, org: &OrgContext) -> Arc<SchemaTokens> {
        match self
            .deps
            .schema_index
            .get_or_build(org, self.deps.connector.as_ref())
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(org_id = %org.org_id, error = %e, "schema token index unavailable, ranking without it");
                Arc::new(SchemaTokens::new())
            }
        }
    }

    /// One schema attempt on its own connection. The connection is closed on
    /// every exit path.
    async fn attempt(
        &self,
        org: &OrgContext,
        schema: &str,
        ctx: &mut QueryExecutionContext,
        resumed: bool,
    ) -> Result<AttemptOutcome> {
        let mut conn = self.deps.connector.connect(org, schema).await?;
        let result = self.run_phases(conn.as_mut(), schema, ctx, resumed).await;
        conn.close().await;
        result
    }

    async fn run_phases(
        &self,
        conn: &mut dyn SchemaConnection,
        schema: &str,
        ctx: &mut QueryExecutionContext,
        resumed: bool,
    ) -> Result<AttemptOutcome> {
        let catalog = conn.reflect_catalog(schema).await?;
        let summary = catalog.summary();
        let mut state = AttemptState::default();

        let start = if resumed {
            PhaseEvent::ClarificationResumed
        } else {
            PhaseEvent::SchemaSelected
        };
        let mut phase = PipelinePhase::SelectingSchema.transition(start)?;

        loop {
            match phase {
                PipelinePhase::Done => {
                    let output = state.output.take().ok_or_else(|| {
                        QueryError::Execution("pipeline finished without a result".to_string())
                    })?;
                    return Ok(AttemptOutcome::Executed(output));
                }
                PipelinePhase::AwaitingClarification => {
                    let analysis = state.analysis.take().unwrap_or_default();
                    return Ok(AttemptOutcome::NeedsClarification(analysis));
                }
                PipelinePhase::Failed => {
                    return Err(state.failure.take().unwrap_or_else(|| {
                        QueryError::Execution("pipeline failed".to_string())
                    }));
                }
                _ => {}
            }

            let event = match self
                .step(&phase, conn, &catalog, &summary, schema, ctx, &mut state)
                .await
            {
                Ok(event) => event,
                Err(e) => {
                    debug!(phase = phase.name(), error = %e, "aborting schema attempt");
                    state.failure = Some(e);
                    PhaseEvent::Abort
                }
            };
            phase = phase.transition(event)?;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn step(
        &self,
        phase: &PipelinePhase,
        conn: &mut dyn SchemaConnection,
        catalog: &SchemaCatalog,
        summary: &str,
        schema: &str,
        ctx: &mut QueryExecutionContext,
        state: &mut AttemptState,
    ) -> Result<PhaseEvent> {
        let classifier = self.deps.classifier.as_ref();
        let generator = SqlGenerator::new(classifier);

        match phase {
            PipelinePhase::AnalyzingIntent => {
                let analyzer = IntentAnalyzer::new(self.settings.intent_confidence_threshold);
                match analyzer.analyze(classifier, &ctx.question, summary).await? {
                    IntentOutcome::Clear(_) => Ok(PhaseEvent::IntentClear),
                    IntentOutcome::NeedsClarification(analysis) => {
                        state.analysis = Some(analysis);
                        Ok(PhaseEvent::ClarificationNeeded)
                    }
                    IntentOutcome::SchemaMismatch {
                        missing_data,
                        suggestions,
                    } => Err(QueryError::SchemaMismatch {
                        schema: schema.to_string(),
                        missing_data,
                        suggestions,
                    }),
                }
            }
            PipelinePhase::Generating => {
                let sql = generator
                    .generate_with(
                        self.settings.generation_strategy,
                        &ctx.question,
                        summary,
                        ctx.row_limit,
                    )
                    .await?;
                ctx.sql_generated = Some(sql.clone());
                Ok(PhaseEvent::SqlGenerated(sql))
            }
            PipelinePhase::Validating { sql, .. } => {
                let safe = guardrail::validate_sql(sql, catalog, schema, ctx.row_limit)?;
                Ok(PhaseEvent::Validated(safe))
            }
            PipelinePhase::Executing { sql, corrected } => match conn.execute(sql).await {
                Ok(output) => {
                    ctx.sql_executed = Some(sql.clone());
                    state.output = Some(output);
                    Ok(PhaseEvent::ExecutionSucceeded)
                }
                Err(e) => {
                    warn!(schema, corrected = *corrected, error = %e, "execution failed");
                    let message = e.to_string();
                    state.failure = Some(e);
                    Ok(PhaseEvent::ExecutionFailed(message))
                }
            },
            PipelinePhase::Correcting { failed_sql, error } => {
                let sql = generator
                    .correct(failed_sql, error, summary, ctx.row_limit)
                    .await?;
                info!(schema, "received corrected SQL");
                ctx.sql_generated = Some(sql.clone());
                Ok(PhaseEvent::SqlGenerated(sql))
            }
            other => Err(QueryError::InvalidTransition {
                from: other.name(),
                event: "step",
            }),
        }
    }

    async fn finish(
        &self,
        org: &OrgContext,
        schema: &str,
        ctx: &mut QueryExecutionContext,
        output: QueryOutput,
    ) -> QueryResponse {
        let sql = ctx.sql_executed.clone().unwrap_or_default();
        let row_count = output.row_count();
        ctx.schema_used = Some(schema.to_string());
        ctx.columns = output.columns;
        ctx.rows = output.rows;
        ctx.duration_ms = Some(output.duration_ms);

        let record = AuditRecord::new(
            &org.org_id,
            schema,
            &ctx.question,
            &sql,
            Some(row_count as u64),
            Some(output.duration_ms),
        );
        let audit = self.deps.audit.clone();
        tokio::spawn(async move {
            best_effort("audit", audit.log_query(record)).await;
        });

        if ctx.enrich {
            if let Some(enricher) = &self.deps.enricher {
                ctx.insights = best_effort(
                    "enrichment",
                    enricher.enrich(&ctx.question, &ctx.columns, &ctx.rows, &org.business_context),
                )
                .await
                .filter(|i| !i.is_empty());
            }
        }

        info!(
            org_id = %org.org_id,
            schema,
            rows = row_count,
            duration_ms = output.duration_ms,
            "query answered"
        );

        QueryResponse::Success {
            schema_used: schema.to_string(),
            sql,
            columns: std::mem::take(&mut ctx.columns),
            rows: std::mem::take(&mut ctx.rows),
            row_count,
            duration_ms: output.duration_ms,
            insights: ctx.insights.take(),
        }
    }
}
