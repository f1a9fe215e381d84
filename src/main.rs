use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nl2sql_gateway::clarification::InMemoryClarificationStore;
use nl2sql_gateway::collaborators::{AuditSink, TracingAuditSink};
use nl2sql_gateway::config::GenerationStrategy;
use nl2sql_gateway::db::{MySqlConnector, SqlAuditSink};
use nl2sql_gateway::llm::{LlmClassifier, LlmClient, LlmResponseCache};
use nl2sql_gateway::org::StaticOrgContextProvider;
use nl2sql_gateway::schema_index::SchemaTokenIndex;
use nl2sql_gateway::{logging, Collaborators, Orchestrator, QueryRequest, QueryResponse, Settings};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nl2sql-gateway")]
#[command(about = "Answer a business question with a read-only SQL query on a tenant database")]
struct Args {
    /// The question in natural language
    question: String,

    /// JSON file with one organisation context or a list of them
    #[arg(long)]
    org_file: PathBuf,

    /// Organisation to query as (default: lowest org_id in the file)
    #[arg(long)]
    org_id: Option<String>,

    #[arg(long, default_value = "cli")]
    user_id: String,

    /// Maximum rows returned
    #[arg(short = 'n', long, default_value_t = 100)]
    row_limit: u32,

    /// Override SQL_GENERATION_STRATEGY (voting | single)
    #[arg(long)]
    strategy: Option<GenerationStrategy>,

    /// Clarification answer as key=value, applied if clarification is requested
    #[arg(long = "answer", value_parser = parse_answer)]
    answers: Vec<(String, String)>,
}

fn parse_answer(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init("info");

    let args = Args::parse();
    let mut settings = Settings::from_env().context("loading settings")?;
    if let Some(strategy) = args.strategy {
        settings.generation_strategy = strategy;
    }

    let orgs = StaticOrgContextProvider::from_json_file(&args.org_file)
        .with_context(|| format!("loading {}", args.org_file.display()))?;
    let org_id = match args.org_id.clone() {
        Some(id) => id,
        None => orgs
            .org_ids()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} contains no organisations", args.org_file.display()))?,
    };

    let cache = Arc::new(LlmResponseCache::new(settings.llm.cache_ttl));
    let client = LlmClient::new(settings.llm.clone())?.with_cache(cache);

    let audit: Arc<dyn AuditSink> = match &settings.audit_database_url {
        Some(url) => match SqlAuditSink::connect(url).await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(error = %e, "audit database unavailable, logging audit records only");
                Arc::new(TracingAuditSink)
            }
        },
        None => Arc::new(TracingAuditSink),
    };

    let deps = Collaborators {
        orgs: Arc::new(orgs),
        connector: Arc::new(MySqlConnector::new(
            settings.db_connect_timeout,
            settings.db_query_timeout,
        )),
        classifier: Arc::new(LlmClassifier::new(client)),
        schema_index: Arc::new(SchemaTokenIndex::new(settings.schema_index_ttl)),
        clarifications: Arc::new(InMemoryClarificationStore::new(settings.clarification_ttl)),
        audit,
        enricher: None,
    };
    let orchestrator = Orchestrator::new(deps, settings);

    info!(org_id = %org_id, "answering question");
    let request = QueryRequest {
        question: args.question.clone(),
        row_limit: args.row_limit,
        ..Default::default()
    };
    let mut response = orchestrator.handle(&org_id, &args.user_id, request).await;

    if let QueryResponse::NeedsClarification { clarification_id, .. } = &response {
        if !args.answers.is_empty() {
            println!("{}", serde_json::to_string_pretty(&response)?);
            let answers: BTreeMap<String, String> = args.answers.iter().cloned().collect();
            info!(clarification_id = %clarification_id, "resuming with supplied answers");
            let follow_up = QueryRequest {
                question: args.question.clone(),
                row_limit: args.row_limit,
                clarification_id: Some(clarification_id.clone()),
                clarification_answers: answers,
                ..Default::default()
            };
            response = orchestrator.handle(&org_id, &args.user_id, follow_up).await;
        }
    }

    println!("{}", serde_json::to_string_pretty(&response)?);
    if matches!(response, QueryResponse::Failure { .. }) {
        std::process::exit(1);
    }
    Ok(())
}
