//! Prompt catalogue
//!
//! Every message list sent to the model is built here so wording changes stay
//! in one place.

use crate::llm::ChatMessage;

const INTENT_SYSTEM: &str = r#"You are an experienced business analyst. VALIDATE THE SCHEMA FIRST, then assess clarity.

Respond with JSON only:
{
  "confidence": 0.85,
  "is_clear": true,
  "schema_mismatch": false,
  "missing_data": [],
  "ambiguities": [],
  "questions": []
}

STEP 1: SCHEMA VALIDATION (highest priority)
If the question asks for data that does NOT exist in the schema, answer:
{
  "confidence": 0.0,
  "is_clear": false,
  "schema_mismatch": true,
  "missing_data": ["Description of what is missing"],
  "ambiguities": [],
  "questions": [{
    "id": "alternatives",
    "text": "This data is not available. I can show:",
    "options": ["Suggestion based on the real schema", "Suggestion 2", "Suggestion 3"]
  }]
}

Example: schema actor(id, name, birth_date), film(title, year); question "Which actor won the most Oscars?"
-> schema_mismatch=true, missing_data ["Award/Oscar information is not available"],
   options ["List all actors", "Oldest actors", "Films per year"]

STEP 2: IF THE SCHEMA FITS, ASSESS CLARITY
Accept (confidence > 0.7): exploratory listings, simple counts, top-N rankings.
Ask (confidence < 0.5): critical financial metrics, comparisons without a baseline, causal questions.
When asking, each question needs an "id" (e.g. "time_period", "scope"), a "text" and a list of "options".
Sensible defaults: last 30 days or full history for periods, volume/value for rankings.

Be specific about what is missing. Offer ONLY alternatives that EXIST in the available data."#;

const PICK_SCHEMA_SYSTEM: &str =
    "You choose ONE schema among the allowed ones. Answer with a single word (the exact name), no explanation.";

const VALIDATION_SYSTEM: &str = r#"You are a SQL validator.
Given a question and the available schema, return VALIDATION RULES describing what a correct query must contain.
Do NOT write SQL.

Respond with JSON only:
{
  "must_include": ["Table 'sales'", "Filter on sale_date for last month"],
  "must_not": ["DELETE/UPDATE/DROP/INSERT"],
  "suggestions": ["Aggregate per product"],
  "confidence": 0.85
}

must_include: minimum requirements for the query to be correct.
must_not: critical mistakes that invalidate the query.
suggestions: optional improvements.
confidence: 0.0-1.0, how confident you are that SQL can be generated at all."#;

pub fn intent_analysis(question: &str, schema_summary: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(INTENT_SYSTEM),
        ChatMessage::user(format!(
            "AVAILABLE SCHEMA:\n{}\n\nUSER QUESTION:\n{}\n\nAssess: (1) does the schema support it? (2) if so, is it clear or does it need clarification?",
            schema_summary, question
        )),
    ]
}

pub fn pick_schema(allowed: &[String], question: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(PICK_SCHEMA_SYSTEM),
        ChatMessage::user(format!(
            "Allowed schemas: {}\nQuestion: {}\nAnswer with the schema only.",
            allowed.join(", "),
            question
        )),
    ]
}

pub fn sql_generation(question: &str, schema_summary: &str, row_limit: u32) -> Vec<ChatMessage> {
    let system = format!(
        "You translate natural language into SQL (MySQL dialect).\n\n\
         MANDATORY RULES:\n\
         - Produce ONE valid SELECT query only\n\
         - Use ONLY tables and columns from the schema below\n\
         - NEVER use information_schema, performance_schema, mysql.* or other system tables\n\
         - Prefer JOINs on explicit PK/FK columns\n\
         - NEVER modify data (no INSERT/UPDATE/DELETE/DDL)\n\
         - Include LIMIT {} unless the question asks for an explicit limit\n\
         - No comments, no explanations, no multiple statements\n\n\
         Example: SELECT col FROM tbl WHERE cond LIMIT 10;",
        row_limit
    );
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!(
            "Schema:\n{}\n\nQuestion:\n{}\n\nSQL:",
            schema_summary, question
        )),
    ]
}

pub fn sql_correction(
    failed_sql: &str,
    error: &str,
    schema_summary: &str,
    row_limit: u32,
) -> Vec<ChatMessage> {
    let system = format!(
        "You fix SQL that raised an error.\n\n\
         RULES:\n\
         - Return ONLY the corrected query (a single statement)\n\
         - Use ONLY tables from the given schema\n\
         - NEVER use information_schema, performance_schema or other system tables\n\
         - No explanations, no comments\n\
         - Include LIMIT {} if needed",
        row_limit
    );
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!(
            "Schema:\n{}\n\nFailing SQL:\n{}\n\nError:\n{}\n\nCorrected SQL:",
            schema_summary, failed_sql, error
        )),
    ]
}

pub fn sql_validation(question: &str, schema_summary: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(VALIDATION_SYSTEM),
        ChatMessage::user(format!(
            "SCHEMA:\n{}\n\nQUESTION:\n{}\n\nReturn the validation rules as JSON:",
            schema_summary, question
        )),
    ]
}
