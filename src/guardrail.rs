//! SQL guardrail
//!
//! Static checks applied to every statement before it reaches the database,
//! including corrected ones. Validation is a pure function of the statement,
//! the full catalog, the schema name and the row cap, and is idempotent:
//! validating its own output returns the same text.
//!
//! Checks, in order:
//! 1. write/DDL keywords anywhere in the text
//! 2. embedded statement separators
//! 3. table references anywhere in the statement, subqueries included
//! 4. references qualified with another schema, except read-only system schemas
//! 5. tables missing from the catalog (retryable on another schema)
//! 6. LIMIT appended when the outer query has none
//! 7. exactly one trailing `;`
//!
//! Table references come from the `sqlparser` AST. Statements the parser
//! rejects fall back to a FROM/JOIN pattern scan.

use crate::db::catalog::SchemaCatalog;
use crate::error::{QueryError, Result};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::{ObjectName, Query, Statement, Visit, Visitor};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tracing::{debug, warn};

pub const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

const TABLE_REF: &str = r#"((?:`?[a-z0-9_]+`?\.)?`?[a-z0-9_]+`?)"#;

/// Words that end a table reference instead of aliasing it.
const CLAUSE_KEYWORDS: &[&str] = &[
    "where", "join", "inner", "left", "right", "full", "outer", "cross", "natural", "straight_join",
    "on", "using", "group", "order", "having", "limit", "union", "except", "intersect", "window",
    "for", "lock", "partition", "use", "force", "ignore", "into", "and", "or", "as",
];

lazy_static! {
    static ref DANGEROUS: Regex = Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|MERGE|ALTER|DROP|CREATE|TRUNCATE|GRANT|REVOKE)\b"
    )
    .expect("static regex");
    static ref FROM_OR_JOIN: Regex =
        Regex::new(&format!(r"(?i)\b(?:from|join)\s+{}", TABLE_REF)).expect("static regex");
    static ref ALIAS: Regex =
        Regex::new(r"(?i)^\s+(?:as\s+)?`?([a-z0-9_]+)`?").expect("static regex");
    static ref LIST_ITEM: Regex =
        Regex::new(&format!(r"(?i)^\s*,\s*{}", TABLE_REF)).expect("static regex");
    static ref FROM_FUNCTION: Regex =
        Regex::new(r"(?i)\b(?:extract|trim|substring|substr|position|overlay)\s*\(").expect("static regex");
    static ref FROM_KEYWORD: Regex = Regex::new(r"(?i)\bfrom\b").expect("static regex");
    static ref CTE_NAME: Regex = Regex::new(
        r"(?i)(?:\bwith(?:\s+recursive\b)?|,)\s*`?([a-z0-9_]+)`?\s*(?:\([^()]*\)\s*)?as\s*\("
    )
    .expect("static regex");
    static ref LIMIT: Regex = Regex::new(r"(?i)\blimit\b").expect("static regex");
}

/// Tables a statement reads, with the names its CTEs define.
#[derive(Debug, Default)]
struct Relations {
    references: Vec<(Option<String>, String)>,
    cte_names: BTreeSet<String>,
    has_limit: bool,
}

impl Visitor for Relations {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let mut parts = relation.0.iter().rev().map(|ident| ident.value.to_lowercase());
        if let Some(table) = parts.next() {
            self.references.push((parts.next(), table));
        }
        ControlFlow::Continue(())
    }
}

/// Validate `sql` against `catalog` and return the statement to execute.
pub fn validate_sql(
    sql: &str,
    catalog: &SchemaCatalog,
    schema_name: &str,
    row_limit: u32,
) -> Result<String> {
    if let Some(m) = DANGEROUS.find(sql) {
        warn!(keyword = m.as_str(), "write/DDL keyword rejected");
        return Err(QueryError::UnsafeSql(format!(
            "statement contains {}",
            m.as_str().to_uppercase()
        )));
    }

    let scanned = scan(sql);
    let body = trim_terminators(&scanned.code);
    let masked = trim_terminators(&scanned.masked);
    if masked.contains(';') {
        return Err(QueryError::UnsafeSql(
            "multiple statements are not allowed".to_string(),
        ));
    }
    if body.is_empty() {
        return Err(QueryError::UnsafeSql("empty statement".to_string()));
    }

    let relations = match Parser::parse_sql(&MySqlDialect {}, body) {
        Ok(statements) => relations_from_ast(&statements)?,
        Err(e) => {
            debug!(error = %e, "SQL parse failed, scanning FROM/JOIN clauses");
            relations_from_text(masked)
        }
    };
    let schema_lower = schema_name.to_lowercase();

    let mut foreign = BTreeSet::new();
    let mut tables_used = BTreeSet::new();
    for (qualifier, table) in relations.references {
        match qualifier {
            Some(q) if q != schema_lower => {
                if !SYSTEM_SCHEMAS.contains(&q.as_str()) {
                    foreign.insert(format!("{}.{}", q, table));
                }
            }
            Some(_) => {
                tables_used.insert(table);
            }
            None => {
                if !relations.cte_names.contains(&table) {
                    tables_used.insert(table);
                }
            }
        }
    }

    if !foreign.is_empty() {
        let listed = foreign.into_iter().join(", ");
        warn!(schema = schema_name, references = %listed, "cross-schema reference rejected");
        return Err(QueryError::CrossSchemaReference(listed));
    }

    let unknown: Vec<String> = tables_used
        .into_iter()
        .filter(|t| t != "dual" && !catalog.has_table(t))
        .collect();
    if !unknown.is_empty() {
        debug!(schema = schema_name, ?unknown, "unknown tables");
        return Err(QueryError::UnknownTables {
            schema: schema_name.to_string(),
            tables: unknown,
        });
    }

    let mut safe = body.to_string();
    if !relations.has_limit {
        safe.push_str(&format!(" LIMIT {}", row_limit));
    }
    safe.push(';');
    Ok(safe)
}

fn relations_from_ast(statements: &[Statement]) -> Result<Relations> {
    let [statement @ Statement::Query(query)] = statements else {
        return Err(QueryError::UnsafeSql(
            "only a single SELECT statement is allowed".to_string(),
        ));
    };
    let mut relations = Relations {
        has_limit: query.limit.is_some(),
        ..Relations::default()
    };
    let _ = statement.visit(&mut relations);
    Ok(relations)
}

fn relations_from_text(masked: &str) -> Relations {
    Relations {
        references: extract_table_refs(&blank_function_from(masked))
            .iter()
            .map(|r| split_ref(r))
            .collect(),
        cte_names: cte_names(masked),
        has_limit: has_outer_limit(masked),
    }
}

/// Whether LIMIT appears outside every parenthesised subquery.
fn has_outer_limit(masked: &str) -> bool {
    LIMIT
        .find_iter(masked)
        .any(|m| paren_depth(&masked[..m.start()]) == 0)
}

fn paren_depth(text: &str) -> i64 {
    text.chars().fold(0, |depth, c| match c {
        '(' => depth + 1,
        ')' => depth - 1,
        _ => depth,
    })
}

fn trim_terminators(text: &str) -> &str {
    text.trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

fn split_ref(reference: &str) -> (Option<String>, String) {
    let clean = |part: &str| part.trim_matches('`').to_lowercase();
    match reference.split_once('.') {
        Some((qualifier, table)) => (Some(clean(qualifier)), clean(table)),
        None => (None, clean(reference)),
    }
}

/// Table references after FROM/JOIN, including comma-separated lists.
pub fn extract_table_refs(sql: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for caps in FROM_OR_JOIN.captures_iter(sql) {
        let Some(first) = caps.get(1) else { continue };
        refs.push(first.as_str().to_string());

        let mut pos = first.end();
        loop {
            if let Some(alias) = ALIAS.captures(&sql[pos..]) {
                let word = alias.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
                if !CLAUSE_KEYWORDS.contains(&word.as_str()) {
                    pos += alias.get(0).map(|m| m.end()).unwrap_or(0);
                }
            }
            match LIST_ITEM.captures(&sql[pos..]).and_then(|c| c.get(1)) {
                Some(next) => {
                    refs.push(next.as_str().to_string());
                    pos += next.end();
                }
                None => break,
            }
        }
    }
    refs
}

fn cte_names(masked: &str) -> BTreeSet<String> {
    let starts_with_with = masked
        .trim_start()
        .get(..4)
        .map_or(false, |w| w.eq_ignore_ascii_case("with"));
    if !starts_with_with {
        return BTreeSet::new();
    }
    CTE_NAME
        .captures_iter(masked)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_lowercase()))
        .collect()
}

/// Blank the FROM keyword that belongs to functions such as
/// `EXTRACT(YEAR FROM created_at)`, leaving nested subqueries visible.
fn blank_function_from(text: &str) -> String {
    let mut out = text.to_string();
    for m in FROM_FUNCTION.find_iter(text) {
        let open = m.end();
        let close = matching_paren(text, open);
        let args = &text[open..close];
        for from in FROM_KEYWORD.find_iter(args) {
            if paren_depth(&args[..from.start()]) == 0 {
                out.replace_range(open + from.start()..open + from.end(), "    ");
            }
        }
    }
    out
}

fn matching_paren(text: &str, start: usize) -> usize {
    let mut depth = 1usize;
    for (i, c) in text[start..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return start + i;
                }
            }
            _ => {}
        }
    }
    text.len()
}

/// `sql` with `--`, `#` and `/* */` comments outside quotes removed.
pub fn strip_sql_comments(sql: &str) -> String {
    scan(sql).code
}

struct Scanned {
    /// Statement with comments removed.
    code: String,
    /// Same as `code` with string literal contents emptied.
    masked: String,
}

/// Remove `--`, `#` and `/* */` comments outside quotes, and produce a copy
/// with string literal contents removed for structural checks.
fn scan(sql: &str) -> Scanned {
    let mut code = String::with_capacity(sql.len());
    let mut masked = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                code.push(c);
                masked.push(c);
                while let Some(inner) = chars.next() {
                    code.push(inner);
                    if inner == '\\' {
                        if let Some(escaped) = chars.next() {
                            code.push(escaped);
                        }
                        continue;
                    }
                    if inner == c {
                        if chars.peek() == Some(&c) {
                            chars.next();
                            code.push(c);
                            continue;
                        }
                        masked.push(c);
                        break;
                    }
                }
            }
            '`' => {
                code.push(c);
                masked.push(c);
                for inner in chars.by_ref() {
                    code.push(inner);
                    masked.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if starts_line_comment(&chars) => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                code.push(' ');
                masked.push(' ');
            }
            '#' => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
                code.push(' ');
                masked.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                code.push(' ');
                masked.push(' ');
            }
            _ => {
                code.push(c);
                masked.push(c);
            }
        }
    }

    Scanned { code, masked }
}

/// MySQL only treats `--` as a comment when whitespace follows.
fn starts_line_comment(rest: &std::iter::Peekable<std::str::Chars<'_>>) -> bool {
    let mut look = rest.clone();
    look.next() == Some('-') && look.next().map_or(true, char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        let mut c = SchemaCatalog::new("sales");
        c.add_column("Orders", "id", "int", true);
        c.add_column("Orders", "customer_id", "int", false);
        c.add_column("Orders", "created_at", "datetime", false);
        c.add_column("customers", "id", "int", true);
        c.add_column("customers", "name", "varchar", false);
        c
    }

    fn validate(sql: &str) -> Result<String> {
        validate_sql(sql, &catalog(), "sales", 100)
    }

    #[test]
    fn test_write_keywords_rejected_in_any_case() {
        for sql in [
            "SELECT * FROM orders; DROP TABLE orders;",
            "select 1 from orders where id in (select id from customers) union select 1 from x; delete from orders",
            "WITH x AS (SELECT 1) insert INTO orders VALUES (1)",
            "sElEcT * FROM orders WHERE 1=1 -- Truncate",
            "GRANT SELECT ON sales.* TO bob",
            "merge into orders using customers on 1=1",
        ] {
            assert!(matches!(validate(sql), Err(QueryError::UnsafeSql(_))), "{}", sql);
        }
    }

    #[test]
    fn test_keyword_inside_identifier_is_fine() {
        let sql = "SELECT updated_flag, created_at FROM orders WHERE status = 'DELETED';";
        assert!(validate(sql).is_ok());
    }

    #[test]
    fn test_unknown_table_is_retryable() {
        let err = validate("SELECT * FROM invoices JOIN orders ON 1=1").unwrap_err();
        assert!(err.is_retryable_on_other_schema());
        match err {
            QueryError::UnknownTables { schema, tables } => {
                assert_eq!(schema, "sales");
                assert_eq!(tables, vec!["invoices"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cross_schema_rejected_but_system_schema_allowed() {
        let err = validate("SELECT * FROM hr.salaries").unwrap_err();
        assert!(matches!(err, QueryError::CrossSchemaReference(ref r) if r == "hr.salaries"));
        assert!(!err.is_retryable_on_other_schema());

        assert!(validate("SELECT * FROM orders o, `hr`.`payroll` p").is_err());
        assert!(validate("SELECT TABLE_NAME FROM information_schema.TABLES").is_ok());
        assert!(validate("SELECT * FROM `sales`.`orders`").is_ok());
    }

    #[test]
    fn test_table_names_are_case_insensitive() {
        assert!(validate("SELECT * FROM ORDERS o JOIN Customers c ON c.id = o.customer_id").is_ok());
    }

    #[test]
    fn test_limit_appended_once() {
        let safe = validate("SELECT id FROM orders;;").unwrap();
        assert_eq!(safe, "SELECT id FROM orders LIMIT 100;");
        assert_eq!(LIMIT.find_iter(&safe).count(), 1);
    }

    #[test]
    fn test_existing_limit_untouched() {
        assert_eq!(
            validate("SELECT id FROM orders LIMIT 5000").unwrap(),
            "SELECT id FROM orders LIMIT 5000;"
        );
    }

    #[test]
    fn test_validation_is_idempotent() {
        for sql in [
            "SELECT id FROM orders",
            "SELECT name FROM customers /* c */ WHERE name = 'a -- b' LIMIT 3;",
            "WITH recent AS (SELECT * FROM orders) SELECT * FROM recent",
        ] {
            let once = validate(sql).unwrap();
            assert_eq!(validate(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_embedded_separator_rejected() {
        assert!(matches!(
            validate("SELECT 1 FROM orders; SELECT 2 FROM customers"),
            Err(QueryError::UnsafeSql(_))
        ));
        assert!(validate("SELECT id FROM orders WHERE note = 'a;b'").is_ok());
    }

    #[test]
    fn test_literals_and_from_functions_are_not_tables() {
        assert!(validate("SELECT * FROM orders WHERE note = 'shipped from warehouse'").is_ok());
        assert!(validate(
            "SELECT EXTRACT(YEAR FROM created_at) y, TRIM(LEADING '0' FROM name) FROM orders"
        )
        .is_ok());
        assert!(validate("SELECT 1 FROM DUAL").is_ok());
    }

    #[test]
    fn test_cte_names_count_as_known() {
        assert!(validate(
            "WITH recent AS (SELECT * FROM orders), big (id) AS (SELECT id FROM recent) SELECT * FROM big"
        )
        .is_ok());
    }

    #[test]
    fn test_comment_does_not_hide_limit() {
        let safe = validate("SELECT id FROM orders -- limit 10").unwrap();
        assert_eq!(safe, "SELECT id FROM orders LIMIT 100;");
    }

    #[test]
    fn test_subquery_inside_function_arguments_is_checked() {
        for sql in [
            "SELECT TRIM((SELECT password FROM hr.users LIMIT 1)) FROM orders",
            "SELECT EXTRACT(YEAR FROM (SELECT hired_at FROM hr.employees LIMIT 1)) FROM orders",
            "SELECT SUBSTRING((SELECT iban FROM hr.payroll LIMIT 1) FROM 1 FOR 4) FROM orders",
            "SELECT POSITION('a' IN (SELECT name FROM hr.staff LIMIT 1)) FROM orders",
        ] {
            assert!(
                matches!(validate(sql), Err(QueryError::CrossSchemaReference(ref r)) if r.starts_with("hr.")),
                "{}",
                sql
            );
        }
    }

    #[test]
    fn test_inner_limit_does_not_count_as_outer_limit() {
        let safe = validate("SELECT TRIM((SELECT name FROM customers LIMIT 1)) FROM orders").unwrap();
        assert!(safe.ends_with(") FROM orders LIMIT 100;"), "{}", safe);
        assert_eq!(validate(&safe).unwrap(), safe);
    }

    #[test]
    fn test_pattern_scan_sees_function_subqueries() {
        let masked = scan("SELECT TRIM((SELECT password FROM hr.users LIMIT 1)) FROM orders").masked;
        let relations = relations_from_text(&masked);
        assert!(relations
            .references
            .contains(&(Some("hr".to_string()), "users".to_string())));
        assert!(!relations.has_limit);

        let masked = scan("SELECT EXTRACT(YEAR FROM created_at), TRIM(LEADING '0' FROM name) FROM orders").masked;
        let relations = relations_from_text(&masked);
        assert_eq!(relations.references, vec![(None, "orders".to_string())]);
    }

    #[test]
    fn test_double_quoted_text_is_a_literal() {
        let sql = r#"SELECT id FROM orders WHERE note = "shipped from warehouse""#;
        assert!(validate(sql).is_ok());

        let relations = relations_from_text(&scan(sql).masked);
        assert_eq!(relations.references, vec![(None, "orders".to_string())]);
    }

    #[test]
    fn test_only_queries_pass() {
        let err = validate("EXPLAIN SELECT id FROM orders").unwrap_err();
        assert!(matches!(err, QueryError::UnsafeSql(_)));
        assert!(err.to_string().starts_with("unsafe SQL rejected"));
    }

    #[test]
    fn test_extract_refs_handles_lists_and_aliases() {
        let refs = extract_table_refs("select * from a x, b as y join c on 1=1 where z in (1, 2)");
        assert_eq!(refs, vec!["a", "b", "c"]);
    }
}
