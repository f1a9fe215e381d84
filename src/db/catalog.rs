//! Catalog reflection
//!
//! Reads tables, columns, primary keys and foreign keys of one schema from
//! `information_schema`. Catalogs are built per attempt and never cached.

use crate::error::{QueryError, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlConnection;
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub const SUMMARY_MAX_COLUMNS: usize = 24;
pub const SUMMARY_MAX_FOREIGN_KEYS: usize = 5;
pub const SUMMARY_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub columns: Vec<ColumnInfo>,
    pub primary_keys: BTreeSet<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

/// Immutable reflection of one schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    pub schema_name: String,
    pub tables: BTreeMap<String, TableInfo>,
}

impl SchemaCatalog {
    pub fn new(schema_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Case-insensitive table lookup.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.keys().any(|t| t.eq_ignore_ascii_case(name))
    }

    /// Register a column, creating the table entry on first sight.
    pub fn add_column(&mut self, table: &str, column: &str, data_type: &str, is_primary: bool) {
        let entry = self.tables.entry(table.to_string()).or_default();
        entry.columns.push(ColumnInfo {
            name: column.to_string(),
            data_type: data_type.to_string(),
        });
        if is_primary {
            entry.primary_keys.insert(column.to_string());
        }
    }

    pub fn add_foreign_key(&mut self, table: &str, column: &str, ref_table: &str, ref_column: &str) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .foreign_keys
            .push(ForeignKey {
                column: column.to_string(),
                ref_table: ref_table.to_string(),
                ref_column: ref_column.to_string(),
            });
    }

    /// Bounded text description used only in prompts. Validation always
    /// consults the full catalog.
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.tables.len() + 1);
        lines.push("Available schema:".to_string());

        for (table, info) in &self.tables {
            let columns = info
                .columns
                .iter()
                .take(SUMMARY_MAX_COLUMNS)
                .map(|c| format!("{}:{}", c.name, c.data_type))
                .join(", ");

            let fk_info = if info.foreign_keys.is_empty() {
                String::new()
            } else {
                let fks = info
                    .foreign_keys
                    .iter()
                    .take(SUMMARY_MAX_FOREIGN_KEYS)
                    .map(|fk| format!("{}→{}.{}", fk.column, fk.ref_table, fk.ref_column))
                    .join(", ");
                format!(" [FK: {}]", fks)
            };

            lines.push(format!("- {}({}){}", table, columns, fk_info));
        }

        truncate_chars(&lines.join("\n"), SUMMARY_MAX_CHARS)
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Reflect `schema` over an open connection. All-or-nothing: any metadata
/// query failure is reported as a connection error.
pub async fn reflect_catalog(conn: &mut MySqlConnection, schema: &str) -> Result<SchemaCatalog> {
    let mut catalog = SchemaCatalog::new(schema);

    // CAST avoids VARBINARY-typed information_schema columns on MySQL 8.
    let columns = sqlx::query(
        r#"
        SELECT CAST(TABLE_NAME AS CHAR) AS table_name,
               CAST(COLUMN_NAME AS CHAR) AS column_name,
               CAST(DATA_TYPE AS CHAR) AS data_type,
               CAST(COLUMN_KEY AS CHAR) AS column_key
        FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA = ?
        ORDER BY TABLE_NAME, ORDINAL_POSITION
        "#,
    )
    .bind(schema)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| QueryError::Connection(format!("failed to reflect columns of {}: {}", schema, e)))?;

    for row in &columns {
        let table: String = row.try_get("table_name").map_err(reflect_err(schema))?;
        let column: String = row.try_get("column_name").map_err(reflect_err(schema))?;
        let data_type: String = row.try_get("data_type").map_err(reflect_err(schema))?;
        let key: Option<String> = row.try_get("column_key").map_err(reflect_err(schema))?;
        catalog.add_column(&table, &column, &data_type, key.as_deref() == Some("PRI"));
    }

    let foreign_keys = sqlx::query(
        r#"
        SELECT CAST(TABLE_NAME AS CHAR) AS table_name,
               CAST(COLUMN_NAME AS CHAR) AS column_name,
               CAST(REFERENCED_TABLE_NAME AS CHAR) AS ref_table,
               CAST(REFERENCED_COLUMN_NAME AS CHAR) AS ref_column
        FROM information_schema.KEY_COLUMN_USAGE
        WHERE TABLE_SCHEMA = ?
          AND REFERENCED_TABLE_SCHEMA = ?
          AND REFERENCED_TABLE_NAME IS NOT NULL
        ORDER BY TABLE_NAME, COLUMN_NAME
        "#,
    )
    .bind(schema)
    .bind(schema)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        QueryError::Connection(format!("failed to reflect foreign keys of {}: {}", schema, e))
    })?;

    for row in &foreign_keys {
        let table: String = row.try_get("table_name").map_err(reflect_err(schema))?;
        let column: String = row.try_get("column_name").map_err(reflect_err(schema))?;
        let ref_table: String = row.try_get("ref_table").map_err(reflect_err(schema))?;
        let ref_column: String = row.try_get("ref_column").map_err(reflect_err(schema))?;
        catalog.add_foreign_key(&table, &column, &ref_table, &ref_column);
    }

    debug!(schema, tables = catalog.tables.len(), "reflected catalog");
    Ok(catalog)
}

fn reflect_err(schema: &str) -> impl Fn(sqlx::Error) -> QueryError + '_ {
    move |e| QueryError::Connection(format!("malformed catalog row in {}: {}", schema, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_catalog() -> SchemaCatalog {
        let mut catalog = SchemaCatalog::new("shop");
        catalog.add_column("orders", "id", "int", true);
        catalog.add_column("orders", "customer_id", "int", false);
        catalog.add_column("customers", "id", "int", true);
        catalog.add_column("customers", "name", "varchar", false);
        catalog.add_foreign_key("orders", "customer_id", "customers", "id");
        catalog
    }

    #[test]
    fn test_summary_lists_columns_and_foreign_keys() {
        let summary = sample_catalog().summary();
        assert!(summary.starts_with("Available schema:"));
        assert!(summary.contains("- customers(id:int, name:varchar)"));
        assert!(summary.contains("- orders(id:int, customer_id:int) [FK: customer_id→customers.id]"));
    }

    #[test]
    fn test_summary_caps_columns_fks_and_length() {
        let mut catalog = SchemaCatalog::new("wide");
        for i in 0..40 {
            catalog.add_column("facts", &format!("c{}", i), "int", false);
        }
        for i in 0..8 {
            catalog.add_foreign_key("facts", &format!("c{}", i), "dim", "id");
        }
        let summary = catalog.summary();
        assert!(summary.contains("c23:int"));
        assert!(!summary.contains("c24:int"));
        assert!(summary.contains("c4→dim.id"));
        assert!(!summary.contains("c5→dim.id"));

        for t in 0..400 {
            catalog.add_column(&format!("table_{}", t), "value", "decimal", false);
        }
        assert!(catalog.summary().chars().count() <= SUMMARY_MAX_CHARS);
        // The full catalog is untouched by summarisation.
        assert_eq!(catalog.tables["facts"].columns.len(), 40);
    }

    #[test]
    fn test_table_lookup_is_case_insensitive() {
        let catalog = sample_catalog();
        assert!(catalog.has_table("ORDERS"));
        assert!(!catalog.has_table("payments"));
        assert_eq!(catalog.tables["orders"].primary_keys.len(), 1);
    }
}
