//! Tenant database connections
//!
//! One connection is opened per schema attempt and closed when the attempt
//! ends. Connections are never shared between attempts or requests.

use crate::db::catalog::{self, SchemaCatalog};
use crate::db::executor::{self, QueryOutput};
use crate::error::{QueryError, Result};
use crate::org::{ConnectionParams, OrgContext};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{ConnectOptions, Connection, Row};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Live read-only session on one schema.
#[async_trait]
pub trait SchemaConnection: Send {
    async fn reflect_catalog(&mut self, schema: &str) -> Result<SchemaCatalog>;

    async fn execute(&mut self, sql: &str) -> Result<QueryOutput>;

    /// Release the underlying connection.
    async fn close(self: Box<Self>);
}

/// Opens schema connections and answers the batched metadata query behind
/// the schema token index.
#[async_trait]
pub trait SchemaConnector: Send + Sync {
    async fn connect(&self, org: &OrgContext, schema: &str) -> Result<Box<dyn SchemaConnection>>;

    /// (schema, table, column) for every column of the given schemas.
    async fn column_names(
        &self,
        org: &OrgContext,
        schemas: &[String],
    ) -> Result<Vec<(String, String, String)>>;
}

#[derive(Debug, Clone)]
pub struct MySqlConnector {
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(connect_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            query_timeout,
        }
    }

    fn options(params: &ConnectionParams, database: &str) -> Result<MySqlConnectOptions> {
        if !params.driver.to_lowercase().starts_with("mysql") {
            return Err(QueryError::Configuration(format!(
                "unsupported driver '{}': only MySQL schemas are supported",
                params.driver
            )));
        }

        let mut options = MySqlConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.username)
            .password(&params.password)
            .database(database)
            .charset(params.options.get("charset").map(String::as_str).unwrap_or("utf8mb4"));

        if let Some(mode) = params.options.get("ssl_mode") {
            let mode = MySqlSslMode::from_str(mode)
                .map_err(|e| QueryError::Configuration(format!("invalid ssl_mode: {}", e)))?;
            options = options.ssl_mode(mode);
        }

        Ok(options.disable_statement_logging())
    }

    async fn open(&self, params: &ConnectionParams, database: &str) -> Result<MySqlConnection> {
        let options = Self::options(params, database)?;
        let mut conn = tokio::time::timeout(self.connect_timeout, options.connect())
            .await
            .map_err(|_| {
                QueryError::Connection(format!(
                    "connecting to {} timed out after {}s",
                    database,
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| QueryError::Connection(format!("cannot connect to {}: {}", database, e)))?;

        if let Err(e) = sqlx::query("SET SESSION TRANSACTION READ ONLY")
            .execute(&mut conn)
            .await
        {
            close_logged(conn, database).await;
            return Err(QueryError::Connection(format!(
                "cannot mark session read-only on {}: {}",
                database, e
            )));
        }
        Ok(conn)
    }
}

#[async_trait]
impl SchemaConnector for MySqlConnector {
    async fn connect(&self, org: &OrgContext, schema: &str) -> Result<Box<dyn SchemaConnection>> {
        let conn = self.open(&org.connection, schema).await?;
        debug!(org_id = %org.org_id, schema, "opened schema connection");
        Ok(Box::new(MySqlSchemaConnection {
            conn,
            schema: schema.to_string(),
            query_timeout: self.query_timeout,
        }))
    }

    async fn column_names(
        &self,
        org: &OrgContext,
        schemas: &[String],
    ) -> Result<Vec<(String, String, String)>> {
        if schemas.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.open(&org.connection, &org.connection.database).await?;

        let placeholders = vec!["?"; schemas.len()].join(", ");
        let sql = format!(
            "SELECT CAST(TABLE_SCHEMA AS CHAR) AS s, CAST(TABLE_NAME AS CHAR) AS t, \
             CAST(COLUMN_NAME AS CHAR) AS c \
             FROM information_schema.COLUMNS WHERE TABLE_SCHEMA IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for schema in schemas {
            query = query.bind(schema);
        }

        let fetched = tokio::time::timeout(self.query_timeout, query.fetch_all(&mut conn)).await;
        close_logged(conn, &org.connection.database).await;
        let rows = fetched
            .map_err(|_| QueryError::Connection("schema index query timed out".to_string()))?
            .map_err(|e| QueryError::Connection(format!("schema index query failed: {}", e)))?;

        // information_schema may report schema names in a different case.
        let canonical: HashMap<String, &String> =
            schemas.iter().map(|s| (s.to_lowercase(), s)).collect();
        let mut out = Vec::with_capacity(rows.len());
        let mut unknown = HashSet::new();
        for row in rows {
            let schema: String = row.try_get("s")?;
            let table: String = row.try_get("t")?;
            let column: String = row.try_get("c")?;
            match canonical.get(&schema.to_lowercase()) {
                Some(name) => out.push(((*name).clone(), table, column)),
                None => {
                    unknown.insert(schema);
                }
            }
        }
        if !unknown.is_empty() {
            warn!(?unknown, "metadata rows for schemas outside the allowed list ignored");
        }
        Ok(out)
    }
}

pub struct MySqlSchemaConnection {
    conn: MySqlConnection,
    schema: String,
    query_timeout: Duration,
}

#[async_trait]
impl SchemaConnection for MySqlSchemaConnection {
    async fn reflect_catalog(&mut self, schema: &str) -> Result<SchemaCatalog> {
        tokio::time::timeout(self.query_timeout, catalog::reflect_catalog(&mut self.conn, schema))
            .await
            .map_err(|_| QueryError::Connection(format!("reflecting {} timed out", schema)))?
    }

    async fn execute(&mut self, sql: &str) -> Result<QueryOutput> {
        executor::execute_readonly(&mut self.conn, sql, self.query_timeout).await
    }

    async fn close(self: Box<Self>) {
        let this = *self;
        close_logged(this.conn, &this.schema).await;
    }
}

async fn close_logged(conn: MySqlConnection, database: &str) {
    if let Err(e) = conn.close().await {
        warn!(database, error = %e, "closing connection failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(driver: &str) -> ConnectionParams {
        ConnectionParams {
            driver: driver.to_string(),
            host: "db.internal".into(),
            port: 3306,
            username: "reader".into(),
            password: "pw".into(),
            database: "main".into(),
            options: HashMap::new(),
        }
    }

    #[test]
    fn test_only_mysql_drivers_are_accepted() {
        assert!(MySqlConnector::options(&params("mysql+pymysql"), "sales").is_ok());
        assert!(matches!(
            MySqlConnector::options(&params("postgres"), "sales"),
            Err(QueryError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_ssl_mode_is_rejected() {
        let mut p = params("mysql");
        p.options.insert("ssl_mode".into(), "sometimes".into());
        assert!(MySqlConnector::options(&p, "sales").is_err());
    }
}
