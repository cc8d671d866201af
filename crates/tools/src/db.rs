//! The `postgres_admin` tool: SQL execution, schema dumps, EXPLAIN
//! ANALYZE, and activity inspection against an operator-supplied
//! connection string.

use std::time::Duration;

use async_trait::async_trait;
use ghost_domain::chat::ToolDefinition;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Column, Row, TypeInfo};

use crate::{opt_str, require_str, Tool};

/// Rows rendered per result set.
const ROW_CAP: usize = 50;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct PostgresAdminTool {
    /// Fallback connection URI (`--default-db`).
    pub default_db: String,
}

impl PostgresAdminTool {
    async fn connect(&self, conn: &str) -> Result<sqlx::PgPool, String> {
        let connect = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(conn);
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(pool)) => Ok(pool),
            Ok(Err(e)) => Err(format!("Error: connection failed: {e}")),
            Err(_) => Err("Error: connection timed out.".into()),
        }
    }

    async fn run_sql(&self, conn: &str, sql: &str) -> String {
        let pool = match self.connect(conn).await {
            Ok(p) => p,
            Err(e) => return e,
        };

        let rows = match sqlx::query(sql).fetch_all(&pool).await {
            Ok(rows) => rows,
            Err(e) => return format!("Error: query failed: {e}"),
        };

        if rows.is_empty() {
            return "Query executed. 0 rows returned.".into();
        }

        let columns: Vec<String> = rows[0]
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let mut out = vec![columns.join(" | ")];

        for row in rows.iter().take(ROW_CAP) {
            let rendered: Vec<String> = (0..columns.len()).map(|i| render_cell(row, i)).collect();
            out.push(rendered.join(" | "));
        }
        if rows.len() > ROW_CAP {
            out.push(format!("... [{} more rows truncated]", rows.len() - ROW_CAP));
        }
        out.join("\n")
    }
}

/// Best-effort textual rendering of one cell. The DBA surface cares about
/// readability, not type fidelity.
fn render_cell(row: &sqlx::postgres::PgRow, idx: usize) -> String {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.unwrap_or_else(|| "NULL".into());
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into());
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into());
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(|b| b.to_string()).unwrap_or_else(|| "NULL".into());
    }
    format!("<{}>", row.column(idx).type_info().name())
}

#[async_trait]
impl Tool for PostgresAdminTool {
    fn name(&self) -> &'static str {
        "postgres_admin"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "postgres_admin".into(),
            description: "MANDATORY for executing SQL queries, fetching schemas, running EXPLAIN \
                          ANALYZE, and checking active queries in a PostgreSQL database."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["query", "schema", "explain_analyze", "activity"],
                        "description": "'query' (run sql), 'schema' (dump public schema), \
                                        'explain_analyze' (run EXPLAIN ANALYZE), 'activity' \
                                        (check pg_stat_activity)."
                    },
                    "connection_string": {
                        "type": "string",
                        "description": "The PostgreSQL connection URI."
                    },
                    "query": {
                        "type": "string",
                        "description": "The SQL to execute. Required for 'query' and 'explain_analyze'."
                    },
                    "table_name": {
                        "type": "string",
                        "description": "Optional table name to filter the 'schema' action."
                    }
                },
                "required": ["action", "connection_string"]
            }),
        }
    }

    fn condensed(&self) -> bool {
        true
    }

    async fn run(&self, args: Value) -> String {
        let action = match require_str(&args, "action") {
            Ok(a) => a,
            Err(e) => return e,
        };
        let conn = opt_str(&args, "connection_string")
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(&self.default_db)
            .to_string();

        tracing::info!(action, "postgres_admin");
        match action {
            "query" => match require_str(&args, "query") {
                Ok(sql) => self.run_sql(&conn, sql).await,
                Err(e) => e,
            },
            "explain_analyze" => match require_str(&args, "query") {
                Ok(sql) => {
                    let sql = format!("EXPLAIN ANALYZE {sql}");
                    self.run_sql(&conn, &sql).await
                }
                Err(e) => e,
            },
            "schema" => {
                let filter = opt_str(&args, "table_name")
                    .map(|t| format!(" AND table_name = '{}'", t.replace('\'', "''")))
                    .unwrap_or_default();
                let sql = format!(
                    "SELECT table_name, column_name, data_type, is_nullable \
                     FROM information_schema.columns \
                     WHERE table_schema = 'public'{filter} \
                     ORDER BY table_name, ordinal_position"
                );
                self.run_sql(&conn, &sql).await
            }
            "activity" => {
                self.run_sql(
                    &conn,
                    "SELECT pid::text, state, usename::text, query \
                     FROM pg_stat_activity WHERE state IS NOT NULL",
                )
                .await
            }
            other => format!("Error: Unknown action '{other}'"),
        }
    }
}
