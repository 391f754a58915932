//! MySQL pool wrapper.
//!
//! All statements bind canonical string parameters and all rows are read
//! back as strings (callers build `CAST(col AS CHAR)` select lists), so the
//! Value Codec is the single encode/decode path on both sides of the wire.
//!
//! MySQL errors 1062 (duplicate key) and 1451/1452 (foreign key) are
//! promoted to structured errors carrying the index/constraint name parsed
//! from the driver message; everything else surfaces unchanged.

use std::time::{Duration, Instant};

use sqlx::mysql::{MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, Row, Transaction};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

#[derive(Clone)]
pub struct SqlPool {
    code: String,
    pool: MySqlPool,
}

impl SqlPool {
    /// Connections are established lazily on first use; DSN parse errors
    /// still surface here at validation time.
    pub(crate) fn connect_lazy(code: &str, dsn: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy(dsn)
            .map_err(EngineError::Sql)?;
        Ok(Self { code: code.to_string(), pool })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub(crate) fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Execute a write statement.
    pub async fn exec(&self, sql: &str, params: &[Option<String>]) -> Result<ExecResult> {
        let started = Instant::now();
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.as_deref());
        }
        let result = query.execute(&self.pool).await.map_err(convert_sql_error)?;
        debug!(pool = %self.code, sql, rows = result.rows_affected(), "sql exec");
        crate::metrics::record_sql(&self.code, "exec", started.elapsed());
        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    /// Fetch all rows, every column as an optional string.
    pub async fn fetch_rows(
        &self,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<Vec<Vec<Option<String>>>> {
        let started = Instant::now();
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.as_deref());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(convert_sql_error)?;
        debug!(pool = %self.code, sql, rows = rows.len(), "sql fetch");
        crate::metrics::record_sql(&self.code, "fetch", started.elapsed());
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                values.push(row.try_get::<Option<String>, _>(i).map_err(EngineError::Sql)?);
            }
            out.push(values);
        }
        Ok(out)
    }

    /// Fetch the first column of the first row, if any.
    pub async fn fetch_value(
        &self,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<Option<String>> {
        let started = Instant::now();
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.as_deref());
        }
        let row = query.fetch_optional(&self.pool).await.map_err(convert_sql_error)?;
        crate::metrics::record_sql(&self.code, "fetch", started.elapsed());
        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>(0).map_err(EngineError::Sql)?),
            None => Ok(None),
        }
    }
}

/// Execute a write statement on an open transaction.
pub(crate) async fn exec_on_tx(
    tx: &mut Transaction<'static, MySql>,
    pool_code: &str,
    sql: &str,
    params: &[Option<String>],
) -> Result<ExecResult> {
    let started = Instant::now();
    let mut query = sqlx::query(sql);
    for param in params {
        query = query.bind(param.as_deref());
    }
    let result = query.execute(&mut **tx).await.map_err(convert_sql_error)?;
    debug!(pool = %pool_code, sql, rows = result.rows_affected(), "sql exec (tx)");
    crate::metrics::record_sql(pool_code, "exec", started.elapsed());
    Ok(ExecResult {
        rows_affected: result.rows_affected(),
        last_insert_id: result.last_insert_id(),
    })
}

/// Map driver errors to the structured taxonomy.
pub(crate) fn convert_sql_error(err: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(mysql) = db.try_downcast_ref::<MySqlDatabaseError>() {
            let number = mysql.number();
            let message = mysql.message().to_string();
            if number == 1062 {
                let index = capture(&message, " for key '", "'").unwrap_or_default();
                return EngineError::DuplicatedKey { index, message };
            }
            if number == 1451 || number == 1452 {
                let constraint = capture(&message, "CONSTRAINT `", "`").unwrap_or_default();
                return EngineError::ForeignKey { constraint, message };
            }
        }
    }
    EngineError::Sql(err)
}

fn capture(message: &str, start: &str, end: &str) -> Option<String> {
    let from = message.find(start)? + start.len();
    let rest = &message[from..];
    Some(rest[..rest.find(end)?].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_duplicate_key_index() {
        let msg = "Duplicate entry 'x' for key 'NameIndex'";
        assert_eq!(capture(msg, " for key '", "'").as_deref(), Some("NameIndex"));
    }

    #[test]
    fn test_capture_constraint_name() {
        let msg = "Cannot delete or update a parent row: a foreign key constraint fails \
                   (`db`.`Child`, CONSTRAINT `db:Child:Parent` FOREIGN KEY (`Parent`) \
                   REFERENCES `Parent` (`ID`))";
        assert_eq!(capture(msg, "CONSTRAINT `", "`").as_deref(), Some("db:Child:Parent"));
    }

    #[test]
    fn test_capture_missing_pattern() {
        assert_eq!(capture("no match here", " for key '", "'"), None);
    }
}
