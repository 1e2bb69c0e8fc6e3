use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Row as SqliteRow};
use serde_json::Value;
use tokio_rusqlite::Connection;

use super::backend::{DatabaseBackend, RecordId, Row};
use super::sanitize::quote_identifier;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
"#;

pub struct SqliteBackend {
  conn: Connection,
}

impl SqliteBackend {
  pub async fn new(path: &str) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };

    // Apply performance pragmas
    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(|e| e.into()))
      .await?;

    tracing::debug!(path, "SQLite backend opened");
    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:").await
  }

  async fn fetch(&self, sql: String, params: Vec<SqlValue>) -> Result<Vec<Row>, anyhow::Error> {
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
          out.push(row_to_map(row, &columns)?);
        }
        Ok(out)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn execute(&self, sql: String, params: Vec<SqlValue>) -> Result<u64, anyhow::Error> {
    self
      .conn
      .call(move |conn| {
        let changed = conn.execute(&sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
  async fn execute_batch(&self, sql: &str) -> Result<(), anyhow::Error> {
    let sql = sql.to_string();
    self
      .conn
      .call(move |conn| conn.execute_batch(&sql).map_err(|e| e.into()))
      .await?;
    Ok(())
  }

  async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, anyhow::Error> {
    self
      .fetch(sql.to_string(), params.iter().map(json_to_sql).collect())
      .await
  }

  async fn find_by(
    &self,
    table: &str,
    field: &str,
    value: &Value,
  ) -> Result<Option<Row>, anyhow::Error> {
    let sql = format!(
      "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
      quote_identifier(table)?,
      quote_identifier(field)?
    );
    let mut rows = self.fetch(sql, vec![json_to_sql(value)]).await?;
    Ok(rows.pop())
  }

  async fn find_many(&self, table: &str, ids: &[RecordId]) -> Result<Vec<Row>, anyhow::Error> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    // SQLite has no ORDER BY FIELD(), so spell the input order out as a CASE
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
    let order: Vec<String> = placeholders
      .iter()
      .enumerate()
      .map(|(pos, p)| format!("WHEN {} THEN {}", p, pos))
      .collect();
    let sql = format!(
      "SELECT * FROM {table} WHERE \"id\" IN ({ids}) ORDER BY CASE \"id\" {order} END",
      table = quote_identifier(table)?,
      ids = placeholders.join(", "),
      order = order.join(" "),
    );

    self
      .fetch(sql, ids.iter().map(|id| SqlValue::Integer(*id)).collect())
      .await
  }

  async fn insert(&self, table: &str, values: &Row) -> Result<RecordId, anyhow::Error> {
    let table = quote_identifier(table)?;
    let mut columns = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len());
    for (column, value) in values {
      columns.push(quote_identifier(column)?);
      params.push(json_to_sql(value));
    }

    let sql = if columns.is_empty() {
      format!("INSERT INTO {} DEFAULT VALUES", table)
    } else {
      let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
      format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
      )
    };

    self
      .conn
      .call(move |conn| {
        conn.execute(&sql, params_from_iter(params.iter()))?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn update(&self, table: &str, id: RecordId, values: &Row) -> Result<u64, anyhow::Error> {
    if values.is_empty() {
      return Ok(0);
    }

    let mut assignments = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len() + 1);
    for (pos, (column, value)) in values.iter().enumerate() {
      assignments.push(format!("{} = ?{}", quote_identifier(column)?, pos + 1));
      params.push(json_to_sql(value));
    }
    params.push(SqlValue::Integer(id));

    let sql = format!(
      "UPDATE {} SET {} WHERE \"id\" = ?{}",
      quote_identifier(table)?,
      assignments.join(", "),
      params.len()
    );
    self.execute(sql, params).await
  }

  async fn delete(&self, table: &str, id: RecordId) -> Result<u64, anyhow::Error> {
    let sql = format!("DELETE FROM {} WHERE \"id\" = ?1", quote_identifier(table)?);
    self.execute(sql, vec![SqlValue::Integer(id)]).await
  }
}

fn json_to_sql(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    other => SqlValue::Text(other.to_string()),
  }
}

fn row_to_map(row: &SqliteRow<'_>, columns: &[String]) -> rusqlite::Result<Row> {
  let mut map = Row::new();
  for (i, column) in columns.iter().enumerate() {
    let value = match row.get_ref(i)? {
      ValueRef::Null => Value::Null,
      ValueRef::Integer(n) => Value::from(n),
      ValueRef::Real(f) => serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null),
      ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    };
    map.insert(column.clone(), value);
  }
  Ok(map)
}
