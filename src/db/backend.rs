use async_trait::async_trait;
use serde_json::Value;

/// Primary key of every model table.
pub type RecordId = i64;

/// One result row, column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Abstract relational backend
///
/// Every model table has an integer `id` primary key. Connection lifecycle
/// is the implementation's business.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
  /// Run schema statements (no result rows, no parameters).
  async fn execute_batch(&self, sql: &str) -> Result<(), anyhow::Error>;

  /// Run an arbitrary parameterized query, `?` placeholders bound in order.
  async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, anyhow::Error>;

  /// Point lookup on any column, first match only.
  async fn find_by(
    &self,
    table: &str,
    field: &str,
    value: &Value,
  ) -> Result<Option<Row>, anyhow::Error>;

  /// Batch lookup by id. Rows come back in the order of `ids`; ids with no
  /// row are simply absent.
  async fn find_many(&self, table: &str, ids: &[RecordId]) -> Result<Vec<Row>, anyhow::Error>;

  /// Insert a row and return its id.
  async fn insert(&self, table: &str, values: &Row) -> Result<RecordId, anyhow::Error>;

  /// Update the given columns of one row, returning the affected row count.
  async fn update(&self, table: &str, id: RecordId, values: &Row) -> Result<u64, anyhow::Error>;

  /// Delete one row, returning the affected row count.
  async fn delete(&self, table: &str, id: RecordId) -> Result<u64, anyhow::Error>;
}
