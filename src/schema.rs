//! Table contracts consumed by the ingestion engine.
//!
//! A [`TableDefinition`] describes one target table: its key, its columns and
//! the SQL capabilities the engine may call. The engine never writes
//! table-specific SQL itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// Optional per-column rewrite applied after cleaning and before type checks.
pub type Normalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Enum,
    Date,
    Numeric,
    Bool,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Enum => "enum",
            Self::Date => "date",
            Self::Numeric => "numeric",
            Self::Bool => "bool",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Some(Self::Text),
            "enum" => Some(Self::Enum),
            "date" => Some(Self::Date),
            "numeric" | "number" | "decimal" => Some(Self::Numeric),
            "bool" | "boolean" => Some(Self::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column specification.
///
/// If `required && !allow_empty`, an empty cell fails validation.
#[derive(Clone)]
pub struct FieldSpec {
    pub name: String,
    pub db_column: Option<String>,
    pub field_type: FieldType,
    pub required: bool,
    pub allow_empty: bool,
    pub enum_values: Vec<String>,
    pub normalizer: Option<Normalizer>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            db_column: None,
            field_type,
            required: false,
            allow_empty: false,
            enum_values: Vec::new(),
            normalizer: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    pub fn numeric(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Numeric)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bool)
    }

    pub fn one_of<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::new(name, FieldType::Enum);
        spec.enum_values = values.into_iter().map(Into::into).collect();
        spec
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    pub fn db_column(mut self, column: impl Into<String>) -> Self {
        self.db_column = Some(column.into());
        self
    }

    pub fn normalize<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.normalizer = Some(Arc::new(f));
        self
    }

    /// Column name used in SQL: the override if present, else the CSV name.
    pub fn column(&self) -> &str {
        self.db_column.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("name", &self.name)
            .field("db_column", &self.db_column)
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("allow_empty", &self.allow_empty)
            .field("enum_values", &self.enum_values)
            .field("normalizer", &self.normalizer.is_some())
            .finish()
    }
}

/// A typed, nullable cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Text(String),
    Date(NaiveDate),
    Numeric(Decimal),
    Bool(bool),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Render for the bulk-copy CSV stream. `None` is SQL NULL.
    pub fn to_copy_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => Some(s.clone()),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Self::Numeric(n) => Some(n.to_string()),
            Self::Bool(b) => Some(b.to_string()),
        }
    }
}

/// A row that passed validation, in field-spec order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedRow {
    /// 1-indexed line in the source file.
    pub line: u64,
    /// `(db column, value)` pairs in field-spec order.
    pub values: Vec<(String, CellValue)>,
    /// The raw cells as read, kept for reject reporting.
    pub raw: Vec<String>,
}

impl ValidatedRow {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    }
}

// ---------------------------------------------------------------------------
// TableDefinition
// ---------------------------------------------------------------------------

/// Capabilities of one ingestible table.
///
/// Every row written through this trait is tagged with the upload id so that
/// [`delete_by_upload_id`](TableDefinition::delete_by_upload_id) can reverse it.
#[async_trait]
pub trait TableDefinition: Send + Sync {
    /// Registry key, e.g. `"vendors"`.
    fn key(&self) -> &str;

    fn unique_key_columns(&self) -> &[String];

    fn field_specs(&self) -> &[FieldSpec];

    /// Insert one row inside the caller's transaction.
    async fn insert(
        &self,
        conn: &mut PgConnection,
        upload_id: Uuid,
        row: &ValidatedRow,
    ) -> Result<(), sqlx::Error>;

    fn supports_copy(&self) -> bool {
        false
    }

    /// Columns written by [`copy`](TableDefinition::copy), in stream order.
    fn copy_columns(&self) -> Vec<String> {
        self.field_specs().iter().map(|f| f.column().to_string()).collect()
    }

    /// Bulk-load a batch. All or nothing.
    async fn copy(
        &self,
        _conn: &mut PgConnection,
        _upload_id: Uuid,
        _rows: &[ValidatedRow],
    ) -> Result<u64, sqlx::Error> {
        Err(sqlx::Error::Protocol(format!(
            "table {} does not support bulk copy",
            self.key()
        )))
    }

    /// Remove every row in the table. Returns the number of rows removed.
    async fn reset(&self, pool: &PgPool) -> Result<u64, sqlx::Error>;

    fn supports_upload_delete(&self) -> bool {
        true
    }

    async fn delete_by_upload_id(&self, pool: &PgPool, upload_id: Uuid) -> Result<u64, sqlx::Error>;
}

impl fmt::Debug for dyn TableDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDefinition").field("key", &self.key()).finish()
    }
}

/// Required column names, lower-cased, in field order.
pub fn required_columns(specs: &[FieldSpec]) -> Vec<String> {
    specs
        .iter()
        .filter(|f| f.required)
        .map(|f| f.name.to_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Table definitions known to the engine, built once at startup.
#[derive(Default)]
pub struct TableRegistry {
    tables: HashMap<String, Arc<dyn TableDefinition>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table under its lower-cased key, replacing any previous one.
    pub fn register(&mut self, table: Arc<dyn TableDefinition>) -> &mut Self {
        self.tables.insert(table.key().to_lowercase(), table);
        self
    }

    pub fn with(mut self, table: Arc<dyn TableDefinition>) -> Self {
        self.register(table);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn TableDefinition>> {
        self.tables.get(&key.to_lowercase()).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tables.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
