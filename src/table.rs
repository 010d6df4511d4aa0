//! A generic [`TableDefinition`] driven entirely by field specs.
//!
//! Useful for simple tables whose columns map one-to-one onto CSV fields.
//! Every statement is built from quoted identifiers and typed binds; rows are
//! tagged with the upload id in the `upload_id` column.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres};
use uuid::Uuid;

use crate::schema::{CellValue, FieldSpec, FieldType, TableDefinition, ValidatedRow};

/// Column every ingested row carries for rollback.
pub const UPLOAD_ID_COLUMN: &str = "upload_id";

pub struct SqlTable {
    key: String,
    table_name: String,
    unique_key_columns: Vec<String>,
    fields: Vec<FieldSpec>,
    copy_enabled: bool,
}

impl SqlTable {
    pub fn new(key: impl Into<String>, table_name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            key: key.into(),
            table_name: table_name.into(),
            unique_key_columns: Vec::new(),
            fields,
            copy_enabled: true,
        }
    }

    pub fn unique_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn without_copy(mut self) -> Self {
        self.copy_enabled = false;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn column_list(&self) -> String {
        std::iter::once(quote_ident(UPLOAD_ID_COLUMN))
            .chain(self.fields.iter().map(|f| quote_ident(f.column())))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn insert_sql(&self) -> String {
        let placeholders = (1..=self.fields.len() + 1)
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_ident(&self.table_name),
            self.column_list()
        )
    }

    fn copy_sql(&self) -> String {
        format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
            quote_ident(&self.table_name),
            self.column_list()
        )
    }
}

#[async_trait]
impl TableDefinition for SqlTable {
    fn key(&self) -> &str {
        &self.key
    }

    fn unique_key_columns(&self) -> &[String] {
        &self.unique_key_columns
    }

    fn field_specs(&self) -> &[FieldSpec] {
        &self.fields
    }

    async fn insert(
        &self,
        conn: &mut PgConnection,
        upload_id: Uuid,
        row: &ValidatedRow,
    ) -> Result<(), sqlx::Error> {
        let sql = self.insert_sql();
        let mut q = sqlx::query(&sql).bind(upload_id);
        for (spec, (_, value)) in self.fields.iter().zip(&row.values) {
            q = bind_cell(q, spec.field_type, value);
        }
        q.execute(conn).await?;
        Ok(())
    }

    fn supports_copy(&self) -> bool {
        self.copy_enabled
    }

    async fn copy(
        &self,
        conn: &mut PgConnection,
        upload_id: Uuid,
        rows: &[ValidatedRow],
    ) -> Result<u64, sqlx::Error> {
        let mut payload = String::with_capacity(rows.len() * 64);
        let upload = upload_id.to_string();
        for row in rows {
            payload.push_str(&upload);
            for (_, value) in &row.values {
                payload.push('\t');
                match value.to_copy_text() {
                    Some(text) => escape_copy_text(&text, &mut payload),
                    None => payload.push_str("\\N"),
                }
            }
            payload.push('\n');
        }

        let mut copy = conn.copy_in_raw(&self.copy_sql()).await?;
        let sent = copy.send(payload.into_bytes()).await.map(|_| ());
        if let Err(e) = sent {
            copy.abort(e.to_string()).await?;
            return Err(e);
        }
        copy.finish().await
    }

    async fn reset(&self, pool: &PgPool) -> Result<u64, sqlx::Error> {
        let sql = format!("DELETE FROM {}", quote_ident(&self.table_name));
        Ok(sqlx::query(&sql).execute(pool).await?.rows_affected())
    }

    async fn delete_by_upload_id(&self, pool: &PgPool, upload_id: Uuid) -> Result<u64, sqlx::Error> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(&self.table_name),
            quote_ident(UPLOAD_ID_COLUMN)
        );
        Ok(sqlx::query(&sql)
            .bind(upload_id)
            .execute(pool)
            .await?
            .rows_affected())
    }
}

/// Bind a cell with the SQL type its field declares, so NULLs stay typed.
pub fn bind_cell<'q>(
    q: Query<'q, Postgres, PgArguments>,
    field_type: FieldType,
    value: &'q CellValue,
) -> Query<'q, Postgres, PgArguments> {
    match (field_type, value) {
        (_, CellValue::Text(s)) => q.bind(s.as_str()),
        (_, CellValue::Date(d)) => q.bind(*d),
        (_, CellValue::Numeric(n)) => q.bind(*n),
        (_, CellValue::Bool(b)) => q.bind(*b),
        (FieldType::Date, CellValue::Null) => q.bind(None::<NaiveDate>),
        (FieldType::Numeric, CellValue::Null) => q.bind(None::<Decimal>),
        (FieldType::Bool, CellValue::Null) => q.bind(None::<bool>),
        (FieldType::Text | FieldType::Enum, CellValue::Null) => q.bind(None::<String>),
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Escape a value for `COPY ... (FORMAT text)`.
fn escape_copy_text(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}
