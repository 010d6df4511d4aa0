//! Audit ledger types.
//!
//! Every mutating action produces exactly one append-only entry. Severity is a
//! pure function of the action; callers cannot override it. Corrections are
//! new entries that point at the old one through `related_entry_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Actions and severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Upload,
    Rollback,
    CellEdit,
    BulkEdit,
    RowDelete,
    RowRestore,
    TableReset,
    TemplateCreate,
    TemplateUpdate,
    TemplateDelete,
}

impl AuditAction {
    pub const ALL: [AuditAction; 10] = [
        Self::Upload,
        Self::Rollback,
        Self::CellEdit,
        Self::BulkEdit,
        Self::RowDelete,
        Self::RowRestore,
        Self::TableReset,
        Self::TemplateCreate,
        Self::TemplateUpdate,
        Self::TemplateDelete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Rollback => "rollback",
            Self::CellEdit => "cell_edit",
            Self::BulkEdit => "bulk_edit",
            Self::RowDelete => "row_delete",
            Self::RowRestore => "row_restore",
            Self::TableReset => "table_reset",
            Self::TemplateCreate => "template_create",
            Self::TemplateUpdate => "template_update",
            Self::TemplateDelete => "template_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::TableReset => Severity::Critical,
            Self::Upload | Self::Rollback | Self::BulkEdit | Self::RowDelete => Severity::High,
            Self::TemplateCreate | Self::TemplateUpdate | Self::TemplateDelete => Severity::Low,
            Self::CellEdit | Self::RowRestore => Severity::Medium,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Who performed an action, as reported by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        Self::user("system")
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Parameters for one ledger write, built up fluently.
#[derive(Debug, Clone, PartialEq)]
pub struct LogAuditParams {
    pub action: AuditAction,
    pub table_key: String,
    pub actor: Actor,
    pub row_key: Option<String>,
    pub column_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub row_data: Option<serde_json::Value>,
    pub rows_affected: Option<i64>,
    pub upload_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub related_entry_id: Option<i64>,
    pub reason: Option<String>,
}

impl LogAuditParams {
    pub fn new(action: AuditAction, table_key: impl Into<String>) -> Self {
        Self {
            action,
            table_key: table_key.into(),
            actor: Actor::default(),
            row_key: None,
            column_name: None,
            old_value: None,
            new_value: None,
            row_data: None,
            rows_affected: None,
            upload_id: None,
            batch_id: None,
            related_entry_id: None,
            reason: None,
        }
    }

    pub fn with_actor(mut self, actor: &Actor) -> Self {
        self.actor = actor.clone();
        self
    }

    /// Record a single-cell change.
    pub fn with_change(
        mut self,
        row_key: impl Into<String>,
        column: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
    ) -> Self {
        self.row_key = Some(row_key.into());
        self.column_name = Some(column.into());
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub fn with_row(mut self, row: serde_json::Value) -> Self {
        self.row_data = Some(row);
        self
    }

    pub fn with_rows_affected(mut self, n: u64) -> Self {
        self.rows_affected = Some(i64::try_from(n).unwrap_or(i64::MAX));
        self
    }

    pub fn with_upload(mut self, upload_id: Uuid) -> Self {
        self.upload_id = Some(upload_id);
        self
    }

    pub fn with_batch(mut self, batch_id: Uuid) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn related_to(mut self, entry_id: i64) -> Self {
        self.related_entry_id = Some(entry_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn into_entry(self) -> NewAuditEntry {
        NewAuditEntry {
            severity: self.action.severity(),
            params: self,
        }
    }
}

/// A ledger write with its derived severity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub params: LogAuditParams,
    pub severity: Severity,
}

/// A persisted ledger entry. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: AuditAction,
    pub severity: Severity,
    pub table_key: String,
    pub user: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub row_key: Option<String>,
    pub column_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub row_data: Option<serde_json::Value>,
    pub rows_affected: Option<i64>,
    pub upload_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub related_entry_id: Option<i64>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn from_new(id: i64, new: NewAuditEntry, created_at: DateTime<Utc>) -> Self {
        let p = new.params;
        Self {
            id,
            action: p.action,
            severity: new.severity,
            table_key: p.table_key,
            user: p.actor.user,
            ip: p.actor.ip,
            user_agent: p.actor.user_agent,
            row_key: p.row_key,
            column_name: p.column_name,
            old_value: p.old_value,
            new_value: p.new_value,
            row_data: p.row_data,
            rows_affected: p.rows_affected,
            upload_id: p.upload_id,
            batch_id: p.batch_id,
            related_entry_id: p.related_entry_id,
            reason: p.reason,
            created_at,
        }
    }

    /// Column names matching [`to_csv_record`](Self::to_csv_record).
    pub const CSV_HEADER: [&'static str; 18] = [
        "id",
        "created_at",
        "action",
        "severity",
        "table",
        "user",
        "ip",
        "user_agent",
        "row_key",
        "column",
        "old_value",
        "new_value",
        "row_data",
        "rows_affected",
        "upload_id",
        "batch_id",
        "related_entry_id",
        "reason",
    ];

    pub fn to_csv_record(&self) -> Vec<String> {
        fn opt<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        vec![
            self.id.to_string(),
            self.created_at.to_rfc3339(),
            self.action.to_string(),
            self.severity.to_string(),
            self.table_key.clone(),
            opt(&self.user),
            opt(&self.ip),
            opt(&self.user_agent),
            opt(&self.row_key),
            opt(&self.column_name),
            opt(&self.old_value),
            opt(&self.new_value),
            opt(&self.row_data),
            opt(&self.rows_affected),
            opt(&self.upload_id),
            opt(&self.batch_id),
            opt(&self.related_entry_id),
            opt(&self.reason),
        ]
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Default page size for ledger queries.
pub const DEFAULT_PAGE_SIZE: i64 = 50;
/// Largest page a paginated query may request.
pub const MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub severity: Option<Severity>,
    pub table_key: Option<String>,
    pub upload_id: Option<Uuid>,
    pub user: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub search_text: Option<String>,
    /// `None` means unbounded (exports).
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditFilter {
    /// A paginated filter with the limit clamped to [`MAX_PAGE_SIZE`].
    pub fn page(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: Some(limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)),
            offset: Some(offset.unwrap_or(0).max(0)),
            ..Default::default()
        }
    }

    pub fn for_upload(upload_id: Uuid) -> Self {
        Self {
            upload_id: Some(upload_id),
            ..Default::default()
        }
    }

    /// Whether an entry satisfies every set predicate (ignores paging).
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.action.map_or(true, |a| entry.action == a)
            && self.severity.map_or(true, |s| entry.severity == s)
            && self
                .table_key
                .as_ref()
                .map_or(true, |t| entry.table_key.eq_ignore_ascii_case(t))
            && self.upload_id.map_or(true, |u| entry.upload_id == Some(u))
            && self
                .user
                .as_ref()
                .map_or(true, |u| entry.user.as_deref() == Some(u.as_str()))
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
            && self.search_text.as_ref().map_or(true, |needle| {
                let needle = needle.to_lowercase();
                entry
                    .to_csv_record()
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_total_and_fixed() {
        assert_eq!(AuditAction::TableReset.severity(), Severity::Critical);
        for a in [
            AuditAction::Upload,
            AuditAction::Rollback,
            AuditAction::BulkEdit,
            AuditAction::RowDelete,
        ] {
            assert_eq!(a.severity(), Severity::High, "{a}");
        }
        for a in [
            AuditAction::TemplateCreate,
            AuditAction::TemplateUpdate,
            AuditAction::TemplateDelete,
        ] {
            assert_eq!(a.severity(), Severity::Low, "{a}");
        }
        assert_eq!(AuditAction::CellEdit.severity(), Severity::Medium);
        assert_eq!(AuditAction::RowRestore.severity(), Severity::Medium);
    }

    #[test]
    fn action_names_round_trip() {
        for a in AuditAction::ALL {
            assert_eq!(AuditAction::parse(a.as_str()), Some(a));
        }
        assert_eq!(AuditAction::parse("login"), None);
    }

    #[test]
    fn into_entry_derives_severity() {
        let entry = LogAuditParams::new(AuditAction::CellEdit, "vendors")
            .with_change("42", "name", Some("Acme".into()), Some("ACME".into()))
            .into_entry();
        assert_eq!(entry.severity, Severity::Medium);
        assert_eq!(entry.params.column_name.as_deref(), Some("name"));
    }

    #[test]
    fn page_clamps_limit() {
        assert_eq!(AuditFilter::page(Some(10_000), None).limit, Some(MAX_PAGE_SIZE));
        assert_eq!(AuditFilter::page(None, Some(-5)).offset, Some(0));
        assert_eq!(AuditFilter::page(None, None).limit, Some(DEFAULT_PAGE_SIZE));
    }

    #[test]
    fn filter_matches_on_fields() {
        let upload = Uuid::new_v4();
        let entry = AuditEntry::from_new(
            1,
            LogAuditParams::new(AuditAction::Upload, "Vendors")
                .with_actor(&Actor::user("dana"))
                .with_upload(upload)
                .with_reason("monthly import")
                .into_entry(),
            Utc::now(),
        );

        assert!(AuditFilter::for_upload(upload).matches(&entry));
        assert!(!AuditFilter::for_upload(Uuid::new_v4()).matches(&entry));

        let by_table = AuditFilter {
            table_key: Some("vendors".into()),
            severity: Some(Severity::High),
            ..Default::default()
        };
        assert!(by_table.matches(&entry));

        let by_text = AuditFilter {
            search_text: Some("MONTHLY".into()),
            ..Default::default()
        };
        assert!(by_text.matches(&entry));
    }
}
