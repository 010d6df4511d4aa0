//! Per-row validation against field specs.

use chrono::{Datelike, Utc};
use thiserror::Error;

use crate::coerce::{clean_cell, parse_bool, parse_date_with_pivot, parse_numeric, DEFAULT_PIVOT};
use crate::header::HeaderIndex;
use crate::schema::{CellValue, FieldSpec, FieldType, ValidatedRow};

/// Why a row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("missing required column {column}")]
    MissingColumn { column: String },
    #[error("{column} is required but empty")]
    EmptyRequired { column: String },
    #[error("{column}: {value:?} is not a valid {expected}")]
    InvalidValue {
        column: String,
        value: String,
        expected: FieldType,
    },
    #[error("{column}: {value:?} is not one of {allowed}")]
    NotInEnum {
        column: String,
        value: String,
        allowed: String,
    },
}

impl RowError {
    pub fn column(&self) -> &str {
        match self {
            Self::MissingColumn { column }
            | Self::EmptyRequired { column }
            | Self::InvalidValue { column, .. }
            | Self::NotInEnum { column, .. } => column,
        }
    }
}

/// Validation settings shared by every row of one upload.
#[derive(Debug, Clone, Copy)]
pub struct RowValidator<'a> {
    specs: &'a [FieldSpec],
    header: &'a HeaderIndex,
    pivot: i32,
    current_year: i32,
}

impl<'a> RowValidator<'a> {
    pub fn new(specs: &'a [FieldSpec], header: &'a HeaderIndex) -> Self {
        Self {
            specs,
            header,
            pivot: DEFAULT_PIVOT,
            current_year: Utc::now().year(),
        }
    }

    pub fn with_pivot(mut self, pivot: i32) -> Self {
        self.pivot = pivot;
        self
    }

    pub fn with_current_year(mut self, year: i32) -> Self {
        self.current_year = year;
        self
    }

    /// Validate a row, stopping at the first problem.
    pub fn validate(&self, line: u64, record: &[&str]) -> Result<ValidatedRow, RowError> {
        let mut values = Vec::with_capacity(self.specs.len());
        for spec in self.specs {
            values.push((spec.column().to_string(), self.check_field(spec, record)?));
        }
        Ok(ValidatedRow {
            line,
            values,
            raw: record.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Validate a row and collect every problem, for previews.
    pub fn validate_complete(&self, record: &[&str]) -> Vec<RowError> {
        self.specs
            .iter()
            .filter_map(|spec| self.check_field(spec, record).err())
            .collect()
    }

    fn check_field(&self, spec: &FieldSpec, record: &[&str]) -> Result<CellValue, RowError> {
        let raw = self.header.get(&spec.name).and_then(|idx| record.get(idx));
        let Some(raw) = raw else {
            if spec.required {
                return Err(RowError::MissingColumn {
                    column: spec.name.clone(),
                });
            }
            return Ok(CellValue::Null);
        };

        let mut value = clean_cell(raw);
        if value.is_empty() {
            if spec.required && !spec.allow_empty {
                return Err(RowError::EmptyRequired {
                    column: spec.name.clone(),
                });
            }
            return Ok(empty_value(spec));
        }

        if let Some(normalize) = &spec.normalizer {
            value = normalize(&value);
        }

        match self.coerce(spec, &value) {
            Ok(cell) => Ok(cell),
            Err(e) if spec.required => Err(e),
            // optional columns tolerate junk and store NULL
            Err(_) => Ok(CellValue::Null),
        }
    }

    fn coerce(&self, spec: &FieldSpec, value: &str) -> Result<CellValue, RowError> {
        let invalid = || RowError::InvalidValue {
            column: spec.name.clone(),
            value: value.to_string(),
            expected: spec.field_type,
        };
        match spec.field_type {
            FieldType::Text => Ok(CellValue::Text(value.to_string())),
            FieldType::Enum => spec
                .enum_values
                .iter()
                .find(|allowed| allowed.eq_ignore_ascii_case(value))
                .map(|allowed| CellValue::Text(allowed.clone()))
                .ok_or_else(|| RowError::NotInEnum {
                    column: spec.name.clone(),
                    value: value.to_string(),
                    allowed: spec.enum_values.join(", "),
                }),
            FieldType::Date => parse_date_with_pivot(value, self.pivot, self.current_year)
                .map(CellValue::Date)
                .ok_or_else(invalid),
            FieldType::Numeric => parse_numeric(value).map(CellValue::Numeric).ok_or_else(invalid),
            FieldType::Bool => parse_bool(value).map(CellValue::Bool).ok_or_else(invalid),
        }
    }
}

fn empty_value(spec: &FieldSpec) -> CellValue {
    match spec.field_type {
        FieldType::Text | FieldType::Enum if spec.allow_empty => CellValue::Text(String::new()),
        _ => CellValue::Null,
    }
}
