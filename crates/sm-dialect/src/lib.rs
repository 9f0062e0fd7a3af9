#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    #[serde(rename = "bigquery", alias = "big_query")]
    BigQuery,
    Athena,
}

impl Dialect {
    pub const ALL: [Dialect; 3] = [Dialect::Postgres, Dialect::BigQuery, Dialect::Athena];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Postgres => "postgresql",
            Self::BigQuery => "bigquery",
            Self::Athena => "athena",
        }
    }

    #[must_use]
    pub fn is_postgres(self) -> bool {
        matches!(self, Self::Postgres)
    }

    #[must_use]
    pub fn is_bigquery(self) -> bool {
        matches!(self, Self::BigQuery)
    }

    #[must_use]
    pub fn is_athena(self) -> bool {
        matches!(self, Self::Athena)
    }

    #[must_use]
    pub fn column_name_rules(self) -> ColumnNameRules {
        match self {
            // NAMEDATALEN - 1; longer names are silently truncated by postgres.
            Self::Postgres => ColumnNameRules {
                max_bytes: 63,
                allowed: "any characters except NUL",
            },
            Self::BigQuery => ColumnNameRules {
                max_bytes: 300,
                allowed: "letters, digits and underscores, not starting with a digit or a reserved prefix",
            },
            Self::Athena => ColumnNameRules {
                max_bytes: 255,
                allowed: "lowercase letters, digits and underscores",
            },
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = DialectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "bigquery" | "big_query" => Ok(Self::BigQuery),
            "athena" | "awsathena" => Ok(Self::Athena),
            _ => Err(DialectError::DatabaseNotSupported {
                dialect: value.to_owned(),
                feature: "sql generation".to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DialectError {
    #[error("database {dialect} is not supported for {feature}")]
    DatabaseNotSupported { dialect: String, feature: String },
    #[error("invalid column name {name:?} for {dialect}: {reason}")]
    InvalidColumnName {
        name: String,
        dialect: Dialect,
        reason: String,
    },
}

impl DialectError {
    #[must_use]
    pub fn not_supported(dialect: Dialect, feature: impl Into<String>) -> Self {
        Self::DatabaseNotSupported {
            dialect: dialect.name().to_owned(),
            feature: feature.into(),
        }
    }
}

#[must_use]
pub fn is_postgres(dialect: Dialect) -> bool {
    dialect.is_postgres()
}

#[must_use]
pub fn is_bigquery(dialect: Dialect) -> bool {
    dialect.is_bigquery()
}

#[must_use]
pub fn is_athena(dialect: Dialect) -> bool {
    dialect.is_athena()
}

// ── Quoting ─────────────────────────────────────────────────────────────

/// Quote an identifier (table, column or CTE name) for `dialect`.
///
/// Postgres and Athena wrap in double quotes and double any embedded double
/// quote. BigQuery wraps in backticks and backslash-escapes backslashes and
/// backticks.
#[must_use]
pub fn quote_identifier(dialect: Dialect, name: &str) -> String {
    match dialect {
        Dialect::Postgres | Dialect::Athena => format!("\"{}\"", name.replace('"', "\"\"")),
        Dialect::BigQuery => {
            let escaped = name.replace('\\', "\\\\").replace('`', "\\`");
            format!("`{escaped}`")
        }
    }
}

/// Quote a string literal for `dialect`.
///
/// Postgres and Athena use single quotes with embedded quotes doubled.
/// BigQuery uses a triple-double-quoted literal so newlines survive, with
/// backslashes and double quotes backslash-escaped.
#[must_use]
pub fn quote_string(dialect: Dialect, value: &str) -> String {
    match dialect {
        Dialect::Postgres | Dialect::Athena => format!("'{}'", value.replace('\'', "''")),
        Dialect::BigQuery => {
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"\"\"{escaped}\"\"\"")
        }
    }
}

// ── Literals ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SqlLiteral {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl From<bool> for SqlLiteral {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlLiteral {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<i32> for SqlLiteral {
    fn from(value: i32) -> Self {
        Self::Int64(i64::from(value))
    }
}

impl From<f64> for SqlLiteral {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for SqlLiteral {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for SqlLiteral {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

#[must_use]
pub fn render_literal(dialect: Dialect, literal: &SqlLiteral) -> String {
    match literal {
        SqlLiteral::Null => "NULL".to_owned(),
        SqlLiteral::Bool(value) => render_bool(dialect, *value),
        SqlLiteral::Int64(value) => value.to_string(),
        SqlLiteral::Float64(value) => render_float(dialect, *value),
        SqlLiteral::Utf8(value) => quote_string(dialect, value),
    }
}

fn render_bool(dialect: Dialect, value: bool) -> String {
    match (dialect, value) {
        (Dialect::BigQuery, true) => "TRUE".to_owned(),
        (Dialect::BigQuery, false) => "FALSE".to_owned(),
        (Dialect::Postgres | Dialect::Athena, true) => "true".to_owned(),
        (Dialect::Postgres | Dialect::Athena, false) => "false".to_owned(),
    }
}

fn render_float(dialect: Dialect, value: f64) -> String {
    let special = if value.is_nan() {
        Some("nan")
    } else if value == f64::INFINITY {
        Some("infinity")
    } else if value == f64::NEG_INFINITY {
        Some("-infinity")
    } else {
        None
    };

    match (dialect, special) {
        (Dialect::Postgres, Some(name)) => format!("cast('{name}' as double precision)"),
        (Dialect::BigQuery, Some(name)) => format!("cast('{name}' as FLOAT64)"),
        (Dialect::Athena, Some("nan")) => "nan()".to_owned(),
        (Dialect::Athena, Some("-infinity")) => "-infinity()".to_owned(),
        (Dialect::Athena, Some(_)) => "infinity()".to_owned(),
        // `{:?}` keeps a trailing `.0` so the literal stays a float.
        (Dialect::Postgres, None) => format!("cast({value:?} as double precision)"),
        (Dialect::BigQuery, None) => format!("cast({value:?} as FLOAT64)"),
        (Dialect::Athena, None) => format!("cast({value:?} as double)"),
    }
}

// ── DDL ─────────────────────────────────────────────────────────────────

/// Kind of persisted object a statement creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedKind {
    View,
    Table,
    TempTable,
}

#[must_use]
pub fn supports_temporary_tables(dialect: Dialect) -> bool {
    !dialect.is_athena()
}

/// Wrap `select_sql` in the statement that persists it as `name`.
pub fn create_statement(
    dialect: Dialect,
    kind: PersistedKind,
    name: &str,
    select_sql: &str,
) -> Result<String, DialectError> {
    let quoted = quote_identifier(dialect, name);
    let statement = match (kind, dialect) {
        (PersistedKind::View, _) => format!("create view {quoted} as {select_sql}"),
        (PersistedKind::Table, _) => format!("create table {quoted} as {select_sql}"),
        (PersistedKind::TempTable, Dialect::Postgres) => {
            format!("create temporary table {quoted} on commit drop as {select_sql}")
        }
        (PersistedKind::TempTable, Dialect::BigQuery) => {
            format!("create temporary table {quoted} as {select_sql}")
        }
        (PersistedKind::TempTable, Dialect::Athena) => {
            return Err(DialectError::not_supported(dialect, "temporary tables"));
        }
    };
    Ok(statement)
}

// ── Column names ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnNameRules {
    pub max_bytes: usize,
    pub allowed: &'static str,
}

static BIGQUERY_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|err| panic!("static regex: {err}"))
});

static ATHENA_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").unwrap_or_else(|err| panic!("static regex: {err}")));

const BIGQUERY_RESERVED_PREFIXES: [&str; 6] = [
    "_table_",
    "_file_",
    "_partition",
    "_row_timestamp",
    "__root__",
    "_colidentifier",
];

#[must_use]
pub fn is_valid_column_name(dialect: Dialect, name: &str) -> bool {
    validate_column_name(dialect, name).is_ok()
}

/// Check that `name` can be used as a column name on `dialect` before any
/// SQL is built with it.
pub fn validate_column_name(dialect: Dialect, name: &str) -> Result<(), DialectError> {
    let invalid = |reason: String| DialectError::InvalidColumnName {
        name: name.to_owned(),
        dialect,
        reason,
    };
    let rules = dialect.column_name_rules();

    if name.is_empty() {
        return Err(invalid("name is empty".to_owned()));
    }
    if name.len() > rules.max_bytes {
        return Err(invalid(format!(
            "name is {} bytes, limit is {}",
            name.len(),
            rules.max_bytes
        )));
    }

    let allowed = match dialect {
        Dialect::Postgres => !name.contains('\0'),
        Dialect::BigQuery => {
            let lowered = name.to_ascii_lowercase();
            if let Some(prefix) = BIGQUERY_RESERVED_PREFIXES
                .iter()
                .find(|prefix| lowered.starts_with(*prefix))
            {
                return Err(invalid(format!("reserved prefix {prefix:?}")));
            }
            BIGQUERY_COLUMN.is_match(name)
        }
        Dialect::Athena => ATHENA_COLUMN.is_match(name),
    };
    if !allowed {
        return Err(invalid(format!("allowed characters: {}", rules.allowed)));
    }
    Ok(())
}
