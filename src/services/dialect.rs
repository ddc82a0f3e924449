//! SQL dialect rules consumed by the generator and the validator.
//!
//! - Identifier quoting: `"` (PostgreSQL, Druid), `` ` `` (MySQL, Doris)
//! - Boolean literals: `true`/`false` vs `1`/`0`
//! - Date-part extraction: `EXTRACT(.. FROM ..)`, `QUARTER(..)`, `TIME_EXTRACT(.., '..')`
//! - Syntax check statement: `EXPLAIN` vs `EXPLAIN PLAN FOR`

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};

use crate::error::AppError;
use crate::models::DatePart;

static PLAIN_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid identifier regex"));

/// Words that always need quoting when used as identifiers.
const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "cross", "date", "day", "default",
    "desc", "distinct", "else", "end", "from", "full", "group", "having", "in", "inner", "is",
    "join", "key", "left", "like", "limit", "month", "not", "null", "on", "or", "order",
    "outer", "quarter", "range", "right", "select", "table", "then", "time", "timestamp",
    "union", "user", "values", "when", "where", "year",
];

pub trait SqlDialect: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Unconditionally quote an identifier.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Identifier as it should appear in generated SQL; quoted only when needed.
    fn identifier(&self, ident: &str) -> String {
        if PLAIN_IDENTIFIER.is_match(ident) && !RESERVED.contains(&ident) {
            ident.to_string()
        } else {
            self.quote_identifier(ident)
        }
    }

    fn quote_string(&self, s: &str) -> String {
        quote_string_single(s)
    }

    fn format_bool(&self, b: bool) -> &'static str;

    /// Wrap an already rendered column expression in a date-part extraction.
    fn extract_date_part(&self, part: DatePart, expr: &str) -> String {
        format!("EXTRACT({} FROM {})", part.keyword(), expr)
    }

    /// Statement prefix for a plan-only syntax check.
    fn explain_prefix(&self) -> &'static str {
        "EXPLAIN"
    }

    /// Parser dialect used for the local syntax check.
    fn parser_dialect(&self) -> Box<dyn Dialect>;
}

pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

pub fn quote_string_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// MySQL-family string literal: backslash is an escape character too.
pub fn quote_string_backslash(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

pub fn format_bool_literal(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

pub fn format_bool_numeric(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl SqlDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        format_bool_literal(b)
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(PostgreSqlDialect {})
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl SqlDialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_backtick(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        quote_string_backslash(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        format_bool_numeric(b)
    }

    fn extract_date_part(&self, part: DatePart, expr: &str) -> String {
        format!("{}({})", part.keyword(), expr)
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(MySqlDialect {})
    }
}

/// Apache Doris; MySQL wire protocol and function names.
#[derive(Debug, Clone, Copy, Default)]
pub struct Doris;

impl SqlDialect for Doris {
    fn name(&self) -> &'static str {
        "doris"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_backtick(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        quote_string_backslash(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        format_bool_numeric(b)
    }

    fn extract_date_part(&self, part: DatePart, expr: &str) -> String {
        format!("{}({})", part.keyword(), expr)
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(MySqlDialect {})
    }
}

/// Apache Druid SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Druid;

impl SqlDialect for Druid {
    fn name(&self) -> &'static str {
        "druid"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        format_bool_literal(b)
    }

    fn extract_date_part(&self, part: DatePart, expr: &str) -> String {
        format!("TIME_EXTRACT({}, '{}')", expr, part.keyword())
    }

    fn explain_prefix(&self) -> &'static str {
        "EXPLAIN PLAN FOR"
    }

    fn parser_dialect(&self) -> Box<dyn Dialect> {
        Box::new(GenericDialect {})
    }
}

/// Look up a dialect by name, failing fast on anything unsupported.
pub fn dialect_for(name: &str) -> Result<Box<dyn SqlDialect>, AppError> {
    match name.trim().to_lowercase().as_str() {
        "postgresql" | "postgres" | "pg" => Ok(Box::new(Postgres)),
        "mysql" => Ok(Box::new(MySql)),
        "doris" => Ok(Box::new(Doris)),
        "druid" => Ok(Box::new(Druid)),
        other => Err(AppError::UnsupportedDialect(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_lookup() {
        assert_eq!(dialect_for("PostgreSQL").unwrap().name(), "postgresql");
        assert_eq!(dialect_for("pg").unwrap().name(), "postgresql");
        assert_eq!(dialect_for("doris").unwrap().name(), "doris");
        let err = dialect_for("oracle").unwrap_err();
        assert!(matches!(err, AppError::UnsupportedDialect(ref d) if d == "oracle"));
    }

    #[test]
    fn test_identifier_quoting_only_when_needed() {
        let pg = Postgres;
        assert_eq!(pg.identifier("fund_type"), "fund_type");
        assert_eq!(pg.identifier("Fund Type"), "\"Fund Type\"");
        assert_eq!(pg.identifier("order"), "\"order\"");
        assert_eq!(pg.identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(MySql.identifier("user"), "`user`");
    }

    #[test]
    fn test_string_escaping() {
        assert_eq!(Postgres.quote_string("O'Brien"), "'O''Brien'");
        assert_eq!(Postgres.quote_string(r"a\b"), r"'a\b'");
        assert_eq!(MySql.quote_string(r"a\'b"), r"'a\\''b'");
    }

    #[test]
    fn test_date_part_extraction() {
        assert_eq!(
            Postgres.extract_date_part(DatePart::Quarter, "funds.launch_date"),
            "EXTRACT(QUARTER FROM funds.launch_date)"
        );
        assert_eq!(MySql.extract_date_part(DatePart::Year, "launch_date"), "YEAR(launch_date)");
        assert_eq!(
            Druid.extract_date_part(DatePart::Month, "__time"),
            "TIME_EXTRACT(__time, 'MONTH')"
        );
    }

    #[test]
    fn test_boolean_literals() {
        assert_eq!(Postgres.format_bool(true), "true");
        assert_eq!(Druid.format_bool(false), "false");
        assert_eq!(MySql.format_bool(true), "1");
        assert_eq!(Doris.format_bool(false), "0");
    }
}
