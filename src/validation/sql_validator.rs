use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::parser::Parser;

use crate::models::{IssueKind, ValidationIssue};
use crate::services::dialect::SqlDialect;

/// Alias given to the wrapped statement during trial execution
pub const TRIAL_ALIAS: &str = "trial_q";

/// String literals, quoted identifiers and comments. Removed before the
/// keyword scan so `'drop me'` or `"update"` never trip it.
static QUOTED_OR_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^'\\]|\\.|'')*'|"(?:[^"]|"")*"|`[^`]*`|--[^\n]*|/\*[\s\S]*?\*/"#)
        .expect("valid quoted-text regex")
});

static WRITE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|merge|upsert|create|alter|drop|truncate|grant|revoke|rename|call|exec|execute|copy|vacuum|attach|detach)\b",
    )
    .expect("valid keyword regex")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Local, connection-free checks on generated or corrected SQL
pub struct SqlValidator;

impl SqlValidator {
    /// Reject statements carrying DDL/DML keywords. Matching is on whole
    /// words, so identifiers like `updated_at` pass.
    pub fn check_read_only(sql: &str) -> Result<(), ValidationIssue> {
        let stripped = QUOTED_OR_COMMENT.replace_all(sql, " ");
        match WRITE_KEYWORD.find(&stripped) {
            Some(m) => Err(ValidationIssue::new(
                IssueKind::NotReadOnly,
                format!(
                    "{} statements are not allowed. Only SELECT queries are permitted.",
                    m.as_str().to_uppercase()
                ),
            )),
            None => Ok(()),
        }
    }

    /// Parse with the dialect's grammar and require exactly one query.
    pub fn check_syntax(sql: &str, dialect: &dyn SqlDialect) -> Result<(), ValidationIssue> {
        let parser_dialect = dialect.parser_dialect();
        let ast = Parser::parse_sql(&*parser_dialect, sql).map_err(|e| {
            ValidationIssue::new(IssueKind::Syntax, format!("SQL parsing error: {}", e))
        })?;

        match ast.as_slice() {
            [] => Err(ValidationIssue::new(IssueKind::Syntax, "Empty SQL query")),
            [Statement::Query(_)] => Ok(()),
            [_] => Err(ValidationIssue::new(
                IssueKind::NotReadOnly,
                "Only SELECT queries are permitted.",
            )),
            _ => Err(ValidationIssue::new(
                IssueKind::Syntax,
                format!("Expected a single statement, found {}", ast.len()),
            )),
        }
    }

    /// Every local issue for a statement; empty when it may go to the database.
    pub fn static_issues(sql: &str, dialect: &dyn SqlDialect) -> Vec<ValidationIssue> {
        if let Err(issue) = Self::check_read_only(sql) {
            return vec![issue];
        }
        match Self::check_syntax(sql, dialect) {
            Ok(()) => Vec::new(),
            Err(issue) => vec![issue],
        }
    }

    /// Wrap a statement so at most `row_cap` rows come back.
    pub fn trial_statement(sql: &str, row_cap: u64) -> String {
        format!("SELECT * FROM ({}) AS {} LIMIT {}", strip_terminator(sql), TRIAL_ALIAS, row_cap)
    }

    pub fn explain_statement(sql: &str, dialect: &dyn SqlDialect) -> String {
        format!("{} {}", dialect.explain_prefix(), strip_terminator(sql))
    }

    /// Canonical form used to recognise a statement that was already tried:
    /// case-folded, whitespace collapsed, trailing terminator dropped.
    pub fn normalize(sql: &str) -> String {
        WHITESPACE
            .replace_all(strip_terminator(sql), " ")
            .to_lowercase()
    }
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dialect::{Druid, MySql, Postgres};

    #[test]
    fn test_write_statements_rejected() {
        for sql in [
            "INSERT INTO funds VALUES (1)",
            "UPDATE funds SET fund_name = 'x'",
            "delete from funds",
            "SELECT 1; DROP TABLE funds",
            "WITH x AS (SELECT 1) SELECT * FROM x; truncate funds",
        ] {
            let issue = SqlValidator::check_read_only(sql).unwrap_err();
            assert_eq!(issue.kind, IssueKind::NotReadOnly, "{}", sql);
        }
    }

    #[test]
    fn test_keyword_scan_uses_word_boundaries() {
        assert!(SqlValidator::check_read_only("SELECT updated_at, delete_flag, created_by FROM funds").is_ok());
        assert!(SqlValidator::check_read_only("SELECT 'drop table funds' AS note FROM funds").is_ok());
        assert!(SqlValidator::check_read_only(r#"SELECT "update" FROM audit_log"#).is_ok());
        assert!(SqlValidator::check_read_only("SELECT fund_name FROM funds -- delete later").is_ok());
    }

    #[test]
    fn test_syntax_check() {
        let sql = "SELECT fund_type, SUM(total_aum) AS sum_total_aum FROM funds WHERE is_active = true GROUP BY fund_type";
        assert!(SqlValidator::check_syntax(sql, &Postgres).is_ok());

        let issue =
            SqlValidator::check_syntax("SELEC fund_name FROM funds", &Postgres).unwrap_err();
        assert_eq!(issue.kind, IssueKind::Syntax);
        assert!(issue.message.contains("SQL parsing error"));

        assert!(SqlValidator::check_syntax("", &Postgres).is_err());
        assert!(SqlValidator::check_syntax("SELECT 1; SELECT 2", &Postgres).is_err());
    }

    #[test]
    fn test_syntax_check_follows_dialect() {
        let backticked = "SELECT `fund_name` FROM `funds` WHERE is_active = 1";
        assert!(SqlValidator::check_syntax(backticked, &MySql).is_ok());
        assert!(SqlValidator::check_syntax(r#"SELECT "fund_name" FROM "funds""#, &Druid).is_ok());
    }

    #[test]
    fn test_static_issues_short_circuit() {
        let issues = SqlValidator::static_issues("DELETE FROM funds", &Postgres);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::NotReadOnly);
        assert!(SqlValidator::static_issues("SELECT fund_name FROM funds", &Postgres).is_empty());
    }

    #[test]
    fn test_trial_and_explain_statements() {
        assert_eq!(
            SqlValidator::trial_statement("SELECT fund_name FROM funds;", 5),
            "SELECT * FROM (SELECT fund_name FROM funds) AS trial_q LIMIT 5"
        );
        assert_eq!(
            SqlValidator::explain_statement("SELECT 1", &Druid),
            "EXPLAIN PLAN FOR SELECT 1"
        );
        let wrapped = SqlValidator::trial_statement("SELECT fund_name FROM funds LIMIT 10", 5);
        assert!(SqlValidator::check_syntax(&wrapped, &Postgres).is_ok());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            SqlValidator::normalize("SELECT  fund_name\n  FROM funds ;"),
            SqlValidator::normalize("select fund_name from FUNDS")
        );
        assert_ne!(
            SqlValidator::normalize("SELECT fund_name FROM funds"),
            SqlValidator::normalize("SELECT fund_type FROM funds")
        );
    }
}
