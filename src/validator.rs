//! Heuristic SQL safety validation.
//!
//! This is deliberately not a parser. Checks run on a trimmed, lowercased copy
//! of the statement and fail closed: a column literally named `update_count`
//! is rejected along with a real `UPDATE`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const REASON_REQUIRED: &str = "SQL query is required";
pub const REASON_SELECT_ONLY: &str = "Only SELECT statements are allowed";
pub const REASON_MULTIPLE: &str = "Multiple statements are not permitted";

/// Substrings that reject a statement outright.
pub const DISALLOWED_KEYWORDS: &[&str] = &[
    // mutation
    "insert",
    "update",
    "delete",
    "drop",
    "alter",
    "create",
    "truncate",
    // execution primitives
    "exec",
    "execute",
    "xp_",
    "sp_",
    // catalog / system schemas
    "sysobjects",
    "information_schema",
    "pg_",
    "sys.",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Classifies `sql` as safe to run or rejected.
pub fn validate(sql: &str) -> ValidationResult {
    let normalized = sql.trim().to_lowercase();
    if normalized.is_empty() {
        return ValidationResult::reject(REASON_REQUIRED);
    }

    if !normalized.starts_with("select") {
        return ValidationResult::reject(REASON_SELECT_ONLY);
    }

    // A trailing terminator is fine; any other `;` means a second statement.
    let body = normalized.strip_suffix(';').unwrap_or(&normalized);
    if body.contains(';') {
        return ValidationResult::reject(REASON_MULTIPLE);
    }

    if let Some(keyword) = DISALLOWED_KEYWORDS
        .iter()
        .find(|kw| normalized.contains(*kw))
    {
        return ValidationResult::reject(format!(
            "Query contains disallowed keyword: {}",
            keyword
        ));
    }

    ValidationResult::ok()
}

static FENCED_SQL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)```sql\s*([\s\S]*?)\s*```").expect("valid regex"));

static SELECT_SPAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(SELECT[\s\S]+?FROM[\s\S]+?)(?:$|;|\n\n)").expect("valid regex")
});

static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[\s\S]*\}").expect("valid regex"));

/// Recovers a SQL statement from free-form model text.
///
/// Tries a fenced ```` ```sql ```` block, then a bare `SELECT ... FROM ...`
/// span, then a JSON object with a string `sql` field. The result is not
/// trusted and must still pass [`validate`].
pub fn extract_sql(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }

    if let Some(sql) = FENCED_SQL
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
    {
        return Some(sql.to_string());
    }

    if let Some(sql) = SELECT_SPAN
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
    {
        return Some(sql.to_string());
    }

    let candidate = JSON_OBJECT.find(text)?;
    let parsed: serde_json::Value = serde_json::from_str(candidate.as_str()).ok()?;
    parsed
        .get("sql")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accepts_plain_select() {
        assert_eq!(validate("SELECT * FROM users"), ValidationResult::ok());
        assert!(validate("  select id, name from users where active = true  ").valid);
        assert!(validate("SELECT count(*) FROM users;").valid);
    }

    #[test]
    fn test_rejects_non_select() {
        let result = validate("UPDATE users SET active=false");
        assert!(!result.valid);
        assert_eq!(result.reason.as_deref(), Some(REASON_SELECT_ONLY));
        assert!(result.reason.unwrap().contains("SELECT"));

        assert!(!validate("WITH x AS (SELECT 1) SELECT * FROM x").valid);
    }

    #[test]
    fn test_rejects_stacked_statements() {
        let result = validate("SELECT 1; DROP TABLE users;");
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("Multiple statements"));

        let result = validate("SELECT * FROM users WHERE id = '1' OR 1=1; DROP TABLE users; --'");
        assert_eq!(result.reason.as_deref(), Some(REASON_MULTIPLE));

        assert_eq!(validate("SELECT 1; SELECT 2;").reason.as_deref(), Some(REASON_MULTIPLE));
        assert_eq!(validate("SELECT 1;;").reason.as_deref(), Some(REASON_MULTIPLE));
    }

    #[test]
    fn test_rejects_denylisted_substrings() {
        let result = validate("SELECT * FROM UPDATE_logs");
        assert_eq!(
            result.reason.as_deref(),
            Some("Query contains disallowed keyword: update")
        );

        let result = validate("SELECT table_name FROM information_schema.tables");
        assert_eq!(
            result.reason.as_deref(),
            Some("Query contains disallowed keyword: information_schema")
        );

        assert!(!validate("SELECT * FROM pg_user").valid);
        assert!(!validate("SELECT created_at FROM orders").valid);
        assert!(!validate("SELECT * FROM sys.objects").valid);
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(validate("").reason.as_deref(), Some(REASON_REQUIRED));
        assert_eq!(validate("   \n\t").reason.as_deref(), Some(REASON_REQUIRED));
    }

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here you go:\n```sql\nSELECT id FROM t\n```";
        assert_eq!(extract_sql(text).as_deref(), Some("SELECT id FROM t"));

        let text = "```SQL\n  select 1 from dual  \n``` trailing";
        assert_eq!(extract_sql(text).as_deref(), Some("select 1 from dual"));
    }

    #[test]
    fn test_extract_bare_select() {
        let text = "The query is SELECT name FROM users WHERE id = 4; hope that helps";
        assert_eq!(
            extract_sql(text).as_deref(),
            Some("SELECT name FROM users WHERE id = 4")
        );

        let text = "select a from b\n\nThis returns every a.";
        assert_eq!(extract_sql(text).as_deref(), Some("select a from b"));
    }

    #[test]
    fn test_extract_json_field() {
        let text = r#"Result: {"outputType": "table", "sql": " select 1 "}"#;
        assert_eq!(extract_sql(text).as_deref(), Some("select 1"));
    }

    #[test]
    fn test_extract_nothing() {
        assert_eq!(extract_sql(""), None);
        assert_eq!(extract_sql("I cannot answer that."), None);
        assert_eq!(extract_sql(r#"{"sql": 42}"#), None);
        assert_eq!(extract_sql("{not json}"), None);
    }

    proptest! {
        #[test]
        fn prop_validate_is_deterministic(s in ".*") {
            prop_assert_eq!(validate(&s), validate(&s));
        }

        #[test]
        fn prop_valid_implies_safe(s in "[sS][eE][lL][eE][cC][tT][ a-z0-9_*,.;()=']{0,80}") {
            let result = validate(&s);
            if result.valid {
                let normalized = s.trim().to_lowercase();
                prop_assert!(normalized.starts_with("select"));
                let body = normalized.strip_suffix(';').unwrap_or(&normalized);
                prop_assert!(!body.contains(';'));
                for kw in DISALLOWED_KEYWORDS {
                    prop_assert!(!normalized.contains(kw));
                }
            } else {
                prop_assert!(result.reason.is_some());
            }
        }
    }
}
