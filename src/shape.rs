//! Display heuristics for query results.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Row, VisualizationHint};

const BAR_MAX_ROWS: usize = 10;

static AGGREGATE_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(count|sum|avg|min|max)\s*\(").expect("valid regex"));

static FROM_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bfrom\s+([a-z0-9_]+)").expect("valid regex"));

/// Picks a default chart type from the shape of the result.
pub fn visualization_hint(rows: &[Row], columns: &[String]) -> VisualizationHint {
    if rows.is_empty() || columns.is_empty() {
        return VisualizationHint::Table;
    }

    if columns.len() == 2 && rows.len() <= BAR_MAX_ROWS {
        return VisualizationHint::Bar;
    }

    let temporal = columns.iter().any(|c| {
        let c = c.to_lowercase();
        c == "year" || c.contains("date") || c.contains("time")
    });
    if temporal {
        return VisualizationHint::Line;
    }

    VisualizationHint::Table
}

/// Derives a title from the SQL text.
pub fn title(sql: &str) -> String {
    let normalized = sql.to_lowercase();

    if normalized.contains("count") && normalized.contains("group by") {
        return "Count by Group".to_string();
    }

    if AGGREGATE_CALL.is_match(&normalized) {
        return "Aggregate Results".to_string();
    }

    if let Some(table) = FROM_TABLE.captures(&normalized).and_then(|c| c.get(1)) {
        return format!("{} Data", capitalize(table.as_str()));
    }

    "Query Results".to_string()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
