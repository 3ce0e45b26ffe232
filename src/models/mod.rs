use serde::{Deserialize, Serialize};

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgresql,
    #[serde(untagged)]
    Other(String),
}

impl Engine {
    pub fn as_str(&self) -> &str {
        match self {
            Engine::Postgresql => "postgresql",
            Engine::Other(name) => name,
        }
    }
}

/// Stored connection metadata. Read-only to the pipeline.
///
/// Either `encrypted_dsn` or `host` + `database` locates the database.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub engine: Engine,
    #[serde(default)]
    pub encrypted_dsn: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: Option<String>,
}

impl ConnectionRecord {
    /// Record whose DSN is stored encrypted.
    pub fn encrypted(id: impl Into<String>, encrypted_dsn: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            engine: Engine::Postgresql,
            encrypted_dsn: Some(encrypted_dsn.into()),
            host: None,
            port: None,
            database: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// Tables of the public schema in catalog order.
pub type SchemaSnapshot = Vec<TableInfo>;

/// Raw `information_schema.columns` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRow {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VisualizationHint {
    #[default]
    Table,
    Line,
    Bar,
}

/// Rows and column metadata as returned by a driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    pub executed_sql: String,
    pub visualization_hint: VisualizationHint,
    pub title: Option<String>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Text,
    #[default]
    Table,
    Chart,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Envelope handed to the presentation layer.
///
/// `error` and a populated `data` are mutually exclusive.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub output_type: OutputType,
    pub sql: Option<String>,
    pub data: Option<TableData>,
    pub visualization_hint: Option<VisualizationHint>,
    pub title: Option<String>,
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
