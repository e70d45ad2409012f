//! Tagger pipeline configuration.

use serde::{Deserialize, Serialize};

/// Built-in tagger kinds plus the scripted escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaggerKind {
    /// Match the request path against a wildcard pattern.
    Path,
    /// Match a named header value.
    Header,
    /// Match a query parameter value.
    Query,
    /// Match a dotted JSON path inside the body.
    BodyJson,
    /// Match the last text block of the last user message.
    UserMessage,
    /// Match the body `model` field.
    Model,
    /// Fire when extended thinking is enabled (optionally above a budget floor).
    Thinking,
    /// Scripted tagger; the engine registers through the `Tagger` contract.
    Starlark,
}

/// One tagger declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggerConfig {
    /// Unique tagger name, used in logs.
    pub name: String,
    /// Which matcher to run.
    pub kind: TaggerKind,
    /// Tag contributed when the matcher fires.
    pub tag: String,
    /// Disabled taggers are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Header name, query parameter, or dotted JSON path, depending on kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Wildcard pattern the extracted value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// For `thinking`: minimum `budget_tokens` for the tagger to fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_budget_tokens: Option<u64>,
    /// For `starlark`: inline script source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// For `starlark`: path to a script file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_file: Option<String>,
}

fn default_enabled() -> bool {
    true
}
