//! The tagger pipeline: every enabled tagger runs concurrently over the
//! cached request, bounded by one pipeline timeout; the tag set is the
//! union of the matching taggers' tags.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;
use tokio::time::Instant;

use crate::wildcard::Wildcard;
use config::{TaggerConfig, TaggerKind};

/// Immutable view of one request handed to every tagger.
#[derive(Debug)]
pub struct TagRequest {
    /// Inbound path.
    pub path: String,
    /// Inbound method.
    pub method: String,
    /// Inbound headers.
    pub headers: HeaderMap,
    /// Parsed query parameters.
    pub query: HashMap<String, String>,
    /// Cached body bytes.
    pub body: Bytes,
    /// Body parsed as JSON, when it parses.
    pub json: Option<Value>,
}

impl TagRequest {
    /// Build the shared view from inbound request parts.
    pub fn new(path: &str, method: &str, headers: HeaderMap, query: Option<&str>, body: Bytes) -> Self {
        let query = query
            .map(|raw| {
                raw.split('&')
                    .filter_map(|pair| {
                        let (key, value) = pair.split_once('=')?;
                        Some((key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let json = serde_json::from_slice(&body).ok();

        Self {
            path: path.to_string(),
            method: method.to_string(),
            headers,
            query,
            body,
            json,
        }
    }
}

/// One tagger. Custom implementations (including scripted engines)
/// register through this contract.
#[async_trait]
pub trait Tagger: Send + Sync {
    /// Tagger name, for logs.
    fn name(&self) -> &str;
    /// Tag contributed on match.
    fn tag(&self) -> &str;
    /// Whether the request matches.
    async fn matches(&self, request: &TagRequest) -> anyhow::Result<bool>;
}

/// Builds taggers for scripted kinds. The engine itself is pluggable;
/// the pipeline only depends on this contract.
pub type ScriptTaggerFactory = dyn Fn(&TaggerConfig) -> anyhow::Result<Arc<dyn Tagger>> + Send + Sync;

struct BuiltinTagger {
    name: String,
    tag: String,
    kind: TaggerKind,
    key: Option<String>,
    pattern: Option<Wildcard>,
    min_budget_tokens: Option<u64>,
}

impl BuiltinTagger {
    fn from_config(config: &TaggerConfig) -> anyhow::Result<Self> {
        let pattern = config
            .pattern
            .as_deref()
            .map(|raw| {
                Wildcard::new(raw)
                    .map_err(|err| anyhow::anyhow!("tagger '{}': invalid pattern '{raw}': {err}", config.name))
            })
            .transpose()?;

        Ok(Self {
            name: config.name.clone(),
            tag: config.tag.clone(),
            kind: config.kind,
            key: config.key.clone(),
            pattern,
            min_budget_tokens: config.min_budget_tokens,
        })
    }

    fn pattern_matches(&self, value: &str) -> bool {
        self.pattern.as_ref().is_none_or(|pattern| pattern.is_match(value))
    }
}

fn json_path<'a>(json: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = json;
    for segment in dotted.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn last_user_text(json: &Value) -> Option<String> {
    let messages = json.get("messages")?.as_array()?;
    let last_user = messages
        .iter()
        .rev()
        .find(|message| message.get("role").and_then(Value::as_str) == Some("user"))?;

    match last_user.get("content")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => blocks
            .iter()
            .rev()
            .find(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|block| block.get("text").and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

#[async_trait]
impl Tagger for BuiltinTagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn matches(&self, request: &TagRequest) -> anyhow::Result<bool> {
        let matched = match self.kind {
            TaggerKind::Path => self.pattern_matches(&request.path),
            TaggerKind::Header => {
                let Some(key) = &self.key else { return Ok(false) };
                request
                    .headers
                    .get(key.as_str())
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|value| self.pattern_matches(value))
            }
            TaggerKind::Query => {
                let Some(key) = &self.key else { return Ok(false) };
                request.query.get(key).is_some_and(|value| self.pattern_matches(value))
            }
            TaggerKind::BodyJson => {
                let (Some(key), Some(json)) = (&self.key, &request.json) else {
                    return Ok(false);
                };
                json_path(json, key)
                    .and_then(value_as_string)
                    .is_some_and(|value| self.pattern_matches(&value))
            }
            TaggerKind::UserMessage => request
                .json
                .as_ref()
                .and_then(last_user_text)
                .is_some_and(|text| self.pattern_matches(&text)),
            TaggerKind::Model => request
                .json
                .as_ref()
                .and_then(|json| json.get("model"))
                .and_then(Value::as_str)
                .is_some_and(|model| self.pattern_matches(model)),
            TaggerKind::Thinking => {
                let Some(json) = &request.json else { return Ok(false) };
                let Some(thinking) = json.get("thinking") else { return Ok(false) };
                let enabled = thinking.get("type").and_then(Value::as_str) == Some("enabled");
                let budget = thinking.get("budget_tokens").and_then(Value::as_u64);
                enabled && self.min_budget_tokens.is_none_or(|min| budget.unwrap_or(0) >= min)
            }
            TaggerKind::Starlark => false,
        };

        Ok(matched)
    }
}

/// The configured tagger set plus the pipeline timeout.
pub struct TaggerPipeline {
    taggers: Vec<Arc<dyn Tagger>>,
    timeout: Duration,
}

impl std::fmt::Debug for TaggerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggerPipeline")
            .field("taggers", &self.taggers.iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TaggerPipeline {
    /// Build the pipeline from configuration. Scripted taggers require
    /// `script_factory`; enabling one without an engine is a startup
    /// error.
    pub fn from_config(
        configs: &[TaggerConfig],
        timeout: Duration,
        script_factory: Option<&ScriptTaggerFactory>,
    ) -> anyhow::Result<Self> {
        let mut taggers: Vec<Arc<dyn Tagger>> = Vec::new();

        for config in configs.iter().filter(|c| c.enabled) {
            if config.kind == TaggerKind::Starlark {
                let Some(factory) = script_factory else {
                    anyhow::bail!(
                        "tagger '{}' needs a script engine, but none is registered",
                        config.name
                    );
                };
                taggers.push(factory(config)?);
            } else {
                taggers.push(Arc::new(BuiltinTagger::from_config(config)?));
            }
        }

        Ok(Self { taggers, timeout })
    }

    /// An empty pipeline.
    pub fn empty() -> Self {
        Self {
            taggers: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Run all taggers concurrently; taggers still running at the
    /// deadline are dropped and their absence is not fatal.
    pub async fn run(&self, request: Arc<TagRequest>) -> Vec<String> {
        if self.taggers.is_empty() {
            return Vec::new();
        }

        let deadline = Instant::now() + self.timeout;
        let mut handles = Vec::with_capacity(self.taggers.len());

        for tagger in &self.taggers {
            let tagger = Arc::clone(tagger);
            let request = Arc::clone(&request);
            handles.push((
                tagger.name().to_string(),
                tagger.tag().to_string(),
                tokio::spawn(async move { tagger.matches(&request).await }),
            ));
        }

        let mut tags: Vec<String> = Vec::new();

        for (name, tag, handle) in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(true))) => {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                Ok(Ok(Ok(false))) => {}
                Ok(Ok(Err(err))) => {
                    log::warn!("tagger '{name}' failed: {err}");
                }
                Ok(Err(join_err)) => {
                    log::warn!("tagger '{name}' panicked: {join_err}");
                }
                Err(_) => {
                    log::warn!("tagger '{name}' timed out after {:?}", self.timeout);
                }
            }
        }

        tags
    }
}
