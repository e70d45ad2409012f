//! Inbound request classification.
//!
//! Path detection is authoritative; body heuristics only run when the
//! path is indeterminate. Results for paths are cached process-wide in a
//! bounded map that is flushed wholesale on overflow.

use dashmap::DashMap;
use serde_json::Value;

/// Wire format of the inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFormat {
    /// Anthropic Messages.
    Anthropic,
    /// OpenAI Chat Completions / Responses.
    OpenAi,
    /// Could not be determined; passed through when the endpoint type permits.
    Unknown,
}

impl RequestFormat {
    /// Stable label for logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Unknown => "unknown",
        }
    }
}

/// Which CLI sent the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    /// The Anthropic Messages CLI.
    ClaudeCode,
    /// The OpenAI Responses CLI.
    Codex,
    /// Unrecognized caller.
    Unknown,
}

impl ClientType {
    /// Stable label for logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
            Self::Unknown => "unknown",
        }
    }
}

/// Classification result for one inbound request.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    /// Detected wire format.
    pub format: RequestFormat,
    /// Detected client.
    pub client: ClientType,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Which detector produced the result.
    pub detected_by: &'static str,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            format: RequestFormat::Unknown,
            client: ClientType::Unknown,
            confidence: 0.0,
            detected_by: "none",
        }
    }
}

const PATH_CONFIDENCE: f32 = 0.95;
const BODY_SCORE_FLOOR: f32 = 0.3;
const PATH_CACHE_CAPACITY: usize = 1000;

const OPENAI_PATH_SUFFIXES: &[&str] = &[
    "/chat/completions",
    "/completions",
    "/embeddings",
    "/responses",
    "/realtime",
    "/images/generations",
    "/audio/transcriptions",
    "/moderations",
];

/// Process-wide cache of per-path classification results.
pub struct PathCache {
    entries: DashMap<String, Classification>,
}

impl PathCache {
    /// An empty cache bounded at 1000 entries.
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    fn get(&self, path: &str) -> Option<Classification> {
        self.entries.get(path).map(|entry| *entry.value())
    }

    fn insert(&self, path: &str, classification: Classification) {
        if self.entries.len() >= PATH_CACHE_CAPACITY {
            // Wholesale flush keeps the bound without LRU bookkeeping.
            self.entries.clear();
        }
        self.entries.insert(path.to_string(), classification);
    }

    /// Current number of cached paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a request from its path and cached body bytes.
pub fn classify(cache: &PathCache, path: &str, body: &[u8]) -> Classification {
    if let Some(by_path) = cache.get(path) {
        return by_path;
    }

    if let Some(by_path) = classify_path(path) {
        cache.insert(path, by_path);
        return by_path;
    }

    classify_body(body)
}

fn classify_path(path: &str) -> Option<Classification> {
    let path = path.trim_end_matches('/');

    if path.ends_with("/messages") || path.ends_with("/count_tokens") {
        return Some(Classification {
            format: RequestFormat::Anthropic,
            client: ClientType::ClaudeCode,
            confidence: PATH_CONFIDENCE,
            detected_by: "path",
        });
    }

    if OPENAI_PATH_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
        return Some(Classification {
            format: RequestFormat::OpenAi,
            client: ClientType::Codex,
            confidence: PATH_CONFIDENCE,
            detected_by: "path",
        });
    }

    None
}

fn classify_body(body: &[u8]) -> Classification {
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return Classification::unknown();
    };
    let Some(map) = json.as_object() else {
        return Classification::unknown();
    };

    // A top-level string `instructions` is the Codex Responses signature.
    if map.get("instructions").is_some_and(Value::is_string) {
        return Classification {
            format: RequestFormat::OpenAi,
            client: ClientType::Codex,
            confidence: PATH_CONFIDENCE,
            detected_by: "codex-instructions",
        };
    }

    let mut anthropic_score: f32 = 0.0;
    let mut openai_score: f32 = 0.0;

    if map.contains_key("system") {
        anthropic_score += 0.4;
    }
    if map.contains_key("thinking") {
        anthropic_score += 0.4;
    }
    for key in ["max_completion_tokens", "frequency_penalty", "presence_penalty"] {
        if map.contains_key(key) {
            openai_score += 0.35;
        }
    }

    if anthropic_score <= BODY_SCORE_FLOOR && openai_score <= BODY_SCORE_FLOOR {
        return Classification::unknown();
    }

    if anthropic_score >= openai_score {
        Classification {
            format: RequestFormat::Anthropic,
            client: ClientType::ClaudeCode,
            confidence: anthropic_score.min(0.9),
            detected_by: "body",
        }
    } else {
        Classification {
            format: RequestFormat::OpenAi,
            client: ClientType::Unknown,
            confidence: openai_score.min(0.9),
            detected_by: "body",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_path_is_anthropic() {
        let cache = PathCache::new();
        let c = classify(&cache, "/v1/messages", b"");
        assert_eq!(c.format, RequestFormat::Anthropic);
        assert_eq!(c.client, ClientType::ClaudeCode);
        assert!((c.confidence - 0.95).abs() < f32::EPSILON);
        assert_eq!(c.detected_by, "path");
    }

    #[test]
    fn responses_path_is_codex() {
        let cache = PathCache::new();
        let c = classify(&cache, "/responses", b"");
        assert_eq!(c.format, RequestFormat::OpenAi);
        assert_eq!(c.client, ClientType::Codex);
    }

    #[test]
    fn instructions_body_short_circuits_to_codex() {
        let cache = PathCache::new();
        let body = serde_json::to_vec(&json!({"instructions": "be brief", "input": []})).unwrap();
        let c = classify(&cache, "/unknown", &body);
        assert_eq!(c.format, RequestFormat::OpenAi);
        assert_eq!(c.client, ClientType::Codex);
        assert_eq!(c.detected_by, "codex-instructions");
    }

    #[test]
    fn body_heuristics_score_anthropic() {
        let cache = PathCache::new();
        let body = serde_json::to_vec(&json!({"system": "s", "thinking": {"type": "enabled"}})).unwrap();
        let c = classify(&cache, "/other", &body);
        assert_eq!(c.format, RequestFormat::Anthropic);
        assert_eq!(c.detected_by, "body");
    }

    #[test]
    fn weak_signals_yield_unknown() {
        let cache = PathCache::new();
        let body = serde_json::to_vec(&json!({"model": "m", "messages": []})).unwrap();
        let c = classify(&cache, "/other", &body);
        assert_eq!(c.format, RequestFormat::Unknown);
        assert!(c.confidence == 0.0);
    }

    #[test]
    fn cache_never_exceeds_capacity() {
        let cache = PathCache::new();
        for i in 0..2500 {
            classify(&cache, &format!("/v1/messages/{i}/messages"), b"");
            assert!(cache.len() <= PATH_CACHE_CAPACITY);
        }
    }
}
