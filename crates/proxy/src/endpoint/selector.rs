//! Candidate selection: filter by format compatibility, tier by tag
//! match, order by priority.

use std::sync::Arc;

use crate::classify::RequestFormat;
use crate::endpoint::Endpoint;
use config::EndpointKind;

/// Tier 0: matches all required tags. Tier 1: universal (no tags).
/// Tier 2: tagged but not matching; last resort.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Selection tier, lower preferred.
    pub tier: u8,
    /// The endpoint.
    pub endpoint: Arc<Endpoint>,
}

/// Active-vs-total counts per tier, for the failure envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectionDiagnostics {
    /// (active, total) for tag-matched endpoints.
    pub tag_matched: (usize, usize),
    /// (active, total) for universal endpoints.
    pub universal: (usize, usize),
    /// (active, total) for mismatched endpoints.
    pub mismatched: (usize, usize),
}

impl std::fmt::Display for SelectionDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tag-matched {}/{} active, universal {}/{} active, mismatched {}/{} active",
            self.tag_matched.0, self.tag_matched.1, self.universal.0, self.universal.1, self.mismatched.0, self.mismatched.1
        )
    }
}

fn format_compatible(format: RequestFormat, kind: EndpointKind) -> bool {
    match format {
        // OpenAI-shaped bodies cannot be sent to Anthropic upstreams.
        RequestFormat::OpenAi => kind == EndpointKind::OpenAI,
        RequestFormat::Anthropic | RequestFormat::Unknown => true,
    }
}

fn tier_for(endpoint: &Endpoint, required_tags: &[String]) -> Option<u8> {
    if required_tags.is_empty() {
        // Untagged requests only ever go to universal endpoints.
        return endpoint.tags.is_empty().then_some(0);
    }

    if required_tags.iter().all(|tag| endpoint.tags.contains(tag)) {
        Some(0)
    } else if endpoint.tags.is_empty() {
        Some(1)
    } else {
        Some(2)
    }
}

/// Ordered candidate list for one request. Availability is checked at
/// attempt time, not here, so blacklisted endpoints can emit virtual
/// log entries during failover.
pub fn candidates(endpoints: &[Arc<Endpoint>], required_tags: &[String], format: RequestFormat) -> Vec<Candidate> {
    let mut list: Vec<Candidate> = endpoints
        .iter()
        .filter(|endpoint| endpoint.enabled())
        .filter(|endpoint| format_compatible(format, endpoint.kind))
        .filter_map(|endpoint| {
            tier_for(endpoint, required_tags).map(|tier| Candidate {
                tier,
                endpoint: Arc::clone(endpoint),
            })
        })
        .collect();

    list.sort_by_key(|candidate| (candidate.tier, candidate.endpoint.priority));
    list
}

/// Diagnostics over the full pool for the failure envelope.
pub fn diagnostics(endpoints: &[Arc<Endpoint>], required_tags: &[String], format: RequestFormat) -> SelectionDiagnostics {
    let mut diag = SelectionDiagnostics::default();

    for endpoint in endpoints {
        if !format_compatible(format, endpoint.kind) {
            continue;
        }
        let Some(tier) = tier_for(endpoint, required_tags) else {
            continue;
        };
        let bucket = match tier {
            0 => &mut diag.tag_matched,
            1 => &mut diag.universal,
            _ => &mut diag.mismatched,
        };
        bucket.1 += 1;
        if endpoint.is_available() {
            bucket.0 += 1;
        }
    }

    diag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::tests::test_endpoint;

    fn pool() -> Vec<Arc<Endpoint>> {
        vec![
            Arc::new(test_endpoint("fast-primary", EndpointKind::Anthropic, &["fast"], 1)),
            Arc::new(test_endpoint("fast-backup", EndpointKind::Anthropic, &["fast"], 2)),
            Arc::new(test_endpoint("universal", EndpointKind::Anthropic, &[], 5)),
            Arc::new(test_endpoint("other-tag", EndpointKind::Anthropic, &["slow"], 1)),
            Arc::new(test_endpoint("openai-only", EndpointKind::OpenAI, &[], 3)),
        ]
    }

    #[test]
    fn tagged_request_prefers_exact_match_then_universal() {
        let pool = pool();
        let tags = vec!["fast".to_string()];
        let candidates = candidates(&pool, &tags, RequestFormat::Anthropic);

        let names: Vec<&str> = candidates.iter().map(|c| c.endpoint.name.as_str()).collect();
        assert_eq!(names, vec!["fast-primary", "fast-backup", "openai-only", "universal", "other-tag"]);
        assert_eq!(candidates[0].tier, 0);
        assert_eq!(candidates[2].tier, 1);
        assert_eq!(candidates[4].tier, 2);
    }

    #[test]
    fn untagged_request_excludes_tagged_endpoints() {
        let pool = pool();
        let candidates = candidates(&pool, &[], RequestFormat::Anthropic);

        let names: Vec<&str> = candidates.iter().map(|c| c.endpoint.name.as_str()).collect();
        assert_eq!(names, vec!["openai-only", "universal"]);
    }

    #[test]
    fn openai_format_filters_anthropic_endpoints() {
        let pool = pool();
        let candidates = candidates(&pool, &[], RequestFormat::OpenAi);

        let names: Vec<&str> = candidates.iter().map(|c| c.endpoint.name.as_str()).collect();
        assert_eq!(names, vec!["openai-only"]);
    }

    #[test]
    fn disabled_endpoints_are_excluded() {
        let config: config::EndpointConfig = serde_yaml::from_str(
            r#"
name: off
url: https://example.com
kind: anthropic
enabled: false
auth:
  kind: api_key
  value: key
"#,
        )
        .unwrap();
        let disabled = Arc::new(Endpoint::from_config(&config, &config::ServerConfig::default()).unwrap());

        let candidates = candidates(&[disabled], &[], RequestFormat::Anthropic);
        assert!(candidates.is_empty());
    }

    #[test]
    fn diagnostics_count_active_vs_total() {
        let pool = pool();
        pool[0].record_request(false, "r1", None);
        pool[0].record_request(false, "r2", None);
        pool[0].record_request(false, "r3", None);

        let tags = vec!["fast".to_string()];
        let diag = diagnostics(&pool, &tags, RequestFormat::Anthropic);
        assert_eq!(diag.tag_matched, (1, 2));
        assert_eq!(diag.universal, (2, 2));
        assert_eq!(diag.mismatched, (1, 1));
    }
}
