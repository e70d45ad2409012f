//! Configuration file loading and validation.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context as _, bail};
use indoc::indoc;

use crate::{AuthConfig, Config, TaggerKind};

/// Load and validate the YAML configuration at `path`.
pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse configuration file {}", path.display()))?;

    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.endpoints.is_empty() {
        bail!(indoc! {r#"
            No endpoints configured. Switchyard requires at least one upstream endpoint.

            Example configuration:

              endpoints:
                - name: anthropic
                  url: https://api.anthropic.com
                  kind: anthropic
                  auth:
                    kind: api_key
                    value: sk-ant-...
        "#});
    }

    let mut names = HashSet::new();

    for endpoint in &config.endpoints {
        if endpoint.name.is_empty() {
            bail!("endpoint with url '{}' is missing a name", endpoint.url);
        }

        if !names.insert(endpoint.name.as_str()) {
            bail!("duplicate endpoint name '{}'", endpoint.name);
        }

        url::Url::parse(&endpoint.url)
            .map_err(|err| anyhow::anyhow!("endpoint '{}' has an invalid url '{}': {err}", endpoint.name, endpoint.url))?;

        if let AuthConfig::Oauth {
            access_token,
            refresh_token,
            ..
        } = &endpoint.auth
        {
            if access_token.is_empty() || refresh_token.is_empty() {
                bail!(
                    "endpoint '{}' uses oauth auth but access_token or refresh_token is empty",
                    endpoint.name
                );
            }
        }

        if let Some(proxy) = &endpoint.proxy
            && proxy.address.is_empty()
        {
            bail!("endpoint '{}' has a proxy descriptor with an empty address", endpoint.name);
        }
    }

    let mut tagger_names = HashSet::new();

    for tagger in &config.taggers {
        if !tagger_names.insert(tagger.name.as_str()) {
            bail!("duplicate tagger name '{}'", tagger.name);
        }

        if tagger.tag.is_empty() {
            bail!("tagger '{}' has an empty tag", tagger.name);
        }

        match tagger.kind {
            TaggerKind::Header | TaggerKind::Query | TaggerKind::BodyJson => {
                if tagger.key.as_deref().unwrap_or_default().is_empty() {
                    bail!("tagger '{}' (kind {:?}) requires a key", tagger.name, tagger.kind);
                }
            }
            TaggerKind::Path | TaggerKind::UserMessage | TaggerKind::Model => {
                if tagger.pattern.as_deref().unwrap_or_default().is_empty() {
                    bail!("tagger '{}' (kind {:?}) requires a pattern", tagger.name, tagger.kind);
                }
            }
            TaggerKind::Thinking => {}
            TaggerKind::Starlark => {
                if tagger.script.is_none() && tagger.script_file.is_none() {
                    bail!("tagger '{}' (kind starlark) requires script or script_file", tagger.name);
                }
            }
        }
    }

    Ok(())
}
