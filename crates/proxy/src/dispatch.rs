//! Per-endpoint HTTP clients and upstream dispatch.

use std::time::Duration;

use http::{HeaderMap, Method};

use crate::error::AttemptError;
use config::{EndpointConfig, ProxyKind, ServerConfig, UpstreamProxyConfig};

fn proxy_for(config: &UpstreamProxyConfig) -> anyhow::Result<reqwest::Proxy> {
    let scheme = match config.kind {
        ProxyKind::Http => "http",
        ProxyKind::Socks5 => "socks5",
    };

    let mut proxy = reqwest::Proxy::all(format!("{scheme}://{}", config.address))?;
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        proxy = proxy.basic_auth(username, password);
    }
    Ok(proxy)
}

/// Build the HTTP client for one endpoint, honoring its proxy
/// descriptor and the server-wide timeouts. There is no overall request
/// timeout; streaming responses run as long as they need to.
pub fn build_client(endpoint: &EndpointConfig, server: &ServerConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(server.connect_timeout)
        .pool_idle_timeout(Some(server.idle_timeout))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .gzip(true);

    if let Some(proxy) = &endpoint.proxy {
        builder = builder.proxy(proxy_for(proxy).map_err(|err| {
            anyhow::anyhow!("endpoint '{}': invalid proxy descriptor: {err}", endpoint.name)
        })?);
    }

    builder
        .build()
        .map_err(|err| anyhow::anyhow!("endpoint '{}': failed to build HTTP client: {err}", endpoint.name))
}

/// Compose the upstream URL for one endpoint and request path.
///
/// Anthropic endpoints get the fixed `/v1` segment; OpenAI endpoints
/// get their configured path prefix.
pub fn upstream_url(endpoint: &crate::endpoint::Endpoint, request_path: &str, query: Option<&str>) -> String {
    let mut url = match endpoint.kind {
        config::EndpointKind::Anthropic => format!("{}/v1{}", endpoint.base_url, request_path),
        config::EndpointKind::OpenAI => format!("{}{}{}", endpoint.base_url, endpoint.path_prefix, request_path),
    };

    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    url
}

/// Send one prepared request. The timeout covers connection and
/// response headers only; the body streams without a deadline.
pub async fn send(
    endpoint: &crate::endpoint::Endpoint,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Vec<u8>,
    header_timeout: Duration,
) -> Result<reqwest::Response, AttemptError> {
    let request = endpoint
        .client
        .request(method, url)
        .headers(headers)
        .body(body)
        .send();

    match tokio::time::timeout(header_timeout, request).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(AttemptError::network(format!("upstream request failed: {err}"))),
        Err(_) => Err(AttemptError::network(format!(
            "upstream did not produce response headers within {header_timeout:?}"
        ))),
    }
}
