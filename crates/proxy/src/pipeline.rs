//! The per-request pipeline: classify, tag, select, transform,
//! dispatch, transform back, record. Handles in-place retry, parameter
//! learning, codex probing, OAuth recovery, and two-phase failover.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::response::{IntoResponse as _, Response};
use bytes::Bytes;
use eventsource_stream::{Event, Eventsource as _};
use futures::StreamExt as _;
use http::{HeaderMap, Method, StatusCode, Uri, header};
use serde_json::Value;

use crate::classify::{self, ClientType, PathCache, RequestFormat};
use crate::context::RequestContext;
use crate::convert;
use crate::endpoint::{AuthKind, BlacklistReason, Endpoint, StatePersister, selector};
use crate::error::{AttemptError, ErrorKind, ProxyError, classify_status};
use crate::logsink::{RequestLog, RequestLogSink};
use crate::restore;
use crate::retry::{self, PER_ENDPOINT_RETRY_CAP};
use crate::streaming::{StreamFinalizer, StreamProcessor, forward_sse};
use crate::tagger::{TagRequest, TaggerPipeline};
use crate::transform::{self, TransformEnv};
use crate::{auth, dispatch, validate};
use config::{Config, DefaultsConfig, EndpointKind, ServerConfig};

/// Bodies stored in request logs are truncated to this many bytes.
const LOG_BODY_LIMIT: usize = 64 * 1024;

/// Consecutive 400-learning retries allowed on one endpoint.
const MAX_LEARNING_RETRIES: u32 = 3;

/// Shape of recent live traffic, reused by the health checker.
#[derive(Debug, Clone, Default)]
pub struct TrafficShape {
    /// Last model seen on an Anthropic-format request.
    pub model: Option<String>,
    /// Last user-agent header.
    pub user_agent: Option<String>,
    /// Last `anthropic-version` header.
    pub anthropic_version: Option<String>,
    /// Last `anthropic-beta` header.
    pub anthropic_beta: Option<String>,
    /// Whether the last request streamed.
    pub stream: bool,
}

/// The proxy core shared by all request workers.
pub struct ProxyServer {
    /// Endpoint pool in configuration order.
    pub endpoints: Vec<Arc<Endpoint>>,
    taggers: TaggerPipeline,
    sink: Arc<dyn RequestLogSink>,
    persister: Option<Arc<dyn StatePersister>>,
    defaults: DefaultsConfig,
    server_config: ServerConfig,
    path_cache: PathCache,
    traffic_shape: Arc<Mutex<TrafficShape>>,
    oauth_http: reqwest::Client,
}

impl ProxyServer {
    /// Build the pipeline from configuration.
    pub fn new(
        config: &Config,
        sink: Arc<dyn RequestLogSink>,
        persister: Option<Arc<dyn StatePersister>>,
        script_factory: Option<&crate::tagger::ScriptTaggerFactory>,
    ) -> anyhow::Result<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| Endpoint::from_config(endpoint, &config.server).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let taggers = TaggerPipeline::from_config(&config.taggers, config.server.pipeline_timeout, script_factory)?;

        let oauth_http = reqwest::Client::builder()
            .connect_timeout(config.server.connect_timeout)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|err| anyhow::anyhow!("failed to build oauth client: {err}"))?;

        Ok(Self {
            endpoints,
            taggers,
            sink,
            persister,
            defaults: config.defaults.clone(),
            server_config: config.server.clone(),
            path_cache: PathCache::new(),
            traffic_shape: Arc::new(Mutex::new(TrafficShape::default())),
            oauth_http,
        })
    }

    /// Defaults used for implicit rewrites and health probes.
    pub fn defaults(&self) -> &DefaultsConfig {
        &self.defaults
    }

    /// Server-wide timing configuration.
    pub fn server_config(&self) -> &ServerConfig {
        &self.server_config
    }

    /// The shared view of recent traffic shape.
    pub fn traffic_shape(&self) -> Arc<Mutex<TrafficShape>> {
        Arc::clone(&self.traffic_shape)
    }

    /// The state persistence callback.
    pub fn persister(&self) -> Option<Arc<dyn StatePersister>> {
        self.persister.clone()
    }

    /// The log sink.
    pub fn sink(&self) -> Arc<dyn RequestLogSink> {
        Arc::clone(&self.sink)
    }

    /// The OAuth refresh HTTP client.
    pub fn oauth_http(&self) -> &reqwest::Client {
        &self.oauth_http
    }

    /// Handle one inbound request end to end.
    pub async fn handle(&self, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
        let path = uri.path().to_string();
        let query = uri.query().map(str::to_string);

        let mut ctx = RequestContext::new(method, &path, query, headers, body);
        ctx.classification = classify::classify(&self.path_cache, &ctx.inbound_path, &ctx.body);

        let tag_request = Arc::new(TagRequest::new(
            &ctx.inbound_path,
            ctx.method.as_str(),
            ctx.headers.clone(),
            ctx.query.as_deref(),
            ctx.body.clone(),
        ));
        ctx.tags = self.taggers.run(tag_request).await;

        self.capture_traffic_shape(&ctx);

        log::debug!(
            "request {} {} classified as {}/{} (by {}), tags {:?}",
            ctx.method,
            ctx.inbound_path,
            ctx.classification.format.label(),
            ctx.classification.client.label(),
            ctx.classification.detected_by,
            ctx.tags
        );

        let candidates = selector::candidates(&self.endpoints, &ctx.tags, ctx.classification.format);
        let diagnostics = selector::diagnostics(&self.endpoints, &ctx.tags, ctx.classification.format);

        if candidates.is_empty() {
            return ProxyError::NoEndpointAvailable {
                request_id: ctx.request_id.clone(),
                tags: ctx.tags.clone(),
                diagnostics: diagnostics.to_string(),
            }
            .into_response();
        }

        let mut blacklisted: Vec<(String, Vec<String>)> = Vec::new();
        let mut attempted_any = false;

        for candidate in &candidates {
            let endpoint = &candidate.endpoint;

            if ctx.is_count_tokens() && endpoint.kind == EndpointKind::OpenAI {
                // count_tokens has no OpenAI equivalent; skip silently
                // without consuming health stats or emitting logs.
                ctx.count_tokens_skipped = true;
                continue;
            }

            if !endpoint.is_available() {
                if let Some(reason) = endpoint.snapshot().blacklist {
                    self.emit_virtual_blacklist_log(&ctx, endpoint, &reason);
                    blacklisted.push((endpoint.name.clone(), reason.causing_request_ids.clone()));
                }
                continue;
            }

            attempted_any = true;

            match self.try_endpoint(&mut ctx, endpoint).await {
                Ok(response) => return response,
                Err(err) => {
                    if err.preflight && ctx.attempt <= 1 {
                        // Conversion or construction failure on the
                        // initial pipeline aborts the whole request.
                        return ProxyError::InvalidRequest(err.summary).into_response();
                    }
                    log::warn!(
                        "endpoint '{}' failed for request {} ({}); failing over",
                        endpoint.name,
                        ctx.request_id,
                        err
                    );
                    ctx.last_error = Some(err);
                }
            }
        }

        if ctx.is_count_tokens() && ctx.count_tokens_skipped && !attempted_any {
            return ProxyError::CountTokensUnsupported.into_response();
        }

        ProxyError::AllEndpointsFailed {
            request_id: ctx.request_id.clone(),
            tags: ctx.tags.clone(),
            diagnostics: diagnostics.to_string(),
            blacklisted,
            summary: ctx
                .last_error
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no endpoint attempted".to_string()),
        }
        .into_response()
    }

    fn capture_traffic_shape(&self, ctx: &RequestContext) {
        if ctx.classification.format != RequestFormat::Anthropic || !ctx.request_path.ends_with("/messages") {
            return;
        }
        let Ok(json) = serde_json::from_slice::<Value>(&ctx.body) else {
            return;
        };

        let mut shape = self.traffic_shape.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(model) = json.get("model").and_then(Value::as_str) {
            shape.model = Some(model.to_string());
        }
        if let Some(agent) = ctx.headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
            shape.user_agent = Some(agent.to_string());
        }
        if let Some(version) = ctx.headers.get("anthropic-version").and_then(|v| v.to_str().ok()) {
            shape.anthropic_version = Some(version.to_string());
        }
        if let Some(beta) = ctx.headers.get("anthropic-beta").and_then(|v| v.to_str().ok()) {
            shape.anthropic_beta = Some(beta.to_string());
        }
        shape.stream = json.get("stream").and_then(Value::as_bool).unwrap_or(false);
    }

    /// Attempt one endpoint, handling in-place retries and the
    /// recovery sub-policies. `Err` means switch to the next endpoint.
    async fn try_endpoint(&self, ctx: &mut RequestContext, endpoint: &Arc<Endpoint>) -> Result<Response, AttemptError> {
        let mut normal_attempts: u32 = 0;
        let mut learning_retries: u32 = 0;

        loop {
            ctx.attempt += 1;

            let is_responses = ctx.request_path == "/responses" && endpoint.kind == EndpointKind::OpenAI;
            let native_state = endpoint.native_codex_format();
            let use_native = is_responses && native_state != Some(false);
            let probing = is_responses && native_state.is_none();

            let env = TransformEnv {
                endpoint,
                defaults: &self.defaults,
                oauth_http: &self.oauth_http,
                persister: self.persister.as_ref(),
                use_native_codex: use_native,
            };

            let prepared = match transform::prepare(ctx, &env).await {
                Ok(prepared) => prepared,
                Err(err) => {
                    let attempt_err = AttemptError::preflight(err.to_string());
                    self.record_failed_attempt(ctx, endpoint, &attempt_err, None, None, true);
                    return Err(attempt_err);
                }
            };

            let send_result = dispatch::send(
                endpoint,
                ctx.method.clone(),
                &prepared.url,
                prepared.headers.clone(),
                prepared.body.clone(),
                self.server_config.response_header_timeout,
            )
            .await;

            let response = match send_result {
                Ok(response) => response,
                Err(network_err) => {
                    if probing && use_native {
                        // Probe verdict: this endpoint cannot take the
                        // native body. Convert and retry in place.
                        endpoint.set_native_codex_format(false);
                        log::info!("endpoint '{}' failed the native codex probe (network); converting", endpoint.name);
                        continue;
                    }
                    normal_attempts += 1;
                    self.record_failed_attempt(ctx, endpoint, &network_err, Some(&prepared), None, false);
                    if network_err.kind.retry_in_place() && normal_attempts < PER_ENDPOINT_RETRY_CAP {
                        continue;
                    }
                    return Err(network_err);
                }
            };

            let status = response.status().as_u16();
            ctx.last_status = Some(status);
            self.apply_rate_limit_headers(ctx, endpoint, response.headers());

            if (200..300).contains(&status) {
                if probing && use_native {
                    endpoint.set_native_codex_format(true);
                }

                match self.process_success(ctx, endpoint, &prepared, response).await {
                    Ok(response) => return Ok(response),
                    Err(validation_err) => {
                        normal_attempts += 1;
                        self.record_failed_attempt(ctx, endpoint, &validation_err, Some(&prepared), None, false);
                        if validation_err.kind.retry_in_place() && normal_attempts < PER_ENDPOINT_RETRY_CAP {
                            continue;
                        }
                        return Err(validation_err);
                    }
                }
            }

            let response_headers = header_map_to_log(response.headers());
            let body_text = response.text().await.unwrap_or_default();

            // Codex probing: any 4xx/5xx except auth errors flips the
            // endpoint to the converted path and retries immediately.
            if probing && use_native && (400..=599).contains(&status) && status != 401 && status != 403 {
                endpoint.set_native_codex_format(false);
                log::info!(
                    "endpoint '{}' rejected native codex format with {status}; converting to chat completions",
                    endpoint.name
                );
                continue;
            }

            // 400 learning: strip the rejected parameters and retry
            // without consuming the in-place cap.
            if status == 400 && learning_retries < MAX_LEARNING_RETRIES {
                let request_json: Value = serde_json::from_slice(&prepared.body).unwrap_or(Value::Null);
                let params = retry::learnable_params(&body_text, &request_json);
                if !params.is_empty() {
                    let newly = endpoint.learn_params(&params);
                    if !newly.is_empty() {
                        learning_retries += 1;
                        log::info!(
                            "endpoint '{}' rejected parameters {:?}; learned and retrying",
                            endpoint.name,
                            newly
                        );
                        let attempt_err = AttemptError::new(ErrorKind::Client, Some(status), "unsupported parameter");
                        self.record_failed_attempt(
                            ctx,
                            endpoint,
                            &attempt_err,
                            Some(&prepared),
                            Some((&response_headers, &body_text)),
                            true,
                        );
                        continue;
                    }
                }
            }

            // OAuth recovery: refresh once per request context, then
            // retry the same endpoint.
            if (status == 401 || status == 403)
                && matches!(endpoint.auth, AuthKind::Oauth)
                && !ctx.oauth_refreshed.contains(&endpoint.id)
            {
                ctx.oauth_refreshed.insert(endpoint.id.clone());
                match auth::refresh_oauth(endpoint, &self.oauth_http, self.persister.as_ref()).await {
                    Ok(_) => {
                        let attempt_err = AttemptError::new(ErrorKind::Client, Some(status), "auth expired; refreshed");
                        self.record_failed_attempt(
                            ctx,
                            endpoint,
                            &attempt_err,
                            Some(&prepared),
                            Some((&response_headers, &body_text)),
                            true,
                        );
                        continue;
                    }
                    Err(err) => {
                        log::warn!("oauth refresh failed for endpoint '{}': {err}", endpoint.name);
                    }
                }
            }

            let kind = classify_status(status);
            let attempt_err = AttemptError::new(kind, Some(status), truncate(&body_text, 512));
            normal_attempts += 1;
            self.record_failed_attempt(
                ctx,
                endpoint,
                &attempt_err,
                Some(&prepared),
                Some((&response_headers, &body_text)),
                false,
            );

            if kind.retry_in_place() && normal_attempts < PER_ENDPOINT_RETRY_CAP {
                continue;
            }
            return Err(attempt_err);
        }
    }

    fn apply_rate_limit_headers(&self, ctx: &RequestContext, endpoint: &Arc<Endpoint>, headers: &reqwest::header::HeaderMap) {
        if !endpoint.is_anthropic_domain() {
            return;
        }

        let reset = headers
            .get("anthropic-ratelimit-unified-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let status = headers
            .get("anthropic-ratelimit-unified-status")
            .and_then(|v| v.to_str().ok());

        if reset.is_none() && status.is_none() {
            return;
        }

        let update = endpoint.update_rate_limit(reset, status);

        if update.changed
            && let Some(persister) = &self.persister
            && let Some(state) = endpoint.rate_limit()
        {
            persister.persist_rate_limit(&endpoint.name, &state);
        }

        if update.deactivate && endpoint.is_available() {
            log::warn!(
                "endpoint '{}' reported allowed_warning under enhanced protection; deactivating",
                endpoint.name
            );
            endpoint.mark_inactive_with_reason(BlacklistReason {
                causing_request_ids: vec![ctx.request_id.clone()],
                blacklisted_at: jiff::Timestamp::now(),
                error_summary: "rate limit allowed_warning under enhanced protection".to_string(),
            });
        }
    }

    /// Turn a 2xx upstream response into the client response,
    /// converting and validating along the way.
    async fn process_success(
        &self,
        ctx: &mut RequestContext,
        endpoint: &Arc<Endpoint>,
        prepared: &transform::PreparedRequest,
        response: reqwest::Response,
    ) -> Result<Response, AttemptError> {
        let status = response.status().as_u16();
        let response_headers = header_map_to_log(response.headers());
        let declared_ct = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_lowercase);

        let route = self.response_route(ctx, endpoint, prepared);

        if declared_ct.as_deref().is_some_and(|ct| ct.contains("text/event-stream")) {
            return self.stream_response(ctx, endpoint, prepared, response, route, response_headers).await;
        }

        // Buffered response: read fully, then auto-detect.
        let body = response
            .bytes()
            .await
            .map_err(|err| AttemptError::new(ErrorKind::ResponseTimeout, Some(status), format!("body read failed: {err}")))?;

        let decision = validate::detect_content_type(declared_ct.as_deref(), &body);

        match decision.kind {
            validate::BodyKind::Sse => {
                self.buffered_sse_response(ctx, endpoint, prepared, status, &body, route, decision, response_headers)
            }
            validate::BodyKind::Json => {
                self.json_response(ctx, endpoint, prepared, status, &body, route, decision, response_headers)
            }
        }
    }

    fn response_route(
        &self,
        ctx: &RequestContext,
        endpoint: &Arc<Endpoint>,
        prepared: &transform::PreparedRequest,
    ) -> ResponseRoute {
        if endpoint.kind == EndpointKind::Anthropic {
            ResponseRoute::AnthropicPassthrough
        } else if prepared.format_converted && ctx.classification.format == RequestFormat::Anthropic {
            ResponseRoute::ToAnthropic
        } else if prepared.format_converted
            && ctx.request_path == "/responses"
            && ctx.classification.client == ClientType::Codex
        {
            ResponseRoute::ToResponses
        } else {
            ResponseRoute::OpenAiPassthrough
        }
    }

    fn model_restore_pair(&self, ctx: &RequestContext) -> Option<(String, String)> {
        match (&ctx.rewritten_model, &ctx.original_model) {
            (Some(rewritten), Some(original)) if rewritten != original => {
                Some((rewritten.clone(), original.clone()))
            }
            _ => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_response(
        &self,
        ctx: &mut RequestContext,
        endpoint: &Arc<Endpoint>,
        prepared: &transform::PreparedRequest,
        response: reqwest::Response,
        route: ResponseRoute,
        response_headers: HashMap<String, String>,
    ) -> Result<Response, AttemptError> {
        let restore_pair = self.model_restore_pair(ctx);

        let processor = match route {
            ResponseRoute::AnthropicPassthrough => StreamProcessor::AnthropicPassthrough {
                saw_start: false,
                saw_stop: false,
                restore: restore_pair,
            },
            ResponseRoute::OpenAiPassthrough => StreamProcessor::OpenAiPassthrough {
                complete: false,
                restore: restore_pair,
            },
            ResponseRoute::ToAnthropic => StreamProcessor::ToAnthropic {
                converter: convert::stream::OpenAiToAnthropicStream::new(
                    ctx.original_model.clone().unwrap_or_default(),
                    endpoint.repair_python_arguments,
                ),
                saw_done: false,
            },
            ResponseRoute::ToResponses => StreamProcessor::ToResponses {
                converter: convert::codex::ChatToResponsesStream::new(),
                saw_done: false,
                restore: restore_pair,
            },
        };

        let forwarded_headers = response_headers.clone();

        let mut log = self.base_log(ctx, endpoint);
        log.status_code = 200;
        log.is_streaming = true;
        log.final_request_headers = header_map_to_log(&prepared.headers);
        log.final_request_body = truncate(&String::from_utf8_lossy(&prepared.body), LOG_BODY_LIMIT);
        log.response_headers = response_headers;
        log.format_converted = prepared.format_converted;

        let finalizer = StreamFinalizer::new(Arc::clone(endpoint), self.sink(), log);
        let upstream = Box::pin(response.bytes_stream().eventsource());
        let mut stream = Box::pin(forward_sse(upstream, processor, finalizer));

        // Peek the first frame: a stream that dies before producing
        // anything has sent the client nothing, so it is still
        // retryable as an SSE validation failure.
        let Some(first) = stream.next().await else {
            return Err(AttemptError::new(
                ErrorKind::SseValidation,
                Some(200),
                "upstream stream ended without events",
            ));
        };

        let resumed = futures::stream::once(async move { first }).chain(stream);

        let mut builder = Response::builder().status(StatusCode::OK);
        builder = forward_response_headers(builder, &forwarded_headers);
        Ok(builder
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(resumed.map(Ok::<_, std::convert::Infallible>)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    }

    #[allow(clippy::too_many_arguments)]
    fn buffered_sse_response(
        &self,
        ctx: &mut RequestContext,
        endpoint: &Arc<Endpoint>,
        prepared: &transform::PreparedRequest,
        status: u16,
        body: &[u8],
        route: ResponseRoute,
        decision: validate::ContentTypeDecision,
        response_headers: HashMap<String, String>,
    ) -> Result<Response, AttemptError> {
        let text = String::from_utf8_lossy(body);
        let restore_pair = self.model_restore_pair(ctx);

        // Completeness validation on the buffered stream.
        let complete = match route {
            ResponseRoute::AnthropicPassthrough => validate::anthropic_sse_complete(&text),
            _ => validate::openai_sse_complete(&text),
        };
        if !complete {
            return Err(AttemptError::new(
                ErrorKind::SseValidation,
                Some(status),
                "buffered SSE body is incomplete",
            ));
        }

        let mut processor = match route {
            ResponseRoute::AnthropicPassthrough => StreamProcessor::AnthropicPassthrough {
                saw_start: false,
                saw_stop: false,
                restore: restore_pair,
            },
            ResponseRoute::OpenAiPassthrough => StreamProcessor::OpenAiPassthrough {
                complete: false,
                restore: restore_pair,
            },
            ResponseRoute::ToAnthropic => StreamProcessor::ToAnthropic {
                converter: convert::stream::OpenAiToAnthropicStream::new(
                    ctx.original_model.clone().unwrap_or_default(),
                    endpoint.repair_python_arguments,
                ),
                saw_done: false,
            },
            ResponseRoute::ToResponses => StreamProcessor::ToResponses {
                converter: convert::codex::ChatToResponsesStream::new(),
                saw_done: false,
                restore: restore_pair,
            },
        };

        let mut frames: Vec<Bytes> = Vec::new();
        for event in parse_buffered_sse(&text) {
            frames.extend(processor.on_event(&event));
        }
        let (tail, _) = processor.on_end();
        frames.extend(tail);

        let final_body: Vec<u8> = frames.iter().flat_map(|frame| frame.to_vec()).collect();

        endpoint.record_request(true, &ctx.request_id, None);

        let forwarded_headers = response_headers.clone();

        let mut log = self.base_log(ctx, endpoint);
        log.status_code = status;
        log.is_streaming = true;
        log.final_request_headers = header_map_to_log(&prepared.headers);
        log.final_request_body = truncate(&String::from_utf8_lossy(&prepared.body), LOG_BODY_LIMIT);
        log.response_headers = response_headers;
        log.response_body = truncate(&text, LOG_BODY_LIMIT);
        log.final_response_body = truncate(&String::from_utf8_lossy(&final_body), LOG_BODY_LIMIT);
        log.content_type_override = decision.overridden_to.map(str::to_string);
        log.format_converted = prepared.format_converted;
        log.duration_ms = ctx.elapsed_ms();
        self.spawn_save(log);

        let mut builder = Response::builder().status(status);
        builder = forward_response_headers(builder, &forwarded_headers);
        Ok(builder
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from(final_body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    }

    #[allow(clippy::too_many_arguments)]
    fn json_response(
        &self,
        ctx: &mut RequestContext,
        endpoint: &Arc<Endpoint>,
        prepared: &transform::PreparedRequest,
        status: u16,
        body: &[u8],
        route: ResponseRoute,
        decision: validate::ContentTypeDecision,
        response_headers: HashMap<String, String>,
    ) -> Result<Response, AttemptError> {
        let mut value: Value = serde_json::from_slice(body).map_err(|err| {
            AttemptError::new(
                ErrorKind::OtherValidation,
                Some(status),
                format!("response is not valid JSON: {err}"),
            )
        })?;

        let is_message_shaped = ctx.request_path.ends_with("/messages") || ctx.request_path.ends_with("/chat/completions");

        // Standard-response and usage validation, on message-shaped
        // responses only (count_tokens and models listings differ).
        if is_message_shaped {
            let schema_check = match route {
                ResponseRoute::AnthropicPassthrough => validate::validate_anthropic_json(&value),
                _ => validate::validate_openai_json(&value),
            };
            schema_check.map_err(|detail| AttemptError::new(ErrorKind::OtherValidation, Some(status), detail))?;

            if validate::usage_is_zeroed(&value) {
                return Err(AttemptError::new(
                    ErrorKind::UsageValidation,
                    Some(status),
                    "usage reports zero input and output tokens",
                ));
            }
        }

        let original_body = truncate(&String::from_utf8_lossy(body), LOG_BODY_LIMIT);

        if route == ResponseRoute::ToAnthropic {
            let chat: convert::openai::ChatCompletionResponse = serde_json::from_value(value).map_err(|err| {
                AttemptError::new(
                    ErrorKind::OtherValidation,
                    Some(status),
                    format!("chat completion response did not parse: {err}"),
                )
            })?;
            let converted = convert::response::openai_to_anthropic(chat)
                .map_err(|err| AttemptError::new(ErrorKind::OtherValidation, Some(status), err.to_string()))?;
            value = serde_json::to_value(&converted)
                .map_err(|err| AttemptError::new(ErrorKind::OtherValidation, Some(status), err.to_string()))?;
        }

        if let Some((rewritten, original)) = self.model_restore_pair(ctx) {
            restore::restore_model(&mut value, &rewritten, &original);
        }

        let final_body = serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec());

        endpoint.record_request(true, &ctx.request_id, None);

        let forwarded_headers = response_headers.clone();

        let mut log = self.base_log(ctx, endpoint);
        log.status_code = status;
        log.final_request_headers = header_map_to_log(&prepared.headers);
        log.final_request_body = truncate(&String::from_utf8_lossy(&prepared.body), LOG_BODY_LIMIT);
        log.response_headers = response_headers;
        log.response_body = original_body;
        log.final_response_body = truncate(&String::from_utf8_lossy(&final_body), LOG_BODY_LIMIT);
        log.content_type_override = decision.overridden_to.map(str::to_string);
        log.format_converted = prepared.format_converted;
        log.duration_ms = ctx.elapsed_ms();
        self.spawn_save(log);

        let mut builder = Response::builder().status(status);
        builder = forward_response_headers(builder, &forwarded_headers);
        Ok(builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(final_body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    }

    fn base_log(&self, ctx: &RequestContext, endpoint: &Arc<Endpoint>) -> RequestLog {
        RequestLog {
            request_id: ctx.request_id.clone(),
            attempt_number: ctx.attempt,
            endpoint: endpoint.name.clone(),
            method: ctx.method.to_string(),
            path: ctx.inbound_path.clone(),
            request_headers: header_map_to_log(&ctx.headers),
            request_body: truncate(&String::from_utf8_lossy(&ctx.body), LOG_BODY_LIMIT),
            model: ctx.original_model.clone(),
            rewritten_model: ctx.rewritten_model.clone(),
            thinking_enabled: ctx.thinking.map(|t| t.enabled).unwrap_or(false),
            thinking_budget_tokens: ctx.thinking.and_then(|t| t.budget_tokens),
            tags: ctx.tags.clone(),
            client_type: ctx.classification.client.label().to_string(),
            request_format: ctx.classification.format.label().to_string(),
            target_format: match endpoint.kind {
                EndpointKind::Anthropic => "anthropic".to_string(),
                EndpointKind::OpenAI => "openai".to_string(),
            },
            detection_confidence: ctx.classification.confidence,
            detected_by: ctx.classification.detected_by.to_string(),
            session_id: ctx.session_id.clone(),
            created_at: Some(jiff::Timestamp::now()),
            ..RequestLog::default()
        }
    }

    fn record_failed_attempt(
        &self,
        ctx: &mut RequestContext,
        endpoint: &Arc<Endpoint>,
        err: &AttemptError,
        prepared: Option<&transform::PreparedRequest>,
        response: Option<(&HashMap<String, String>, &str)>,
        skip_health_record: bool,
    ) {
        ctx.last_error = Some(err.clone());

        if !skip_health_record {
            let outcome = endpoint.record_request(false, &ctx.request_id, Some(&err.summary));
            if let Some(reason) = outcome.became_inactive {
                log::warn!(
                    "endpoint '{}' marked inactive (caused by {:?}): {}",
                    endpoint.name,
                    reason.causing_request_ids,
                    reason.error_summary
                );
            }
        }

        let mut log = self.base_log(ctx, endpoint);
        log.status_code = err.status.unwrap_or(0);
        log.error = Some(format!("{}: {}", err.kind.label(), err.summary));
        log.duration_ms = ctx.elapsed_ms();
        if let Some(prepared) = prepared {
            log.final_request_headers = header_map_to_log(&prepared.headers);
            log.final_request_body = truncate(&String::from_utf8_lossy(&prepared.body), LOG_BODY_LIMIT);
            log.format_converted = prepared.format_converted;
        }
        if let Some((headers, body)) = response {
            log.response_headers = headers.clone();
            log.response_body = truncate(body, LOG_BODY_LIMIT);
        }
        self.spawn_save(log);
    }

    fn emit_virtual_blacklist_log(&self, ctx: &RequestContext, endpoint: &Arc<Endpoint>, reason: &BlacklistReason) {
        let mut log = self.base_log(ctx, endpoint);
        log.status_code = 503;
        log.error = Some("endpoint_blacklisted".to_string());
        log.blacklist_causing_request_ids = reason.causing_request_ids.clone();
        log.duration_ms = ctx.elapsed_ms();
        self.spawn_save(log);
    }

    fn spawn_save(&self, log: RequestLog) {
        let sink = self.sink();
        tokio::spawn(async move {
            sink.save_log(log).await;
        });
    }
}

/// How the upstream response maps back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseRoute {
    AnthropicPassthrough,
    OpenAiPassthrough,
    ToAnthropic,
    ToResponses,
}

fn truncate(input: &str, limit: usize) -> String {
    if input.len() <= limit {
        input.to_string()
    } else {
        let mut cut = limit;
        while !input.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…[truncated]", &input[..cut])
    }
}

fn header_map_to_log(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

/// Headers recomputed by the proxy or tied to the original transfer.
const UNFORWARDED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "content-type",
    "transfer-encoding",
    "connection",
];

fn forward_response_headers(
    mut builder: http::response::Builder,
    headers: &HashMap<String, String>,
) -> http::response::Builder {
    for (name, value) in headers {
        if UNFORWARDED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Parse a buffered SSE body into events (event name + joined data
/// lines per blank-line-separated block).
fn parse_buffered_sse(text: &str) -> Vec<Event> {
    let mut events = Vec::new();
    let mut name = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    let mut flush = |name: &mut String, data_lines: &mut Vec<&str>, events: &mut Vec<Event>| {
        if data_lines.is_empty() {
            name.clear();
            return;
        }
        events.push(Event {
            event: if name.is_empty() { "message".to_string() } else { std::mem::take(name) },
            data: data_lines.join("\n"),
            id: String::new(),
            retry: None,
        });
        data_lines.clear();
        name.clear();
    };

    for line in text.lines() {
        if line.is_empty() {
            flush(&mut name, &mut data_lines, &mut events);
        } else if let Some(value) = line.strip_prefix("event:") {
            name = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start());
        }
        // Comments and other fields are ignored.
    }
    flush(&mut name, &mut data_lines, &mut events);

    events
}
