// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Forwarding of requests to a chosen backend.
//!
//! The inbound body is read once under a size cap. The backend answer is
//! streamed back as it arrives; dropping the inbound request drops the
//! outbound call with it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header, uri::Authority},
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use super::State;
use super::error::HttpError;
use crate::metrics::{Endpoint, InflightGuard};
use crate::selector::{self, Route, RoutingError};
use crate::tasks::{SyncTask, TaskEnqueuer};

/// Never forwarded to a backend
const PROXY_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "origin",
    "referer",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-user",
    "authorization",
    "authentication",
    "content-length",
    "host",
];

/// Meaningful for a single connection only
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");

/// Read the whole body, failing once it exceeds `limit` bytes.
pub async fn read_body_limited(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes, HttpError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(HttpError::payload_too_large());
    }

    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            tracing::debug!(%err, "Failed reading request body");
            HttpError::bad_request("unable to read request body")
        })?;
        if buffer.len() + chunk.len() > limit {
            return Err(HttpError::payload_too_large());
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// The non-blank `model` field of a JSON object body
pub fn extract_model(body: &[u8]) -> Result<String, HttpError> {
    let invalid = || HttpError::bad_request("invalid JSON payload");
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|_| invalid())?;
    let object = value.as_object().ok_or_else(invalid)?;
    let model = match object.get("model") {
        None | Some(serde_json::Value::Null) => "",
        Some(serde_json::Value::String(model)) => model.trim(),
        Some(_) => return Err(invalid()),
    };
    if model.is_empty() {
        return Err(HttpError::bad_request("model is required"));
    }
    Ok(model.to_string())
}

/// Map a gateway path onto the backend's OpenAI compatible API.
///
/// `/api/...` moves under `/v1`, relative paths are prefixed with `/v1/` and
/// any other absolute path is kept as is.
pub fn normalize_llm_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return "/v1".to_string();
    }
    if let Some(rest) = path.strip_prefix("/api/") {
        return format!("/v1/{rest}");
    }
    if !path.starts_with('/') {
        return format!("/v1/{path}");
    }
    path.to_string()
}

pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    for name in PROXY_HEADERS {
        headers.remove(*name);
    }
}

pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Set the `X-Forwarded-*` family on `outbound` from the inbound request.
///
/// The host is the `Host` header, or the request target's authority when
/// there is none (HTTP/2 `:authority`).
pub fn apply_forward_headers(
    inbound: &HeaderMap,
    authority: Option<&Authority>,
    outbound: &mut HeaderMap,
    client: Option<IpAddr>,
) {
    if let Some(ip) = client {
        let forwarded = match inbound.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.trim().is_empty() => format!("{}, {ip}", prior.trim()),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            outbound.insert(X_FORWARDED_FOR, value);
        }
    }

    let host = inbound
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.trim().is_empty())
        .or_else(|| authority.map(Authority::as_str));
    if let Some(value) = host.and_then(|h| HeaderValue::from_str(h).ok()) {
        outbound.insert(X_FORWARDED_HOST, value);
    }

    if !outbound.contains_key(&X_FORWARDED_PROTO) {
        outbound.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !outbound.contains_key(&X_FORWARDED_PORT) {
        let port = host
            .and_then(host_port)
            .map(HeaderValue::from)
            .unwrap_or_else(|| HeaderValue::from_static("80"));
        outbound.insert(X_FORWARDED_PORT, port);
    }
}

/// Port part of a `Host` value, IPv6 literals included
fn host_port(host: &str) -> Option<u16> {
    let (_, port) = host.rsplit_once(':')?;
    if port.contains(']') {
        return None;
    }
    port.parse().ok()
}

/// Triggers a resync of one backend when dropped, after the response body
/// has been relayed or abandoned.
struct ResyncOnDrop {
    tasks: Arc<dyn TaskEnqueuer>,
    backend_id: String,
}

impl Drop for ResyncOnDrop {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(backend = %self.backend_id, "No runtime to enqueue backend sync");
            return;
        };
        let tasks = self.tasks.clone();
        let backend_id = std::mem::take(&mut self.backend_id);
        handle.spawn(async move {
            let task = match SyncTask::sync_backend(&backend_id) {
                Ok(task) => task,
                Err(err) => {
                    tracing::error!(backend = %backend_id, %err, "Invalid backend sync");
                    return;
                }
            };
            match tasks.enqueue(task).await {
                Ok(task_id) => tracing::debug!(backend = %backend_id, %task_id, "Backend sync enqueued"),
                Err(err) => tracing::error!(backend = %backend_id, %err, "Failed enqueuing backend sync"),
            }
        });
    }
}

/// What to send to the chosen backend
pub struct Outbound {
    pub route: Route,
    pub method: Method,
    /// Path on the backend, already normalized
    pub path: String,
    pub query: Option<String>,
    /// Authority of the inbound request target
    pub authority: Option<Authority>,
    pub headers: HeaderMap,
    pub client: Option<IpAddr>,
    pub body: Bytes,
    /// Enqueue a sync of the backend after a successful answer
    pub resync: bool,
}

/// Build the backend URL: address without trailing slash, then path and query.
pub fn target_url(address: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", address.trim().trim_end_matches('/'), path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Send `outbound` and stream the answer back.
pub async fn forward(
    state: &State,
    outbound: Outbound,
    mut guard: Option<InflightGuard>,
) -> Result<Response, HttpError> {
    let Outbound {
        route,
        method,
        path,
        query,
        authority,
        headers: inbound,
        client,
        body,
        resync,
    } = outbound;

    let url = target_url(&route.address, &path, query.as_deref());
    let mut headers = inbound.clone();
    strip_proxy_headers(&mut headers);
    apply_forward_headers(&inbound, authority.as_ref(), &mut headers, client);

    let upstream = state
        .client()
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|err| {
            tracing::error!(backend_id = %route.id, %path, %err, "Backend request failed");
            HttpError::bad_gateway()
        })?;

    let status = upstream.status();
    if let Some(guard) = guard.as_mut() {
        guard.mark_status(status);
    }
    let resync = match state.tasks() {
        Some(tasks) if resync && (200..400).contains(&status.as_u16()) => Some(ResyncOnDrop {
            tasks: tasks.clone(),
            backend_id: route.id.clone(),
        }),
        _ => None,
    };

    let mut response_headers = upstream.headers().clone();
    strip_hop_headers(&mut response_headers);
    response_headers.remove(header::CONTENT_LENGTH);

    let backend_id = route.id;
    let stream = async_stream::stream! {
        let _guard = guard;
        let _resync = resync;
        let mut body = upstream.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => yield Ok::<Bytes, std::io::Error>(chunk),
                Err(err) => {
                    tracing::warn!(backend_id = %backend_id, %path, %err, "Backend response interrupted");
                    yield Err(std::io::Error::other(err));
                    break;
                }
            }
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Client address recorded by `into_make_service_with_connect_info`
fn client_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Proxy an OpenAI style request to the backend best placed for its model.
pub async fn dispatch_inference(state: Arc<State>, endpoint: Endpoint, request: Request) -> Response {
    let guard = state.metrics_clone().create_inflight_guard(endpoint);
    match inference(&state, guard, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn inference(state: &State, guard: InflightGuard, request: Request) -> Result<Response, HttpError> {
    let client = client_ip(&request);
    let (parts, body) = request.into_parts();
    let body = read_body_limited(&parts.headers, body, state.max_body_bytes()).await?;
    let model = extract_model(&body)?;

    let states = state.registry().list().await.map_err(|err| {
        tracing::error!(%err, "Failed listing backends for routing");
        HttpError::new(StatusCode::BAD_GATEWAY, "failed to select backend")
    })?;
    let route = selector::select_for_model(&states, &model).map_err(|err| match err {
        RoutingError::NoHealthyBackends => HttpError::from(err),
        other => {
            tracing::error!(%model, err = %other, "Failed selecting backend");
            HttpError::new(StatusCode::BAD_GATEWAY, "failed to select backend")
        }
    })?;
    tracing::debug!(%model, backend_id = %route.id, "Routing request");

    let outbound = Outbound {
        route,
        method: parts.method,
        path: normalize_llm_path(parts.uri.path()),
        query: parts.uri.query().map(str::to_string),
        authority: parts.uri.authority().cloned(),
        headers: parts.headers,
        client,
        body,
        resync: false,
    };
    forward(state, outbound, Some(guard)).await
}

/// Native admin calls exposed per backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCall {
    Ps,
    Version,
    Show,
    Create,
    Copy,
    Pull,
    Push,
    Delete,
}

impl AdminCall {
    pub fn method(&self) -> Method {
        match self {
            AdminCall::Ps | AdminCall::Version => Method::GET,
            AdminCall::Delete => Method::DELETE,
            _ => Method::POST,
        }
    }

    /// Path of the backend's native API
    pub fn native_path(&self) -> &'static str {
        match self {
            AdminCall::Ps => "/api/ps",
            AdminCall::Version => "/api/version",
            AdminCall::Show => "/api/show",
            AdminCall::Create => "/api/create",
            AdminCall::Copy => "/api/copy",
            AdminCall::Pull => "/api/pull",
            AdminCall::Push => "/api/push",
            AdminCall::Delete => "/api/delete",
        }
    }

    /// Whether the call can change what the backend has installed
    pub fn mutates(&self) -> bool {
        !matches!(self, AdminCall::Ps | AdminCall::Version | AdminCall::Show)
    }
}

/// Proxy a native admin call to backend `id`.
pub async fn dispatch_admin(state: Arc<State>, id: String, call: AdminCall, request: Request) -> Response {
    let guard = state
        .metrics_clone()
        .create_inflight_guard(Endpoint::BackendAdmin);
    match admin(&state, guard, &id, call, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn admin(
    state: &State,
    guard: InflightGuard,
    id: &str,
    call: AdminCall,
    request: Request,
) -> Result<Response, HttpError> {
    if id.trim().is_empty() {
        return Err(RoutingError::NotFound.into());
    }
    let states = state.registry().list().await?;
    let route = selector::select_by_id(&states, id).inspect_err(|err| {
        tracing::warn!(backend_id = %id, path = call.native_path(), %err, "Cannot route admin call");
    })?;

    let client = client_ip(&request);
    let (parts, body) = request.into_parts();
    let method = call.method();
    let body = if method == Method::GET {
        Bytes::new()
    } else {
        read_body_limited(&parts.headers, body, state.max_body_bytes()).await?
    };

    let outbound = Outbound {
        route,
        method,
        path: call.native_path().to_string(),
        query: parts.uri.query().map(str::to_string),
        authority: parts.uri.authority().cloned(),
        headers: parts.headers,
        client,
        body,
        resync: call.mutates(),
    };
    forward(state, outbound, Some(guard)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "/v1")]
    #[case(" ", "/v1")]
    #[case("/", "/")]
    #[case("/api", "/api")]
    #[case("/api/chat/completions", "/v1/chat/completions")]
    #[case("/api/embeddings", "/v1/embeddings")]
    #[case("/v1/completions", "/v1/completions")]
    #[case("/v1", "/v1")]
    #[case("chat/completions", "/v1/chat/completions")]
    #[case("/other", "/other")]
    #[case("/v1x", "/v1x")]
    fn test_normalize_llm_path(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_llm_path(input), expected);
    }

    #[rstest]
    #[case(r#"{"model":"llama3"}"#, Ok("llama3"))]
    #[case(r#"{"model":"  qwen2:7b "}"#, Ok("qwen2:7b"))]
    #[case(r#"{"model":""}"#, Err("model is required"))]
    #[case(r#"{"model":null}"#, Err("model is required"))]
    #[case(r#"{"messages":[]}"#, Err("model is required"))]
    #[case(r#"{"model":7}"#, Err("invalid JSON payload"))]
    #[case(r#"["llama3"]"#, Err("invalid JSON payload"))]
    #[case("{not json", Err("invalid JSON payload"))]
    fn test_extract_model(#[case] body: &str, #[case] expected: Result<&str, &str>) {
        let result = extract_model(body.as_bytes());
        match expected {
            Ok(model) => assert_eq!(result.expect("model"), model),
            Err(message) => {
                let err = result.expect_err("rejected");
                assert_eq!(err.code, StatusCode::BAD_REQUEST);
                assert_eq!(err.message, message);
            }
        }
    }

    #[tokio::test]
    async fn test_read_body_limited() {
        let headers = HeaderMap::new();
        let body = read_body_limited(&headers, Body::from("12345"), 5)
            .await
            .expect("at limit");
        assert_eq!(&body[..], b"12345");

        let err = read_body_limited(&headers, Body::from("123456"), 5)
            .await
            .expect_err("over limit");
        assert_eq!(err.code, StatusCode::PAYLOAD_TOO_LARGE);

        let mut declared = HeaderMap::new();
        declared.insert(header::CONTENT_LENGTH, HeaderValue::from_static("100"));
        let err = read_body_limited(&declared, Body::empty(), 5)
            .await
            .expect_err("declared over limit");
        assert_eq!(err.code, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_outbound_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("gateway.local:8443"));
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        inbound.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
        inbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        inbound.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        inbound.insert("x-forwarded-proto", HeaderValue::from_static("https"));

        let mut outbound = inbound.clone();
        strip_proxy_headers(&mut outbound);
        apply_forward_headers(
            &inbound,
            None,
            &mut outbound,
            Some("192.168.1.7".parse().expect("ip")),
        );

        for gone in ["host", "authorization", "origin", "connection", "sec-fetch-mode"] {
            assert!(!outbound.contains_key(gone), "{gone} forwarded");
        }
        assert_eq!(outbound[header::CONTENT_TYPE], "application/json");
        assert_eq!(outbound["x-forwarded-for"], "10.0.0.1, 192.168.1.7");
        assert_eq!(outbound["x-forwarded-host"], "gateway.local:8443");
        assert_eq!(outbound["x-forwarded-proto"], "https");
        assert_eq!(outbound["x-forwarded-port"], "8443");
    }

    #[test]
    fn test_forward_header_defaults() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        let mut outbound = HeaderMap::new();
        apply_forward_headers(&inbound, None, &mut outbound, None);
        assert!(!outbound.contains_key("x-forwarded-for"));
        assert_eq!(outbound["x-forwarded-proto"], "http");
        assert_eq!(outbound["x-forwarded-port"], "80");

        let mut outbound = HeaderMap::new();
        apply_forward_headers(&HeaderMap::new(), None, &mut outbound, None);
        assert!(!outbound.contains_key("x-forwarded-host"));
        assert_eq!(outbound["x-forwarded-port"], "80");

        assert_eq!(host_port("[::1]:9000"), Some(9000));
        assert_eq!(host_port("[::1]"), None);
    }

    #[test]
    fn test_forward_headers_from_authority() {
        let authority: Authority = "gateway.local:8443".parse().expect("authority");
        let mut outbound = HeaderMap::new();
        apply_forward_headers(&HeaderMap::new(), Some(&authority), &mut outbound, None);
        assert_eq!(outbound["x-forwarded-host"], "gateway.local:8443");
        assert_eq!(outbound["x-forwarded-port"], "8443");

        // an explicit Host header wins
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("front.local:9000"));
        let mut outbound = HeaderMap::new();
        apply_forward_headers(&inbound, Some(&authority), &mut outbound, None);
        assert_eq!(outbound["x-forwarded-host"], "front.local:9000");
        assert_eq!(outbound["x-forwarded-port"], "9000");
    }

    #[rstest]
    #[case("http://gpu-a:11434/", "/v1/chat/completions", None, "http://gpu-a:11434/v1/chat/completions")]
    #[case(" http://gpu-a:11434 ", "/api/ps", Some("verbose=1"), "http://gpu-a:11434/api/ps?verbose=1")]
    #[case("http://gpu-a:11434", "/api/ps", Some(""), "http://gpu-a:11434/api/ps")]
    fn test_target_url(
        #[case] address: &str,
        #[case] path: &str,
        #[case] query: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(target_url(address, path, query), expected);
    }
}
