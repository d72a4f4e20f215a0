//! Outbound `fetch()` bridge.
//!
//! A fetch is three steps from JS: `op_fetch_open` registers a cancel handle
//! and an empty body slot in the request state, `op_fetch_send` performs the
//! request (following redirects by hand so every hop is checked against the
//! [`FetchPolicy`](crate::config::FetchPolicy)) and parks the response body
//! stream in the slot, and `op_fetch_read` pulls chunks out of it for the
//! JS `ReadableStream`. Aborting the JS signal cancels the handle, which
//! fails any in-flight send or read.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, LOCATION};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::EngineConfig;
use crate::engine::{native, JsEngine, OpReturn, OpValue};
use crate::error::{JsError, OpError};
use crate::request_state::Resource;

use super::{with_request, SharedHost};

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("host '{0}' is not allowed by the fetch policy")]
    Denied(String),
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("'{0}' is not a valid HTTP method")]
    InvalidMethod(String),
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),
    #[error("redirect to {0} blocked by redirect mode 'error'")]
    RedirectBlocked(String),
    #[error("the operation was aborted")]
    Aborted,
    #[error("{}", describe_reqwest(.0))]
    Http(#[from] reqwest::Error),
}

/// `reqwest` errors with their source chain, which carries the useful part
/// (connection refused, DNS failure, ...).
fn describe_reqwest(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

impl From<FetchError> for OpError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Aborted => OpError::abort("The operation was aborted"),
            FetchError::InvalidMethod(_) | FetchError::InvalidHeader(_) => OpError::type_error(err.to_string()),
            other => OpError::Network {
                cause: other.to_string(),
            },
        }
    }
}

// ── Body slot ────────────────────────────────────────────────────────────

type BodyStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Response body of one outbound fetch, filled once the headers arrive.
#[derive(Clone)]
pub struct FetchBody {
    stream: Arc<Mutex<Option<BodyStream>>>,
    cancel: CancellationToken,
}

impl FetchBody {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            stream: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    async fn fill(&self, stream: BodyStream) {
        *self.stream.lock().await = Some(stream);
    }

    /// Next chunk, or `None` at the end of the body.
    pub async fn next_chunk(&self) -> Result<Option<Bytes>, FetchError> {
        let mut slot = self.stream.lock().await;
        let next = match slot.as_mut() {
            None => return Ok(None),
            Some(stream) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Aborted),
                next = stream.next() => next,
            },
        };
        match next {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => {
                *slot = None;
                Err(err.into())
            }
            None => {
                *slot = None;
                Ok(None)
            }
        }
    }
}

// ── Outbound requests ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    Follow,
    Manual,
    Error,
}

impl RedirectMode {
    fn parse(mode: &str) -> Result<Self, OpError> {
        match mode {
            "follow" => Ok(RedirectMode::Follow),
            "manual" => Ok(RedirectMode::Manual),
            "error" => Ok(RedirectMode::Error),
            other => Err(OpError::type_error(format!("invalid redirect mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub redirect: RedirectMode,
}

impl Outbound {
    pub fn new(
        method: &str,
        url: &str,
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
        redirect: RedirectMode,
    ) -> Result<Self, FetchError> {
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| FetchError::InvalidMethod(method.into()))?;
        let url = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.into()))?;
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| FetchError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
            map.append(name, value);
        }
        Ok(Self {
            method,
            url,
            headers: map,
            body,
            redirect,
        })
    }

    /// Rewrite for the next hop of a redirect with `status`.
    fn redirect_to(&mut self, status: StatusCode, next: Url) {
        let to_get = (status == StatusCode::SEE_OTHER && self.method != Method::HEAD)
            || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND) && self.method == Method::POST);
        if to_get {
            self.method = Method::GET;
            self.body = None;
            let content: Vec<HeaderName> = self
                .headers
                .keys()
                .filter(|name| name.as_str().starts_with("content-"))
                .cloned()
                .collect();
            for name in content {
                self.headers.remove(name);
            }
        }
        if next.origin() != self.url.origin() {
            self.headers.remove(AUTHORIZATION);
        }
        self.url = next;
    }
}

/// Response head handed back to JS.
pub struct FetchHead {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub url: String,
    pub redirected: bool,
}

impl FetchHead {
    fn to_value(&self) -> OpValue {
        let headers: Vec<JsonValue> = self
            .headers
            .iter()
            .map(|(k, v)| JsonValue::Array(vec![k.clone().into(), v.clone().into()]))
            .collect();
        OpValue::List(vec![
            OpValue::Number(self.status as f64),
            OpValue::String(self.status_text.clone()),
            OpValue::Json(JsonValue::Array(headers)),
            OpValue::String(self.url.clone()),
            OpValue::Bool(self.redirected),
        ])
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Send `request`, following redirects per its mode. Every hop is checked
/// against the policy and gets the matching injected headers.
pub async fn send(
    client: &reqwest::Client,
    config: &EngineConfig,
    mut request: Outbound,
) -> Result<(reqwest::Response, bool), FetchError> {
    let mut hops = 0;
    loop {
        match request.url.scheme() {
            "http" | "https" => {}
            other => return Err(FetchError::UnsupportedScheme(other.to_string())),
        }
        let host = request
            .url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(request.url.to_string()))?
            .to_string();
        if !config.fetch.is_allowed(&host) {
            return Err(FetchError::Denied(host));
        }

        let mut headers = request.headers.clone();
        for rule in config.fetch.headers_for(&host) {
            let name = HeaderName::from_bytes(rule.header.as_bytes())
                .map_err(|_| FetchError::InvalidHeader(rule.header.clone()))?;
            let value = HeaderValue::from_str(&rule.value).map_err(|_| FetchError::InvalidHeader(rule.header.clone()))?;
            headers.insert(name, value);
        }
        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        tracing::debug!(method = %request.method, url = %request.url, "outbound fetch");
        let response = builder.send().await?;

        let status = response.status();
        if !is_followed_redirect(status) || request.redirect == RedirectMode::Manual {
            return Ok((response, hops > 0));
        }
        let Some(location) = response.headers().get(LOCATION) else {
            return Ok((response, hops > 0));
        };
        let location = location
            .to_str()
            .map_err(|_| FetchError::InvalidUrl(String::from_utf8_lossy(location.as_bytes()).into_owned()))?;
        let next = request
            .url
            .join(location)
            .map_err(|_| FetchError::InvalidUrl(location.to_string()))?;
        if request.redirect == RedirectMode::Error {
            return Err(FetchError::RedirectBlocked(next.to_string()));
        }
        hops += 1;
        if hops > config.fetch.max_redirects {
            return Err(FetchError::TooManyRedirects(config.fetch.max_redirects));
        }
        request.redirect_to(status, next);
    }
}

fn head_of(response: &reqwest::Response, redirected: bool) -> FetchHead {
    FetchHead {
        status: response.status().as_u16(),
        status_text: response.status().canonical_reason().unwrap_or_default().to_string(),
        headers: response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect(),
        url: response.url().to_string(),
        redirected,
    }
}

// ── Ops ──────────────────────────────────────────────────────────────────

fn cancel_token(state: &crate::request_state::RequestState, rid: u32) -> Result<CancellationToken, OpError> {
    match state.resource(rid)? {
        Resource::Cancel(token) => Ok(token.clone()),
        _ => Err(OpError::type_error(format!("resource {rid} is not a cancel handle"))),
    }
}

fn fetch_body(state: &crate::request_state::RequestState, rid: u32) -> Result<FetchBody, OpError> {
    match state.resource(rid)? {
        Resource::FetchBody(body) => Ok(body.clone()),
        _ => Err(OpError::type_error(format!("resource {rid} is not a fetch body"))),
    }
}

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    let h = host.clone();
    engine.register_fn(
        "op_fetch_open",
        native(move |args| {
            let (cancel, body) = with_request(&h, &args, 0, |state| {
                let token = state.cancel.child_token();
                let cancel = state.add_resource(Resource::Cancel(token.clone()));
                let body = state.add_resource(Resource::FetchBody(FetchBody::new(token)));
                Ok((cancel, body))
            })?;
            OpReturn::value(OpValue::List(vec![cancel.into(), body.into()]))
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_fetch_send",
        native(move |args| {
            let request_id = args.u64(0)?;
            let cancel_rid = args.u32(1)?;
            let body_rid = args.u32(2)?;
            let headers: Vec<(String, String)> = args.parse(5)?;
            let request = Outbound::new(
                &args.string(3)?,
                &args.string(4)?,
                &headers,
                args.opt_bytes(6)?,
                RedirectMode::parse(&args.string(7)?)?,
            )?;
            let (token, body) = with_request(&h, &args, 0, |state| {
                Ok((cancel_token(state, cancel_rid)?, fetch_body(state, body_rid)?))
            })?;
            let (client, config) = {
                let host = h.borrow();
                (host.http.clone(), host.config.clone())
            };
            OpReturn::future(request_id, async move {
                let (response, redirected) = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(FetchError::Aborted.into()),
                    sent = send(&client, &config, request) => sent.map_err(|err| {
                        tracing::debug!(request_id, %err, "outbound fetch failed");
                        OpError::from(err)
                    })?,
                };
                let head = head_of(&response, redirected);
                body.fill(response.bytes_stream().boxed()).await;
                Ok(head.to_value())
            })
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_fetch_read",
        native(move |args| {
            let request_id = args.u64(0)?;
            let body_rid = args.u32(1)?;
            let body = with_request(&h, &args, 0, |state| fetch_body(state, body_rid))?;
            OpReturn::future(request_id, async move {
                match body.next_chunk().await? {
                    Some(chunk) => Ok(OpValue::Bytes(chunk.to_vec())),
                    None => Ok(OpValue::Null),
                }
            })
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_fetch_cancel",
        native(move |args| {
            let cancel_rid = args.u32(1)?;
            with_request(&h, &args, 0, |state| {
                if let Ok(token) = cancel_token(state, cancel_rid) {
                    token.cancel();
                }
                Ok(())
            })?;
            OpReturn::undefined()
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_fetch_close",
        native(move |args| {
            let cancel_rid = args.u32(1)?;
            let body_rid = args.u32(2)?;
            let request_id = args.u64(0)?;
            if let Ok(state) = h.borrow_mut().requests.get_mut(request_id) {
                if let Some(Resource::Cancel(token)) = state.take_resource(cancel_rid) {
                    token.cancel();
                }
                state.take_resource(body_rid);
            }
            OpReturn::undefined()
        }),
    );

    engine.eval("<fetch-setup>", FETCH_JS)?;
    Ok(())
}

const FETCH_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const NULL_BODY_STATUS = [101, 204, 205, 304];

    async function run(request, signal, rid, settle) {
        const bodyState = edge.requestBody(request);
        const body = bodyState.isNull ? null : await bodyState.consume();
        const [cancelRid, bodyRid] = ops.op_fetch_open(rid);
        let closed = false;
        const close = () => {
            if (closed) return;
            closed = true;
            signal.removeEventListener('abort', onAbort);
            ops.op_fetch_close(rid, cancelRid, bodyRid);
        };
        const onAbort = () => {
            ops.op_fetch_cancel(rid, cancelRid);
            settle.reject(signal.reason);
        };
        signal.addEventListener('abort', onAbort, { once: true });

        let head;
        try {
            head = await ops.op_fetch_send(rid, cancelRid, bodyRid, request.method, request.url,
                edge.headerList(request.headers), body, request.redirect);
        } catch (err) {
            close();
            throw signal.aborted ? signal.reason : err;
        }
        const [status, statusText, headers, url, redirected] = head;
        if (NULL_BODY_STATUS.includes(status) || request.method === 'HEAD') close();
        const stream = new ReadableStream({
            async pull(c) {
                let chunk;
                try {
                    chunk = await ops.op_fetch_read(rid, bodyRid);
                } catch (err) {
                    close();
                    throw signal.aborted ? signal.reason : err;
                }
                if (chunk === null) {
                    close();
                    c.close();
                } else {
                    c.enqueue(chunk);
                }
            },
            cancel() { close(); },
        }, { highWaterMark: 0 });
        return edge.fetchedResponse(status, statusText, headers, stream, url, redirected);
    }

    globalThis.fetch = function fetch(input, init) {
        return new Promise((resolve, reject) => {
            let settled = false;
            const settle = {
                resolve(v) { if (!settled) { settled = true; resolve(v); } },
                reject(e) { if (!settled) { settled = true; reject(e); } },
            };
            let request;
            try {
                request = new Request(input, init);
            } catch (err) {
                settle.reject(err);
                return;
            }
            const signal = request.signal;
            if (signal.aborted) {
                settle.reject(signal.reason);
                return;
            }
            run(request, signal, edge.rid(), settle).then(settle.resolve, settle.reject);
        });
    };
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(method: &str, url: &str, headers: &[(&str, &str)]) -> Outbound {
        let headers: Vec<(String, String)> = headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Outbound::new(method, url, &headers, Some(b"payload".to_vec()), RedirectMode::Follow).unwrap()
    }

    #[test]
    fn see_other_switches_to_get_and_drops_body() {
        let mut req = outbound("PUT", "https://a.example/x", &[("content-type", "text/plain"), ("x-keep", "1")]);
        req.redirect_to(StatusCode::SEE_OTHER, Url::parse("https://a.example/y").unwrap());
        assert_eq!(req.method, Method::GET);
        assert!(req.body.is_none());
        assert!(req.headers.get("content-type").is_none());
        assert!(req.headers.get("x-keep").is_some());
    }

    #[test]
    fn temporary_redirect_keeps_method_and_body() {
        let mut req = outbound("POST", "https://a.example/x", &[]);
        req.redirect_to(StatusCode::TEMPORARY_REDIRECT, Url::parse("https://a.example/y").unwrap());
        assert_eq!(req.method, Method::POST);
        assert!(req.body.is_some());

        let mut req = outbound("POST", "https://a.example/x", &[]);
        req.redirect_to(StatusCode::FOUND, Url::parse("https://a.example/y").unwrap());
        assert_eq!(req.method, Method::GET);
    }

    #[test]
    fn cross_origin_redirect_drops_authorization() {
        let mut req = outbound("GET", "https://a.example/x", &[("authorization", "Bearer t")]);
        req.redirect_to(StatusCode::FOUND, Url::parse("https://a.example/y").unwrap());
        assert!(req.headers.get(AUTHORIZATION).is_some());
        req.redirect_to(StatusCode::FOUND, Url::parse("https://b.example/y").unwrap());
        assert!(req.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let none: Vec<(String, String)> = Vec::new();
        assert!(matches!(
            Outbound::new("GE T", "https://a.example", &none, None, RedirectMode::Follow),
            Err(FetchError::InvalidMethod(_))
        ));
        assert!(matches!(
            Outbound::new("GET", "not a url", &none, None, RedirectMode::Follow),
            Err(FetchError::InvalidUrl(_))
        ));
        let bad = vec![("x-bad".to_string(), "a\nb".to_string())];
        assert!(matches!(
            Outbound::new("GET", "https://a.example", &bad, None, RedirectMode::Follow),
            Err(FetchError::InvalidHeader(_))
        ));
    }

    #[test]
    fn errors_map_to_js_classes() {
        let denied = OpError::from(FetchError::Denied("evil.example".into()));
        assert_eq!(denied.js_name(), "TypeError");
        assert_eq!(denied.message(), "Failed to fetch");
        assert!(matches!(denied, OpError::Network { ref cause } if cause.contains("evil.example")));
        assert_eq!(OpError::from(FetchError::Aborted).js_name(), "AbortError");
        assert!(matches!(OpError::from(FetchError::InvalidMethod("x".into())), OpError::Type(_)));
    }

    #[test]
    fn redirect_modes_parse() {
        assert_eq!(RedirectMode::parse("manual").unwrap(), RedirectMode::Manual);
        assert!(RedirectMode::parse("bogus").is_err());
    }

    #[tokio::test]
    async fn denied_hosts_never_hit_the_network() {
        let mut config = EngineConfig::default();
        config.fetch.allowed_hosts = vec!["allowed.example".into()];
        let client = reqwest::Client::new();
        let req = outbound("GET", "https://denied.example/", &[]);
        let err = send(&client, &config, req).await.unwrap_err();
        assert!(matches!(err, FetchError::Denied(host) if host == "denied.example"));

        let req = outbound("GET", "ftp://allowed.example/", &[]);
        let err = send(&client, &config, req).await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn empty_body_slot_reads_as_end() {
        let body = FetchBody::new(CancellationToken::new());
        assert!(body.next_chunk().await.unwrap().is_none());
        let cancelled = CancellationToken::new();
        let body = FetchBody::new(cancelled.clone());
        body.fill(futures_util::stream::pending().boxed()).await;
        cancelled.cancel();
        assert!(matches!(body.next_chunk().await, Err(FetchError::Aborted)));
    }
}
