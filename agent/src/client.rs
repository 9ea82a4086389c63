use std::fmt::{self, Write as _};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use h2::RecvStream;
use http::header::CONTENT_TYPE;
use http::response::Parts;
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use serde_json::Value;
use tokio::time::timeout;
use tracing::error;

use crate::agent::{global_agent, Agent, SessionOptions};
use crate::error::{Error, HttpError};
use crate::session::RequestStream;
use crate::DEFAULT_RESPONSE_TIMEOUT;

const EOL: u8 = b'\n';

type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Mutable view of an outgoing request, handed to `before_request` hooks.
pub struct RequestContext {
    pub url: Uri,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Read-only view of a buffered response, handed to `after_response` hooks
/// once the body has been consumed. `body` is `None` when decoding failed.
pub struct ResponseContext<'a> {
    pub status: StatusCode,
    pub status_message: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a Body>,
}

pub type BeforeRequestHook = Box<dyn Fn(&mut RequestContext) -> Result<(), HookError> + Send + Sync>;
pub type AfterResponseHook =
    Box<dyn Fn(&ResponseContext<'_>) -> Result<(), HookError> + Send + Sync>;

/// Hook failures are logged and never fail the request.
#[derive(Default)]
pub struct Hooks {
    pub before_request: Vec<BeforeRequestHook>,
    pub after_response: Vec<AfterResponseHook>,
}

pub struct ClientOptions {
    /// Base URL every request path is resolved against. Must be absolute.
    pub prefix_url: String,
    /// Default headers, overridable per request.
    pub headers: HeaderMap,
    pub hooks: Hooks,
    /// Deadline for response headers to arrive. `None` falls back to the
    /// crate default.
    pub response_timeout: Option<Duration>,
    /// Connection options forwarded to the agent. Together with the origin
    /// of `prefix_url` they select the session group requests run on.
    pub connection: SessionOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            prefix_url: String::new(),
            headers: HeaderMap::new(),
            hooks: Hooks::default(),
            response_timeout: None,
            connection: SessionOptions::default(),
        }
    }
}

#[derive(Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    /// Query parameters, percent-encoded and appended to the url.
    pub search_params: Option<Vec<(String, String)>>,
    pub body: Option<Bytes>,
    /// Serialized as the request body with a `application/json` content type.
    /// Takes precedence over `body`.
    pub json: Option<Value>,
    pub response_timeout: Option<Duration>,
}

/// A decoded response payload.
///
/// The content type of the response picks the variant: `application/json`
/// parses into [`Body::Json`], `text/*` into [`Body::Text`], anything else
/// stays raw.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
    Raw(Bytes),
}

impl Body {
    pub(crate) fn decode(content_type: Option<&str>, data: Bytes) -> Result<Body, Error> {
        if data.is_empty() {
            return Ok(Body::Raw(data));
        }
        match content_type {
            Some(ct) if ct.starts_with("application/json") => {
                Ok(Body::Json(serde_json::from_slice(&data)?))
            }
            Some(ct) if ct.starts_with("text/") => {
                Ok(Body::Text(String::from_utf8_lossy(&data).into_owned()))
            }
            _ => Ok(Body::Raw(data)),
        }
    }

    /// The `message` field of a JSON object body, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Body::Json(value) => value.get("message").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// HTTP client bound to one origin and one session identity.
///
/// All requests of a client run on the session group selected by its
/// `prefix_url` origin and connection options; concurrent requests multiplex
/// onto as few sessions as their number allows.
pub struct Client {
    agent: Agent,
    options: ClientOptions,
    origin: String,
    base_path: String,
}

impl Client {
    /// Builds a client on the process-wide agent.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        Self::with_agent(global_agent().clone(), options)
    }

    pub fn with_agent(agent: Agent, options: ClientOptions) -> Result<Self, Error> {
        let url: Uri = options
            .prefix_url
            .parse()
            .map_err(|_| Error::Config(format!("invalid prefix url: {}", options.prefix_url)))?;
        let (scheme, host) = match (url.scheme_str(), url.host()) {
            (Some(scheme), Some(host)) => (scheme, host),
            _ => {
                return Err(Error::Config(format!(
                    "prefix url must be absolute: {}",
                    options.prefix_url
                )))
            }
        };
        let origin = match url.port_u16() {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        };
        let base_path = url.path().trim_end_matches('/').to_owned();
        Ok(Client {
            agent,
            options,
            origin,
            base_path,
        })
    }

    /// Issues a request and resolves once the response headers arrive. The
    /// status is not inspected; callers get the response as-is.
    pub async fn fetch(&self, path: &str, options: RequestOptions) -> Result<Response, Error> {
        let url = self.resolve(path, &options)?;
        let mut headers = merge_headers(&self.options.headers, &options.headers);
        let body = match &options.json {
            Some(json) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                Some(Bytes::from(serde_json::to_vec(json)?))
            }
            None => options.body.clone(),
        };
        let mut ctx = RequestContext {
            url,
            method: options.method.clone(),
            headers,
            body,
        };
        for hook in &self.options.hooks.before_request {
            if let Err(err) = hook(&mut ctx) {
                error!(%err, "before-request hook failed");
            }
        }

        let mut request = Request::builder()
            .method(ctx.method)
            .uri(ctx.url)
            .body(())
            .map_err(|err| Error::Config(err.to_string()))?;
        *request.headers_mut() = ctx.headers;

        let mut stream = self
            .agent
            .request(&self.origin, &self.options.connection, request, ctx.body)
            .await?;

        let deadline = options
            .response_timeout
            .or(self.options.response_timeout)
            .unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        let response = match timeout(deadline, stream.response()).await {
            Ok(response) => response?,
            Err(_) => {
                stream.cancel();
                return Err(Error::ResponseTimeout(deadline));
            }
        };
        let (parts, body) = response.into_parts();

        Ok(Response {
            parts,
            body,
            stream,
        })
    }

    /// Issues a request and hands back the streaming response. A status of
    /// 400 or above buffers the body and converts into an [`HttpError`].
    pub async fn stream(&self, path: &str, options: RequestOptions) -> Result<Response, Error> {
        let response = self.fetch(path, options).await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let headers = response.parts.headers.clone();
            let body = response.body().await.ok();
            return Err(HttpError::new(status, Some(headers), body).into());
        }
        Ok(response)
    }

    /// Issues a request and buffers the whole response body. The
    /// `after_response` hooks run here, with the decoded body in hand. A
    /// status of 400 or above converts into an [`HttpError`] carrying the
    /// buffered body.
    pub async fn request(&self, path: &str, options: RequestOptions) -> Result<Body, Error> {
        let response = self.fetch(path, options).await?;
        let status = response.status();
        let headers = response.parts.headers.clone();
        let body = response.body().await;
        {
            let ctx = ResponseContext {
                status,
                status_message: status.canonical_reason().unwrap_or("Unknown Status"),
                headers: &headers,
                body: body.as_ref().ok(),
            };
            for hook in &self.options.hooks.after_response {
                if let Err(err) = hook(&ctx) {
                    error!(%err, "after-response hook failed");
                }
            }
        }
        if status.as_u16() >= 400 {
            return Err(HttpError::new(status, Some(headers), body.ok()).into());
        }
        body
    }

    fn resolve(&self, path: &str, options: &RequestOptions) -> Result<Uri, Error> {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };
        let mut target = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("{}/{}", self.base_path, path)
        };
        let mut sep = '?';
        if let Some(query) = query {
            target.push(sep);
            target.push_str(query);
            sep = '&';
        }
        if let Some(params) = &options.search_params {
            for (key, value) in params {
                target.push(sep);
                sep = '&';
                encode_component(&mut target, key);
                target.push('=');
                encode_component(&mut target, value);
            }
        }
        format!("{}{}", self.origin, target)
            .parse()
            .map_err(|_| Error::Config(format!("invalid request path: {}", path)))
    }
}

/// Override semantics: a header set per request replaces all client-level
/// values of that name.
fn merge_headers(base: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for key in overrides.keys() {
        merged.remove(key);
    }
    for (key, value) in overrides {
        merged.append(key, value.clone());
    }
    merged
}

fn encode_component(out: &mut String, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
}

/// An in-flight response. Dropping it resets the underlying stream, so
/// abandoned responses never pin their session open.
pub struct Response {
    parts: Parts,
    body: RecvStream,
    stream: RequestStream,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.parts.status)
            .field("headers", &self.parts.headers)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn ok(&self) -> bool {
        self.parts.status.is_success()
    }

    pub fn redirected(&self) -> bool {
        self.parts.status.is_redirection()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.parts
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    /// Buffers the remaining body and decodes it by content type.
    pub async fn body(mut self) -> Result<Body, Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.data().await {
            let chunk = chunk?;
            let _ = self.body.flow_control().release_capacity(chunk.len());
            buf.extend_from_slice(&chunk);
        }
        let content_type = self
            .parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        Body::decode(content_type, buf.freeze())
    }

    /// Turns the body into a lazy sequence of newline-delimited records, each
    /// decoded like a buffered body. Empty lines are skipped.
    pub fn into_lines(self) -> Lines {
        let content_type = self.content_type().map(str::to_owned);
        Lines {
            body: self.body,
            _stream: self.stream,
            content_type,
            buf: BytesMut::new(),
            done: false,
        }
    }

    /// Resets the underlying stream.
    pub fn cancel(mut self) {
        self.stream.cancel();
    }
}

/// Lazy newline-delimited view of a response body.
pub struct Lines {
    body: RecvStream,
    _stream: RequestStream,
    content_type: Option<String>,
    buf: BytesMut,
    done: bool,
}

impl Lines {
    /// The next decoded record, or `None` once the stream ends. A transport
    /// error ends the sequence after being yielded once.
    pub async fn next(&mut self) -> Option<Result<Body, Error>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&byte| byte == EOL) {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if line.is_empty() {
                    continue;
                }
                return Some(Body::decode(self.content_type.as_deref(), line.freeze()));
            }
            if self.done {
                if self.buf.is_empty() {
                    return None;
                }
                let line = self.buf.split().freeze();
                return Some(Body::decode(self.content_type.as_deref(), line));
            }
            match self.body.data().await {
                Some(Ok(chunk)) => {
                    let _ = self.body.flow_control().release_capacity(chunk.len());
                    self.buf.extend_from_slice(&chunk);
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
                None => self.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOptions;
    use crate::error::is_http_error;
    use crate::testing::{Behavior, DuplexConnector};
    use serde_json::json;
    use std::sync::Arc;

    fn client(behavior: Behavior) -> (Client, Arc<DuplexConnector>) {
        crate::testing::init_tracing();
        let connector = DuplexConnector::new(behavior);
        let agent = Agent::with_connector(AgentOptions::default(), connector.clone());
        let client = Client::with_agent(
            agent,
            ClientOptions {
                prefix_url: "https://example.org/api".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();
        (client, connector)
    }

    #[test]
    fn prefix_url_must_be_absolute() {
        assert!(matches!(
            Client::new(ClientOptions {
                prefix_url: "/api".to_owned(),
                ..Default::default()
            }),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn paths_resolve_against_the_prefix_url() {
        let (client, _) = client(Behavior::default());
        let url = client.resolve("pods", &RequestOptions::default()).unwrap();
        assert_eq!(url.to_string(), "https://example.org/api/pods");

        let url = client.resolve("/healthz", &RequestOptions::default()).unwrap();
        assert_eq!(url.to_string(), "https://example.org/healthz");

        let options = RequestOptions {
            search_params: Some(vec![("label selector".to_owned(), "a=b".to_owned())]),
            ..Default::default()
        };
        let url = client.resolve("pods?watch=true", &options).unwrap();
        assert_eq!(
            url.to_string(),
            "https://example.org/api/pods?watch=true&label%20selector=a%3Db"
        );
    }

    #[test]
    fn request_headers_override_client_headers() {
        let mut base = HeaderMap::new();
        base.insert("x-a", HeaderValue::from_static("1"));
        base.insert("x-b", HeaderValue::from_static("2"));
        let mut overrides = HeaderMap::new();
        overrides.insert("x-b", HeaderValue::from_static("3"));
        let merged = merge_headers(&base, &overrides);
        assert_eq!(merged.get("x-a").unwrap(), "1");
        assert_eq!(merged.get("x-b").unwrap(), "3");
    }

    #[tokio::test]
    async fn request_buffers_and_decodes_json() {
        let (client, connector) = client(Behavior {
            body: vec![Bytes::from_static(b"{\"ok\":true}")],
            ..Default::default()
        });
        let body = client.request("foo", RequestOptions::default()).await.unwrap();
        assert_eq!(body, Body::Json(json!({ "ok": true })));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn status_errors_carry_the_body_message() {
        let (client, _) = client(Behavior {
            status: 404,
            body: vec![Bytes::from_static(b"{\"message\":\"not here\"}")],
            ..Default::default()
        });
        let err = client.request("foo", RequestOptions::default()).await.unwrap_err();
        assert!(is_http_error(&err, &[404]));
        assert_eq!(err.to_string(), "not here");
    }

    #[tokio::test]
    async fn stream_rejects_error_statuses() {
        let (client, _) = client(Behavior {
            status: 503,
            body: vec![],
            ..Default::default()
        });
        let err = client.stream("foo", RequestOptions::default()).await.unwrap_err();
        assert!(is_http_error(&err, &[503]));
    }

    #[tokio::test]
    async fn redirect_statuses_are_flagged() {
        let (client, _) = client(Behavior {
            status: 302,
            ..Default::default()
        });
        let response = client.fetch("foo", RequestOptions::default()).await.unwrap();
        assert!(response.redirected());
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn after_response_hooks_see_the_buffered_body() {
        crate::testing::init_tracing();
        let connector = DuplexConnector::new(Behavior {
            body: vec![Bytes::from_static(b"{\"ok\":true}")],
            ..Default::default()
        });
        let agent = Agent::with_connector(AgentOptions::default(), connector);
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = seen.clone();
        let mut hooks = Hooks::default();
        hooks.after_response.push(Box::new(move |ctx: &ResponseContext<'_>| {
            *sink.lock().unwrap() = Some((ctx.status, ctx.body.cloned()));
            Ok(())
        }));
        let client = Client::with_agent(
            agent,
            ClientOptions {
                prefix_url: "https://example.org/api".to_owned(),
                hooks,
                ..Default::default()
            },
        )
        .unwrap();
        client.request("foo", RequestOptions::default()).await.unwrap();
        let (status, body) = seen.lock().unwrap().take().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Some(Body::Json(json!({ "ok": true }))));
    }

    #[tokio::test]
    async fn response_timeout_cancels_the_stream() {
        let (client, _) = client(Behavior {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let options = RequestOptions {
            response_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let err = client.fetch("foo", options).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, Error::ResponseTimeout(_)));
    }

    #[tokio::test]
    async fn lines_reassemble_records_across_chunks() {
        let (client, _) = client(Behavior {
            body: vec![
                Bytes::from_static(b"{\"a\":1}\n{\"b\""),
                Bytes::from_static(b":2}\n\n{\"c\":3}"),
            ],
            ..Default::default()
        });
        let response = client.stream("foo", RequestOptions::default()).await.unwrap();
        let mut lines = response.into_lines();
        assert_eq!(lines.next().await.unwrap().unwrap(), Body::Json(json!({ "a": 1 })));
        assert_eq!(lines.next().await.unwrap().unwrap(), Body::Json(json!({ "b": 2 })));
        assert_eq!(lines.next().await.unwrap().unwrap(), Body::Json(json!({ "c": 3 })));
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn json_payload_sets_the_content_type() {
        let (client, _) = client(Behavior::default());
        let options = RequestOptions {
            method: Method::POST,
            json: Some(json!({ "spec": { "replicas": 2 } })),
            ..Default::default()
        };
        // The in-process peer ignores the payload; this exercises the
        // serialization path end to end.
        client.request("foo", options).await.unwrap();
    }
}
