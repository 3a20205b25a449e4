//! Outbound HTTP plumbing shared by the catalog source and the conversion
//! gateway.
//!
//! `ureq` is blocking, so every call runs on tokio's blocking pool and is
//! additionally bounded by `tokio::time::timeout`. A stalled socket can
//! therefore never hold an API request longer than the configured timeout plus
//! a small grace period.

use std::{
    io,
    time::{Duration, Instant},
};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("mixdeck/", env!("CARGO_PKG_VERSION"));
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Everything that can go wrong talking to a third-party service. Callers
/// convert this into a degraded outcome before it reaches the HTTP layer.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{service} is not configured")]
    NotConfigured { service: &'static str },
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("upstream answered HTTP {status}{}", detail_suffix(.detail))]
    Status { status: u16, detail: Option<String> },
    #[error("upstream unreachable: {0}")]
    Transport(String),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
    #[error("upstream rejected the request: {0}")]
    Rejected(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|detail| format!(": {detail}"))
        .unwrap_or_default()
}

/// A GET request with query parameters and headers, owned so it can move
/// onto the blocking pool.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    url: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout.min(MAX_CONNECT_TIMEOUT))
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self { agent, timeout }
    }

    /// Issues the request and decodes the JSON body into `T`.
    pub async fn get_json<T>(&self, request: OutboundRequest) -> Result<T, UpstreamError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        debug!(url = request.url(), "outbound request");
        let agent = self.agent.clone();
        let timeout = self.timeout;
        let task = tokio::task::spawn_blocking(move || fetch_blocking(&agent, &request, timeout));

        match tokio::time::timeout(timeout + JOIN_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(UpstreamError::Transport(format!(
                "request task failed: {err}"
            ))),
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        }
    }
}

fn fetch_blocking<T: DeserializeOwned>(
    agent: &ureq::Agent,
    request: &OutboundRequest,
    timeout: Duration,
) -> Result<T, UpstreamError> {
    let mut call = agent.get(&request.url);
    for (key, value) in &request.query {
        call = call.query(key, value);
    }
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }

    let started = Instant::now();
    let response = call
        .call()
        .map_err(|err| classify(err, timeout, started.elapsed()))?;
    let body = response.into_string().map_err(|err| {
        if is_timeout(&err) {
            UpstreamError::Timeout(timeout)
        } else {
            UpstreamError::Transport(err.to_string())
        }
    })?;
    serde_json::from_str(&body).map_err(|err| UpstreamError::Malformed(err.to_string()))
}

fn classify(err: ureq::Error, timeout: Duration, elapsed: Duration) -> UpstreamError {
    match err {
        ureq::Error::Status(status, response) => UpstreamError::Status {
            status,
            detail: status_detail(response),
        },
        ureq::Error::Transport(transport) => {
            let timed_out = std::error::Error::source(&transport)
                .and_then(|source| source.downcast_ref::<io::Error>())
                .is_some_and(is_timeout);
            if timed_out || elapsed >= timeout {
                UpstreamError::Timeout(timeout)
            } else {
                UpstreamError::Transport(transport.to_string())
            }
        }
    }
}

/// Pulls `message` or `error` out of a JSON error body, if there is one.
fn status_detail(response: ureq::Response) -> Option<String> {
    let body = response.into_string().ok()?;
    let value: serde_json::Value = serde_json::from_str(&body).ok()?;
    ["message", "error"]
        .iter()
        .filter_map(|key| value.get(*key)?.as_str())
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::Router;

    /// Serves `router` on an ephemeral local port and returns its base URL.
    pub(crate) async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}
