//! HTTP boundary for the telemetry service.
//!
//! The uploader and consent resolver talk to the service through the
//! [`TelemetryTransport`] trait so tests can drive them with a scripted
//! in-memory transport. The production implementation is a thin ureq
//! wrapper; callers in async contexts run it via `spawn_blocking`.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout for the production transport.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum TransportError {
    /// The service answered with a non-2xx status.
    #[error("request failed with status {0}")]
    Status(u16),

    /// The request never produced an HTTP response.
    #[error("network error: {0}")]
    Network(String),

    /// A 2xx response carried a body we could not parse.
    #[error("malformed response body: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Client errors are terminal; retrying cannot help.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Status(code) if (400..500).contains(code))
    }

    /// Server errors and network failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Status(code) if (500..600).contains(code)) || self.is_network()
    }

    /// Network-level failures flip the uploader into offline mode.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Blocking HTTP operations against the telemetry service.
pub trait TelemetryTransport: Send + Sync {
    fn get(&self, path: &str) -> Result<Value, TransportError>;
    fn post(&self, path: &str, body: &Value) -> Result<Value, TransportError>;
    fn patch(&self, path: &str, body: &Value) -> Result<Value, TransportError>;
}

/// Production transport: JSON over HTTPS, bearer-token authenticated.
pub struct HttpTransport {
    agent: ureq::Agent,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            base_url: base_url.into(),
            auth_token,
        }
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = join_url(&self.base_url, path);
        let req = self.agent.request(method, &url);
        match &self.auth_token {
            Some(token) => req.set("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }

    fn send(&self, method: &str, path: &str, body: Option<&Value>) -> Result<Value, TransportError> {
        let req = self.request(method, path);
        let response = match body {
            Some(body) => req.send_json(body),
            None => req.call(),
        };
        match response {
            Ok(resp) => parse_body(resp),
            Err(ureq::Error::Status(code, _)) => Err(TransportError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(TransportError::Network(err.to_string())),
        }
    }
}

impl TelemetryTransport for HttpTransport {
    fn get(&self, path: &str) -> Result<Value, TransportError> {
        self.send("GET", path, None)
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
        self.send("POST", path, Some(body))
    }

    fn patch(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
        self.send("PATCH", path, Some(body))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Acks may be empty; an empty body parses as null.
fn parse_body(response: ureq::Response) -> Result<Value, TransportError> {
    let text = response
        .into_string()
        .map_err(|e| TransportError::Network(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| TransportError::Malformed(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_terminal() {
        assert!(TransportError::Status(400).is_client_error());
        assert!(TransportError::Status(404).is_client_error());
        assert!(!TransportError::Status(400).is_retryable());
        assert!(!TransportError::Status(500).is_client_error());
    }

    #[test]
    fn server_errors_and_network_failures_retryable() {
        assert!(TransportError::Status(500).is_retryable());
        assert!(TransportError::Status(503).is_retryable());
        assert!(TransportError::Network("connection refused".to_string()).is_retryable());
        assert!(!TransportError::Malformed("bad json".to_string()).is_retryable());
    }

    #[test]
    fn only_network_failures_flip_offline() {
        assert!(TransportError::Network("dns".to_string()).is_network());
        assert!(!TransportError::Status(500).is_network());
        assert!(!TransportError::Malformed("x".to_string()).is_network());
    }

    #[test]
    fn join_url_handles_trailing_slash() {
        assert_eq!(
            join_url("https://t.example.com/", "/api/v1/consent"),
            "https://t.example.com/api/v1/consent"
        );
        assert_eq!(
            join_url("https://t.example.com", "/api/v1/consent"),
            "https://t.example.com/api/v1/consent"
        );
    }

    #[test]
    fn error_messages_are_descriptive() {
        assert_eq!(
            TransportError::Status(503).to_string(),
            "request failed with status 503"
        );
        assert!(TransportError::Network("refused".to_string())
            .to_string()
            .contains("refused"));
    }
}
