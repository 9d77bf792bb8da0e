use std::time::Duration;

use thiserror::Error;

use crate::{
    endpoints::{PATH_RELAY_STATE, PATH_TELEMETRY},
    types::{RelayState, TelemetryReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: Option<&'a [u8]>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Io(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("invalid payload: {0}")]
    Payload(String),
}

/// One blocking HTTP exchange with the server.
///
/// Implementations open whatever connection they need inside the call and
/// release it before returning, on success, error and timeout alike. Every
/// request body is JSON. No retries.
pub trait HttpExchange {
    fn exchange(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, TransportError>;
}

/// The three server operations and their success criteria.
#[derive(Debug)]
pub struct ServerClient<H> {
    http: H,
    timeout: Duration,
}

impl<H: HttpExchange> ServerClient<H> {
    pub fn new(http: H, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Succeeds on any response; only a missing response is a failure.
    pub fn push_telemetry(&mut self, report: &TelemetryReport) -> Result<u16, TransportError> {
        let body =
            serde_json::to_vec(report).map_err(|err| TransportError::Payload(err.to_string()))?;
        let response = self.http.exchange(HttpRequest {
            method: Method::Post,
            path: PATH_TELEMETRY,
            body: Some(&body),
            timeout: self.timeout,
        })?;
        Ok(response.status)
    }

    pub fn push_relay_state(&mut self, state: RelayState) -> Result<(), TransportError> {
        let body =
            serde_json::to_vec(&state).map_err(|err| TransportError::Payload(err.to_string()))?;
        let response = self.http.exchange(HttpRequest {
            method: Method::Post,
            path: PATH_RELAY_STATE,
            body: Some(&body),
            timeout: self.timeout,
        })?;
        match response.status {
            200 => Ok(()),
            status => Err(TransportError::Status(status)),
        }
    }

    /// Both fields are required; a body missing either one is rejected.
    pub fn fetch_relay_state(&mut self) -> Result<RelayState, TransportError> {
        let response = self.http.exchange(HttpRequest {
            method: Method::Get,
            path: PATH_RELAY_STATE,
            body: None,
            timeout: self.timeout,
        })?;
        if response.status != 200 {
            return Err(TransportError::Status(response.status));
        }
        serde_json::from_slice(&response.body)
            .map_err(|err| TransportError::Payload(err.to_string()))
    }
}
