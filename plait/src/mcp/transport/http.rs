//! Streamable-HTTP transport: POST single JSON-RPC messages, accept
//! `application/json` or `text/event-stream` responses.
//!
//! Two deadlines apply: the request `timeout` for the round trip and
//! `sse_read_timeout` for gaps in an event stream. The server's
//! `MCP-Session-Id` header is captured whenever present and replayed on every
//! subsequent request. Redirects are not followed across hosts.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::{redirect, Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::McpError;
use crate::mcp::jsonrpc::{
    parse_response_body, NotificationMessage, RequestMessage, ResultMessage, PROTOCOL_VERSION,
};

/// Duplex (request/response) channel to one streamable-HTTP MCP server.
pub struct HttpTransport {
    client: Client,
    url: String,
    /// Extra headers (e.g. an API key) sent on every request.
    headers: Vec<(String, String)>,
    /// Session id from the server's MCP-Session-Id header.
    session_id: Mutex<Option<String>>,
}

/// Follows redirects only within the original host.
fn same_host_redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        if attempt.previous().len() > 5 {
            return attempt.error("too many redirects");
        }
        let same_host = attempt
            .previous()
            .first()
            .and_then(|first| first.host_str().map(|h| Some(h) == attempt.url().host_str()))
            .unwrap_or(false);
        if same_host {
            attempt.follow()
        } else {
            attempt.stop()
        }
    })
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        headers: impl IntoIterator<Item = (String, String)>,
        timeout: Duration,
        sse_read_timeout: Duration,
    ) -> Result<Self, McpError> {
        let client = Client::builder()
            .timeout(timeout)
            .read_timeout(sse_read_timeout)
            .redirect(same_host_redirect_policy())
            .build()
            .map_err(|e| McpError::connection(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            headers: headers.into_iter().collect(),
            session_id: Mutex::new(None),
        })
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Ok(guard) = self.session_id.lock() {
            if let Some(sid) = guard.as_deref() {
                req = req.header("MCP-Session-Id", sid);
            }
        }
        req
    }

    fn remember_session_id(&self, resp: &reqwest::Response) {
        let sid = resp
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok());
        if let Some(sid) = sid {
            debug!(session_id = sid, "captured MCP session id");
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(sid.to_string());
            }
        }
    }

    fn status_error(method: &str, status: StatusCode, body: &str) -> McpError {
        let body = if body.is_empty() { "no body" } else { body };
        let message = format!("{} HTTP {}: {}", method, status, body);
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => McpError::Auth {
                message,
                context: Default::default(),
            },
            s if s.is_server_error() => McpError::server(message, Some(s.as_u16() as i64)),
            _ => McpError::connection(message),
        }
    }

    /// Sends one request and parses the JSON-RPC response out of the body,
    /// bounded by `deadline`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<ResultMessage, McpError> {
        // Transport calls allocate ids locally; callers match on the returned
        // message, not the wire id.
        let request = RequestMessage::new(format!("plait-{}", method), method, params);
        let body = serde_json::to_vec(&request)
            .map_err(|e| McpError::connection(format!("serialize request: {}", e)))?;

        let req = self.apply_headers(self.client.post(&self.url)).body(body);
        let resp = tokio::time::timeout(deadline, req.send())
            .await
            .map_err(|_| McpError::timeout(method, deadline))?
            .map_err(|e| {
                if e.is_timeout() {
                    McpError::timeout(method, deadline)
                } else {
                    McpError::connection(e.to_string())
                }
            })?;

        self.remember_session_id(&resp);
        let status = resp.status();
        let is_sse = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);
        let text = resp
            .text()
            .await
            .map_err(|e| McpError::connection(format!("response body: {}", e)))?;
        if !status.is_success() {
            return Err(Self::status_error(method, status, &text));
        }
        parse_response_body(&text, is_sse)
    }

    /// Fire-and-forget notification; 202 Accepted and any 2xx are fine.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = NotificationMessage::new(method, params);
        let body = serde_json::to_vec(&notification)
            .map_err(|e| McpError::connection(format!("serialize notification: {}", e)))?;
        let req = self.apply_headers(self.client.post(&self.url)).body(body);
        let resp = req
            .send()
            .await
            .map_err(|e| McpError::connection(e.to_string()))?;
        self.remember_session_id(&resp);
        let status = resp.status();
        if status == StatusCode::ACCEPTED || status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(Self::status_error(method, status, &text))
    }
}
