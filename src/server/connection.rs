//! Per-participant connection loop.
//!
//! Each connection speaks line-delimited JSON-RPC 2.0: one request per line,
//! one response line per request that carries an id. The connection owns at
//! most one session, which is removed from the registry when the peer goes
//! away.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::handlers::{
    handle_document_exists, handle_start_session, handle_trial_data, parse_params,
};
use super::rpc::{codes, methods, ExistsParams, JsonRpcRequest, JsonRpcResponse, StartSessionParams};
use super::SharedState;
use crate::error::{AppError, ProtocolError};

/// State of one open connection.
pub struct Connection {
    state: SharedState,
    peer: String,
    session_id: Option<String>,
}

impl Connection {
    pub fn new(state: SharedState, peer: impl Into<String>) -> Self {
        Self {
            state,
            peer: peer.into(),
            session_id: None,
        }
    }

    /// Session started on this connection, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Serve requests until the peer closes the stream.
    ///
    /// A line longer than the configured limit gets an error response and
    /// ends the connection.
    pub async fn run<R, W>(mut self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(peer = %self.peer, "Participant connected");

        let max_line = self.state.config.server.max_line_bytes as u64;
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        let result = loop {
            line.clear();
            let bytes_read = match (&mut reader).take(max_line).read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => break Err(e),
            };

            // EOF reached
            if bytes_read == 0 {
                break Ok(());
            }

            if bytes_read as u64 >= max_line && !line.ends_with('\n') {
                warn!(peer = %self.peer, max_line, "Request line too long, closing connection");
                let response = JsonRpcResponse::error(
                    None,
                    codes::INVALID_REQUEST,
                    format!("Request line exceeds {} bytes", max_line),
                );
                break write_response(&mut writer, &response).await;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(peer = %self.peer, request = %trimmed, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    error!(peer = %self.peer, error = %e, "Failed to parse request");
                    Some(JsonRpcResponse::error(
                        None,
                        codes::PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            // Notifications get no response
            if let Some(response) = response {
                if let Err(e) = write_response(&mut writer, &response).await {
                    break Err(e);
                }
            }
        };

        self.close().await;
        result
    }

    async fn close(&mut self) {
        match self.session_id.take() {
            Some(session_id) => {
                self.state.registry.remove(&session_id).await;
                info!(peer = %self.peer, session_id = %session_id, "Participant disconnected");
            }
            None => info!(peer = %self.peer, "Connection closed without a session"),
        }
    }

    /// Handle one request. Returns `None` for notifications.
    pub async fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        if request.jsonrpc != "2.0" {
            warn!(peer = %self.peer, version = %request.jsonrpc, "Unsupported JSON-RPC version");
            return (!is_notification).then(|| {
                JsonRpcResponse::error(
                    request.id,
                    codes::INVALID_REQUEST,
                    "Invalid request: jsonrpc must be \"2.0\"",
                )
            });
        }

        match request.method.as_str() {
            methods::TRIAL_DATA => {
                let outcome = handle_trial_data(&self.state, request.params).await;
                if is_notification {
                    if let Err(e) = &outcome {
                        warn!(peer = %self.peer, error = %e, "Trial data not stored");
                    }
                    return None;
                }
                Some(match outcome {
                    Ok(id) => JsonRpcResponse::success(request.id, serde_json::json!({ "id": id })),
                    Err(e) => JsonRpcResponse::from_app_error(request.id, &e),
                })
            }
            methods::START_SESSION => {
                let outcome = self.start_session(request.params).await;
                respond(request.id, outcome)
            }
            methods::DOCUMENT_EXISTS => {
                let outcome = match parse_params::<ExistsParams>(methods::DOCUMENT_EXISTS, request.params) {
                    Ok(params) => handle_document_exists(&self.state, params)
                        .await
                        .map(Value::Bool),
                    Err(e) => Err(e),
                };
                respond(request.id, outcome)
            }
            methods::PING => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                if is_notification {
                    debug!(method = %method, "Unknown notification, ignoring");
                    None
                } else {
                    error!(method = %method, "Unknown method");
                    let err = AppError::from(ProtocolError::UnknownMethod {
                        method: method.to_string(),
                    });
                    Some(JsonRpcResponse::from_app_error(request.id, &err))
                }
            }
        }
    }

    async fn start_session(&mut self, params: Option<Value>) -> Result<Value, AppError> {
        if let Some(session_id) = &self.session_id {
            return Err(ProtocolError::SessionAlreadyStarted {
                session_id: session_id.clone(),
            }
            .into());
        }

        let params: StartSessionParams = parse_params(methods::START_SESSION, params)?;
        let assignment = handle_start_session(&self.state, params).await?;
        self.session_id = Some(assignment.session_id.clone());

        serde_json::to_value(assignment).map_err(|e| AppError::Internal {
            message: format!("Failed to serialize assignment: {}", e),
        })
    }
}

/// Response for a request, or nothing for a notification.
fn respond(id: Option<Value>, outcome: Result<Value, AppError>) -> Option<JsonRpcResponse> {
    let id = id?;
    Some(match outcome {
        Ok(value) => JsonRpcResponse::success(Some(id), value),
        Err(e) => JsonRpcResponse::from_app_error(Some(id), &e),
    })
}

async fn write_response<W>(writer: &mut W, response: &JsonRpcResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response_json = serde_json::to_string(response)?;
    debug!(response = %response_json, "Sending response");
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
