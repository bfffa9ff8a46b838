//! Participant-side connection to the experiment server.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ProtocolError, ProtocolResult, RecorderError, RecorderResult};
use crate::recorder::{AnnotatedRecord, ResultSink};
use crate::server::rpc::{
    methods, ExistsParams, JsonRpcRequest, JsonRpcResponse, SessionAssignment, StartSessionParams,
};

/// JSON-RPC client for one participant connection.
///
/// Calls are serialized: each request holds the read half until its
/// response line arrives, so responses always pair with their requests.
pub struct ExperimentClient {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    next_id: AtomicU64,
}

impl ExperimentClient {
    /// Connect to a server at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            next_id: AtomicU64::new(1),
        })
    }

    async fn write_message(&self, request: &JsonRpcRequest) -> ProtocolResult<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> ProtocolResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::call(id, method, params);

        let mut reader = self.reader.lock().await;
        self.write_message(&request).await?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let response: JsonRpcResponse = serde_json::from_str(line.trim())?;
        if response.id != Value::from(id) {
            return Err(ProtocolError::InvalidRequest {
                message: format!("response id {} does not match request {}", response.id, id),
            });
        }

        debug!(method = %method, id, "Received response");

        match (response.result, response.error) {
            (_, Some(error)) => Err(ProtocolError::Remote {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> ProtocolResult<()> {
        self.write_message(&JsonRpcRequest::notification(method, params))
            .await
    }

    /// Register a session and receive its stimuli.
    pub async fn start_session(
        &self,
        params: &StartSessionParams,
    ) -> ProtocolResult<SessionAssignment> {
        let result = self
            .call(methods::START_SESSION, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send one annotated result. No acknowledgement is awaited.
    pub async fn send_trial(&self, record: &AnnotatedRecord) -> ProtocolResult<()> {
        self.notify(methods::TRIAL_DATA, serde_json::to_value(record)?)
            .await
    }

    /// Whether the server already stores a matching document.
    pub async fn document_exists(&self, params: &ExistsParams) -> ProtocolResult<bool> {
        let result = self
            .call(methods::DOCUMENT_EXISTS, serde_json::to_value(params)?)
            .await?;
        result.as_bool().ok_or_else(|| ProtocolError::InvalidRequest {
            message: format!("expected a boolean, got {}", result),
        })
    }

    pub async fn ping(&self) -> ProtocolResult<()> {
        self.call(methods::PING, Value::Object(Default::default()))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ResultSink for ExperimentClient {
    async fn send(&self, record: &AnnotatedRecord) -> RecorderResult<()> {
        self.send_trial(record)
            .await
            .map_err(|e| RecorderError::PersistenceUnavailable {
                message: e.to_string(),
            })
    }
}
