//! JSON-RPC 2.0 message types and the experiment method payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AssignCount;
use crate::error::{AppError, AssignmentError, ProtocolError};
use crate::session::ParticipantInfo;
use crate::storage::StimulusItem;

/// Method names understood by the server.
pub mod methods {
    pub const START_SESSION: &str = "session/start";
    pub const TRIAL_DATA: &str = "trial/data";
    pub const DOCUMENT_EXISTS: &str = "documents/exists";
    pub const PING: &str = "ping";
}

/// Standard and application error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const EMPTY_POOL: i32 = -32001;
    pub const ASSIGNMENT_FAILED: i32 = -32002;
    pub const SESSION_ALREADY_STARTED: i32 = -32003;
}

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// A request expecting a response.
    pub fn call(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params: Some(params),
        }
    }

    /// A notification (no id, no response).
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Request identifier (null when the request could not be parsed).
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Error response for a failed handler.
    ///
    /// Assignment failures carry the participant-facing message; the
    /// technical detail goes into `data`.
    pub fn from_app_error(id: Option<Value>, err: &AppError) -> Self {
        let (code, message, detail) = match err {
            AppError::Assignment(e @ AssignmentError::EmptyPool { .. }) => (
                codes::EMPTY_POOL,
                e.participant_message().to_string(),
                Some(e.to_string()),
            ),
            AppError::Assignment(e) => (
                codes::ASSIGNMENT_FAILED,
                e.participant_message().to_string(),
                Some(e.to_string()),
            ),
            AppError::Protocol(e @ ProtocolError::InvalidParameters { .. }) => {
                (codes::INVALID_PARAMS, e.to_string(), None)
            }
            AppError::Protocol(e @ ProtocolError::UnknownMethod { .. }) => {
                (codes::METHOD_NOT_FOUND, e.to_string(), None)
            }
            AppError::Protocol(e @ ProtocolError::SessionAlreadyStarted { .. }) => {
                (codes::SESSION_ALREADY_STARTED, e.to_string(), None)
            }
            AppError::Protocol(e @ ProtocolError::InvalidRequest { .. }) => {
                (codes::INVALID_REQUEST, e.to_string(), None)
            }
            other => (
                codes::INTERNAL_ERROR,
                "Internal error".to_string(),
                Some(other.to_string()),
            ),
        };

        let mut response = Self::error(id, code, message);
        if let Some(error) = response.error.as_mut() {
            error.data = detail.map(|d| serde_json::json!({ "detail": d }));
        }
        response
    }
}

/// Requested number of stimuli: a positive count or `"all"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CountParam {
    Limit(usize),
    Keyword(String),
}

impl CountParam {
    /// Resolve the requested count, rejecting explicit counts above `max`.
    pub fn to_assign_count(&self, max: usize) -> Result<AssignCount, String> {
        let count = match self {
            CountParam::Limit(0) => return Err("count must be positive or 'all'".to_string()),
            CountParam::Limit(n) => AssignCount::Limit(*n),
            CountParam::Keyword(word) => word.parse()?,
        };
        match count {
            AssignCount::Limit(n) if n > max => {
                Err(format!("count {} exceeds the per-session maximum of {}", n, max))
            }
            count => Ok(count),
        }
    }
}

impl From<AssignCount> for CountParam {
    fn from(count: AssignCount) -> Self {
        match count {
            AssignCount::Limit(n) => CountParam::Limit(n),
            AssignCount::All => CountParam::Keyword("all".to_string()),
        }
    }
}

/// Parameters of `session/start`. Absent fields fall back to server config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub familiarization_pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountParam>,
    #[serde(default)]
    pub participant: ParticipantInfo,
}

/// Result of `session/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAssignment {
    pub session_id: String,
    pub stimuli: Vec<StimulusItem>,
    pub familiarization_stimuli: Vec<StimulusItem>,
    pub stim_version: String,
}

/// Parameters of `documents/exists`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsParams {
    pub database: String,
    pub collection: String,
    pub field: String,
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_omits_id() {
        let value =
            serde_json::to_value(JsonRpcRequest::notification("trial/data", json!({}))).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["jsonrpc"], "2.0");
    }

    #[test]
    fn test_count_param_parsing() {
        let limit: CountParam = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(limit.to_assign_count(10), Ok(AssignCount::Limit(3)));

        let all: CountParam = serde_json::from_value(json!("ALL")).unwrap();
        assert_eq!(all.to_assign_count(10), Ok(AssignCount::All));

        assert!(CountParam::Limit(0).to_assign_count(10).is_err());
        assert!(CountParam::Keyword("many".to_string()).to_assign_count(10).is_err());
    }

    #[test]
    fn test_count_param_above_max_is_rejected() {
        assert_eq!(CountParam::Limit(10).to_assign_count(10), Ok(AssignCount::Limit(10)));

        let err = CountParam::Limit(usize::MAX).to_assign_count(10).unwrap_err();
        assert!(err.contains("exceeds"));
        assert!(CountParam::Keyword("11".to_string()).to_assign_count(10).is_err());

        // The whole pool is bounded by its own size.
        assert_eq!(
            CountParam::Keyword("all".to_string()).to_assign_count(1),
            Ok(AssignCount::All)
        );
    }

    #[test]
    fn test_start_params_defaults() {
        let params: StartSessionParams = serde_json::from_value(json!({})).unwrap();
        assert!(params.pool_id.is_none());
        assert!(params.count.is_none());
        assert_eq!(params.participant, ParticipantInfo::default());
    }

    #[test]
    fn test_empty_pool_error_is_participant_facing() {
        let err = AppError::from(AssignmentError::EmptyPool {
            pool_id: "dominoes".to_string(),
        });
        let response = JsonRpcResponse::from_app_error(Some(json!(1)), &err);
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::EMPTY_POOL);
        assert!(error.message.contains("no stimuli"));
        assert_eq!(error.data.unwrap()["detail"], "Stimulus pool is empty: dominoes");
    }

    #[test]
    fn test_storage_error_hides_detail_in_data() {
        let err = AppError::from(crate::error::StorageError::Query {
            message: "disk I/O".to_string(),
        });
        let response = JsonRpcResponse::from_app_error(None, &err);
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert_eq!(error.message, "Internal error");
        assert_eq!(response.id, Value::Null);
    }
}
