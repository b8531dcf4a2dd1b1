//! Message envelopes exchanged with the Librarian.
//!
//! Requests arrive as a flat JSON object carrying `type`, `request_id`,
//! `protocol_version`, an optional `auth_token`, and the type-specific fields.
//! Every request gets exactly one [`Response`]; asynchronous results travel
//! as [`Notification`]s over the callback channel.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const PROTOCOL_VERSION: u32 = 1;

// ── Error codes ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    ProtocolMismatch,
    Unauthorized,
    UnauthorizedHost,
    PayloadTooLarge,
    SanitizeRequired,
    ScanBlocked,
    PathBlocked,
    NotFound,
    BackoffActive,
    BreakerOpen,
    LocalOnly,
    TrustPolicyBlock,
    UnknownMessage,
    BlockedTopic,
    /// A handler panicked; the connection survives.
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::ProtocolMismatch => "protocol_mismatch",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::UnauthorizedHost => "unauthorized_host",
            ErrorCode::PayloadTooLarge => "payload_too_large",
            ErrorCode::SanitizeRequired => "sanitize_required",
            ErrorCode::ScanBlocked => "scan_blocked",
            ErrorCode::PathBlocked => "path_blocked",
            ErrorCode::NotFound => "not_found",
            ErrorCode::BackoffActive => "backoff_active",
            ErrorCode::BreakerOpen => "breaker_open",
            ErrorCode::LocalOnly => "local_only",
            ErrorCode::TrustPolicyBlock => "trust_policy_block",
            ErrorCode::UnknownMessage => "unknown_message",
            ErrorCode::BlockedTopic => "blocked_topic",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestChunk {
    pub chunk: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub source: String,
}

/// The typed payload of a request, keyed by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Shutdown,
    StatusRequest,
    CloudQuery {
        prompt: String,
        #[serde(default)]
        sanitized: bool,
    },
    ResearchRequest {
        topic: String,
    },
    SourcesRequest {
        topic: String,
    },
    IngestText {
        text: String,
        #[serde(default)]
        topic: String,
        #[serde(default)]
        source: String,
    },
    IngestTextChunk(IngestChunk),
    IngestRequest {
        paths: Vec<String>,
    },
    CancelRequest {
        target_request_id: String,
    },
    CardCatalogRequest,
}

pub const REQUEST_TYPES: &[&str] = &[
    "shutdown",
    "status_request",
    "cloud_query",
    "research_request",
    "sources_request",
    "ingest_text",
    "ingest_text_chunk",
    "ingest_request",
    "cancel_request",
    "card_catalog_request",
];

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Shutdown => "shutdown",
            Request::StatusRequest => "status_request",
            Request::CloudQuery { .. } => "cloud_query",
            Request::ResearchRequest { .. } => "research_request",
            Request::SourcesRequest { .. } => "sources_request",
            Request::IngestText { .. } => "ingest_text",
            Request::IngestTextChunk(_) => "ingest_text_chunk",
            Request::IngestRequest { .. } => "ingest_request",
            Request::CancelRequest { .. } => "cancel_request",
            Request::CardCatalogRequest => "card_catalog_request",
        }
    }
}

/// A request as it appears on the wire, before its payload is typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug)]
pub enum DecodeError {
    UnknownType(String),
    InvalidFields(serde_json::Error),
}

impl Envelope {
    pub fn new(request: &Request, request_id: &str, auth_token: Option<String>) -> Self {
        let mut fields = match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        fields.remove("type");
        Self {
            kind: request.kind().to_string(),
            request_id: Some(request_id.to_string()),
            protocol_version: Some(PROTOCOL_VERSION),
            auth_token,
            fields,
        }
    }

    /// Type the payload.  Unknown `type` values and malformed fields are
    /// reported separately so they map to different error codes.
    pub fn decode(&self) -> Result<Request, DecodeError> {
        if !REQUEST_TYPES.contains(&self.kind.as_str()) {
            return Err(DecodeError::UnknownType(self.kind.clone()));
        }
        let mut object = self.fields.clone();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        serde_json::from_value(Value::Object(object)).map_err(DecodeError::InvalidFields)
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    /// Echo of the request id; `None` when the request could not be decoded.
    pub request_id: Option<String>,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
}

impl Response {
    pub fn success(request_id: Option<String>, message: impl Into<String>, result: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            request_id,
            protocol_version: PROTOCOL_VERSION,
            code: None,
            message: message.into(),
            result,
        }
    }

    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            request_id,
            protocol_version: PROTOCOL_VERSION,
            code: Some(code),
            message: message.into(),
            result: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// `"success"` or the error code, for request logging.
    pub fn outcome(&self) -> &'static str {
        match self.code {
            Some(code) => code.as_str(),
            None => "success",
        }
    }
}

// ── Notifications ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    Heartbeat,
    Note,
    Sources,
    Gap,
    IngestionComplete,
    IngestionBlocked,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::Heartbeat => "heartbeat",
            NotificationEvent::Note => "note",
            NotificationEvent::Sources => "sources",
            NotificationEvent::Gap => "gap",
            NotificationEvent::IngestionComplete => "ingestion_complete",
            NotificationEvent::IngestionBlocked => "ingestion_blocked",
        }
    }
}

const NOTIFICATION_TYPE: &str = "notification";

fn notification_type() -> String {
    NOTIFICATION_TYPE.to_string()
}

/// Unsolicited message pushed to the foreground listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type", default = "notification_type")]
    pub kind: String,
    pub event: NotificationEvent,
    #[serde(default)]
    pub details: Value,
    pub request_id: String,
    pub protocol_version: u32,
    pub sent_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(event: NotificationEvent, details: Value) -> Self {
        Self {
            kind: notification_type(),
            event,
            details,
            request_id: Uuid::new_v4().to_string(),
            protocol_version: PROTOCOL_VERSION,
            sent_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn decodes_flat_request() {
        let env = envelope(json!({
            "type": "cloud_query",
            "request_id": "r1",
            "protocol_version": 1,
            "auth_token": "t",
            "prompt": "hi",
            "sanitized": true
        }));
        assert_eq!(env.request_id.as_deref(), Some("r1"));
        assert_eq!(env.auth_token.as_deref(), Some("t"));
        let request = env.decode().unwrap();
        assert_eq!(
            request,
            Request::CloudQuery {
                prompt: "hi".into(),
                sanitized: true
            }
        );
    }

    #[test]
    fn sanitized_defaults_to_false() {
        let env = envelope(json!({"type": "cloud_query", "request_id": "r", "prompt": "x"}));
        assert!(matches!(
            env.decode().unwrap(),
            Request::CloudQuery { sanitized: false, .. }
        ));
    }

    #[test]
    fn unknown_type_is_distinguished_from_bad_fields() {
        let unknown = envelope(json!({"type": "make_coffee", "request_id": "r"}));
        assert!(matches!(unknown.decode(), Err(DecodeError::UnknownType(t)) if t == "make_coffee"));

        let missing = envelope(json!({"type": "research_request", "request_id": "r"}));
        assert!(matches!(missing.decode(), Err(DecodeError::InvalidFields(_))));
    }

    #[test]
    fn chunk_request_decodes_into_struct() {
        let env = envelope(json!({
            "type": "ingest_text_chunk",
            "request_id": "r",
            "chunk": "abc",
            "chunk_index": 0,
            "total_chunks": 2
        }));
        match env.decode().unwrap() {
            Request::IngestTextChunk(chunk) => {
                assert_eq!(chunk.chunk, "abc");
                assert_eq!(chunk.total_chunks, 2);
                assert!(chunk.topic.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn envelope_new_flattens_payload() {
        let request = Request::ResearchRequest {
            topic: "tokio".into(),
        };
        let env = Envelope::new(&request, "abc", Some("secret".into()));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "research_request");
        assert_eq!(value["topic"], "tokio");
        assert_eq!(value["request_id"], "abc");
        assert_eq!(value["protocol_version"], PROTOCOL_VERSION);
        assert_eq!(value["auth_token"], "secret");

        let unit = Envelope::new(&Request::StatusRequest, "s", None);
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["type"], "status_request");
        assert!(value.get("auth_token").is_none());
        assert_eq!(unit.decode().unwrap(), Request::StatusRequest);
    }

    #[test]
    fn every_request_type_is_listed() {
        let samples = [
            Request::Shutdown,
            Request::StatusRequest,
            Request::CloudQuery {
                prompt: String::new(),
                sanitized: false,
            },
            Request::ResearchRequest { topic: String::new() },
            Request::SourcesRequest { topic: String::new() },
            Request::IngestText {
                text: String::new(),
                topic: String::new(),
                source: String::new(),
            },
            Request::IngestTextChunk(IngestChunk {
                chunk: String::new(),
                chunk_index: 0,
                total_chunks: 1,
                topic: String::new(),
                source: String::new(),
            }),
            Request::IngestRequest { paths: vec![] },
            Request::CancelRequest {
                target_request_id: String::new(),
            },
            Request::CardCatalogRequest,
        ];
        assert_eq!(samples.len(), REQUEST_TYPES.len());
        for sample in samples {
            assert!(REQUEST_TYPES.contains(&sample.kind()));
            let value = serde_json::to_value(&sample).unwrap();
            assert_eq!(value["type"], sample.kind());
        }
    }

    #[test]
    fn error_response_serializes_code_and_null_id() {
        let response = Response::error(None, ErrorCode::PayloadTooLarge, "too big");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "payload_too_large");
        assert!(value["request_id"].is_null());
        assert!(value.get("result").is_none());
        assert_eq!(response.outcome(), "payload_too_large");
    }

    #[test]
    fn error_code_display_matches_serde() {
        for code in [
            ErrorCode::UnauthorizedHost,
            ErrorCode::TrustPolicyBlock,
            ErrorCode::BlockedTopic,
            ErrorCode::InternalError,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.to_string());
        }
    }

    #[test]
    fn notification_carries_fresh_id_and_type() {
        let a = Notification::new(NotificationEvent::Gap, json!({"topic": "x"}));
        let b = Notification::new(NotificationEvent::Gap, json!({"topic": "x"}));
        assert_ne!(a.request_id, b.request_id);
        let value = serde_json::to_value(&a).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["event"], "gap");
        assert_eq!(NotificationEvent::IngestionBlocked.as_str(), "ingestion_blocked");
    }
}
