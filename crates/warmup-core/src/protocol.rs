use crate::status::{InitialStatus, ResourceId, StatusUpdate, Target};
use chrono::Utc;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

/// Peers send the version either as a JSON number or as a numeric string.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireVersion {
    Number(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let number = match WireVersion::deserialize(deserializer)? {
            WireVersion::Number(number) => number,
            WireVersion::Text(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| de::Error::custom(format!("version is not a number: {text:?}")))?,
        };
        u16::try_from(number)
            .map(ProtocolVersion)
            .map_err(|_| de::Error::custom(format!("version {number} is too large")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Warmup,
    Ping,
    QueryStatus,
}

impl CommandKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warmup" => Some(CommandKind::Warmup),
            "ping" => Some(CommandKind::Ping),
            "queryStatus" => Some(CommandKind::QueryStatus),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Warmup => "warmup",
            CommandKind::Ping => "ping",
            CommandKind::QueryStatus => "queryStatus",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client→service request. `client_id` correlates the eventual ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(rename = "model")]
    pub target: Target,
    #[serde(rename = "timestamp")]
    pub issued_at_ms: i64,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(default)]
    version: Option<ProtocolVersion>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(rename = "clientId", default)]
    client_id: Option<String>,
}

#[derive(Serialize)]
struct OutgoingCommand<'a> {
    version: ProtocolVersion,
    #[serde(flatten)]
    command: &'a Command,
}

impl Command {
    pub fn new(kind: CommandKind, target: Target) -> Self {
        Self {
            kind,
            target,
            issued_at_ms: now_ms(),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Decodes and validates one client frame. Rejections keep whatever
    /// `clientId` could be recovered so the issuer can correlate them.
    pub fn parse(raw: &str) -> Result<Self, CommandRejected> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|_| CommandRejected::new(None, "invalid_json"))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, CommandRejected> {
        let recovered_id = value
            .get("clientId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let raw: RawCommand = serde_json::from_value(value)
            .map_err(|_| CommandRejected::new(recovered_id, "invalid_payload"))?;

        let client_id = raw.client_id.unwrap_or_default();
        if client_id.trim().is_empty() {
            return Err(CommandRejected::new(None, "missing_client_id"));
        }
        if let Some(version) = raw.version {
            if version != ProtocolVersion::CURRENT {
                return Err(CommandRejected::new(Some(client_id), "unsupported_version"));
            }
        }
        let Some(kind) = raw.kind else {
            return Err(CommandRejected::new(Some(client_id), "missing_type"));
        };
        let Some(kind) = CommandKind::parse(&kind) else {
            return Err(CommandRejected::new(Some(client_id), "unknown_command"));
        };
        let Some(issued_at_ms) = raw.timestamp else {
            return Err(CommandRejected::new(Some(client_id), "missing_timestamp"));
        };
        let model = raw.model.unwrap_or_default();
        let target = if model.trim().is_empty() {
            if kind == CommandKind::Warmup {
                return Err(CommandRejected::new(Some(client_id), "missing_model"));
            }
            Target::All
        } else {
            Target::parse(&model)
        };

        Ok(Self {
            kind,
            target,
            issued_at_ms,
            client_id,
        })
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        encode_message(
            &OutgoingCommand {
                version: ProtocolVersion::CURRENT,
                command: self,
            },
            DEFAULT_MAX_FRAME_BYTES,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command rejected: {reason}")]
pub struct CommandRejected {
    pub client_id: Option<String>,
    pub reason: &'static str,
}

impl CommandRejected {
    pub fn new(client_id: Option<String>, reason: &'static str) -> Self {
        Self { client_id, reason }
    }

    pub fn into_ack(self) -> CommandAck {
        CommandAck::rejected(self.client_id.unwrap_or_default(), self.reason)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandAck {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CommandAck {
    pub fn accepted(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(client_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {
    pub timestamp: i64,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    StatusUpdate(StatusUpdate),
    InitialStatus(InitialStatus),
    CommandAck(CommandAck),
    Pong(Pong),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(flatten)]
    pub msg: ServerMessage,
}

impl ServerEnvelope {
    pub fn new(msg: ServerMessage) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            msg,
        }
    }

    pub fn status(update: StatusUpdate) -> Self {
        Self::new(ServerMessage::StatusUpdate(update))
    }

    pub fn snapshot(snapshot: InitialStatus) -> Self {
        Self::new(ServerMessage::InitialStatus(snapshot))
    }

    pub fn ack(ack: CommandAck) -> Self {
        Self::new(ServerMessage::CommandAck(ack))
    }

    pub fn pong(client_id: Option<String>) -> Self {
        Self::new(ServerMessage::Pong(Pong {
            timestamp: now_ms(),
            client_id,
        }))
    }

    /// Resource this message is about, for status updates.
    pub fn resource(&self) -> Option<&ResourceId> {
        match &self.msg {
            ServerMessage::StatusUpdate(update) => Some(&update.resource),
            _ => None,
        }
    }

    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        let envelope: Self = decode_message(raw, DEFAULT_MAX_FRAME_BYTES)?;
        if envelope.version != ProtocolVersion::CURRENT {
            return Err(FrameError::UnsupportedVersion(envelope.version.0));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        encode_message(self, DEFAULT_MAX_FRAME_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_message<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_message<T: DeserializeOwned>(raw: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let trimmed = raw.trim_end_matches(['\n', '\r']);
    if trimmed.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: trimmed.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(trimmed).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::LifecycleState;
    use std::time::Duration;

    #[test]
    fn parses_warmup_command_from_wire_shape() {
        let command = Command::parse(
            r#"{"type":"warmup","model":"stylevae","timestamp":1707335222222,"clientId":"c-1"}"#,
        )
        .expect("parse warmup");
        assert_eq!(command.kind, CommandKind::Warmup);
        assert_eq!(command.target, Target::Resource(ResourceId::from("stylevae")));
        assert_eq!(command.client_id, "c-1");
        assert_eq!(command.issued_at_ms, 1_707_335_222_222);
    }

    #[test]
    fn unknown_kind_is_rejected_with_echoed_client_id() {
        let err = Command::parse(
            r#"{"type":"reboot","model":"all","timestamp":1,"clientId":"c-9"}"#,
        )
        .expect_err("unknown kind");
        assert_eq!(err.reason, "unknown_command");
        let ack = err.into_ack();
        assert_eq!(ack.client_id, "c-9");
        assert!(!ack.accepted);
        assert_eq!(ack.reason.as_deref(), Some("unknown_command"));
    }

    #[test]
    fn shape_errors_are_reported_by_reason() {
        let cases = [
            ("not json", "invalid_json"),
            (r#"{"type":"ping","timestamp":1}"#, "missing_client_id"),
            (r#"{"model":"all","timestamp":1,"clientId":"a"}"#, "missing_type"),
            (r#"{"type":"warmup","timestamp":1,"clientId":"a"}"#, "missing_model"),
            (r#"{"type":"warmup","model":"all","clientId":"a"}"#, "missing_timestamp"),
            (
                r#"{"version":"2","type":"ping","timestamp":1,"clientId":"a"}"#,
                "unsupported_version",
            ),
            (r#"{"type":7,"timestamp":1,"clientId":"a"}"#, "invalid_payload"),
        ];
        for (raw, reason) in cases {
            let err = Command::parse(raw).expect_err(raw);
            assert_eq!(err.reason, reason, "{raw}");
        }
    }

    #[test]
    fn ping_without_model_targets_all() {
        let command =
            Command::parse(r#"{"type":"ping","timestamp":5,"clientId":"p"}"#).expect("parse");
        assert_eq!(command.target, Target::All);
    }

    #[test]
    fn encoded_command_is_accepted_by_parser() {
        let command = Command::new(CommandKind::QueryStatus, Target::All);
        let raw = command.encode().expect("encode");
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["type"], "queryStatus");
        assert_eq!(value["model"], "all");
        assert_eq!(value["version"], "1");
        assert_eq!(Command::parse(&raw).expect("parse"), command);
    }

    #[test]
    fn server_messages_carry_type_discriminant() {
        let update = ServerEnvelope::status(StatusUpdate::transition(
            ResourceId::from("stylevae"),
            LifecycleState::Loading,
            25,
            Duration::from_secs(1),
        ));
        let value: Value = serde_json::from_str(&update.encode().expect("encode")).expect("json");
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["status"], "loading");

        let ack = ServerEnvelope::ack(CommandAck::accepted("c-1"));
        let value: Value = serde_json::from_str(&ack.encode().expect("encode")).expect("json");
        assert_eq!(value["type"], "command_ack");
        assert_eq!(value["clientId"], "c-1");
        assert_eq!(value["accepted"], true);
        assert!(value.get("reason").is_none());

        let decoded = ServerEnvelope::decode(&update.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.resource(), Some(&ResourceId::from("stylevae")));
    }

    #[test]
    fn server_envelope_version_accepts_string_number_and_missing() {
        for raw in [
            r#"{"version":"1","type":"pong","timestamp":3}"#,
            r#"{"version":1,"type":"pong","timestamp":3}"#,
            r#"{"type":"pong","timestamp":3}"#,
        ] {
            let envelope = ServerEnvelope::decode(raw).expect(raw);
            assert_eq!(envelope.version, ProtocolVersion::CURRENT);
        }
        let future = ServerEnvelope::decode(r#"{"version":"9","type":"pong","timestamp":3}"#);
        assert!(matches!(future, Err(FrameError::UnsupportedVersion(9))));

        for raw in [
            r#"{"version":"one","type":"pong","timestamp":3}"#,
            r#"{"version":-1,"type":"pong","timestamp":3}"#,
            r#"{"version":70000,"type":"pong","timestamp":3}"#,
        ] {
            assert!(
                matches!(ServerEnvelope::decode(raw), Err(FrameError::Decode(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn unknown_server_discriminant_fails_decode() {
        let result = ServerEnvelope::decode(r#"{"type":"layout_state","seq":1}"#);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let huge = "x".repeat(128);
        let result = encode_message(&serde_json::json!({ "blob": huge }), 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }
}
