// tangram-protocol: channel wire protocol and history control-plane types.
//
// The client <-> channel-multiplexer protocol is a Phoenix-style envelope:
// a five-element JSON array `[join_ref, ref, topic, event, payload]`. This
// crate models that envelope plus the closed set of control events the
// multiplexer understands, and separately the control-channel messages used
// by the history admin CLI to talk to a running history engine over the bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The reserved topic heartbeats are sent on.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Control events recognised by the channel multiplexer, independent of
/// application event names.
pub mod control_event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// The five-tuple wire frame.
///
/// `join_ref` and `ref` are caller-assigned correlation tokens and may be
/// absent (`null`). Serializes to/from a bare JSON array, not an object —
/// matching the Phoenix channel wire format clients already speak.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    pub fn reply(&self, status: ReplyStatus, response: Value) -> Envelope {
        Envelope {
            join_ref: self.join_ref.clone(),
            msg_ref: self.msg_ref.clone(),
            topic: self.topic.clone(),
            event: control_event::REPLY.to_owned(),
            payload: serde_json::json!({ "status": status.as_str(), "response": response }),
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self.event.as_str(),
            control_event::JOIN | control_event::LEAVE | control_event::REPLY
        ) || self.topic == HEARTBEAT_TOPIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
}

impl ReplyStatus {
    fn as_str(self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(5)?;
        tup.serialize_element(&self.join_ref)?;
        tup.serialize_element(&self.msg_ref)?;
        tup.serialize_element(&self.topic)?;
        tup.serialize_element(&self.event)?;
        tup.serialize_element(&self.payload)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (join_ref, msg_ref, topic, event, payload): (
            Option<String>,
            Option<String>,
            String,
            String,
            Value,
        ) = Deserialize::deserialize(deserializer)?;
        Ok(Envelope {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

/// Frozen error codes returned in `phx_reply{status:"error", response:{reason}}`
/// payloads and in admission-level rejections.
pub mod error_codes {
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ---------------------------------------------------------------------------
// Live-state pipeline payload shapes
// ---------------------------------------------------------------------------

/// A raw decoded surveillance record as read off the bus's raw feed.
///
/// Only `identifier` and `timestamp` are required; everything else is
/// optional per-message. Unknown fields are ignored by `serde`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawRecord {
    pub icao24: String,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typecode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callsign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<f64>,
}

/// Payload published on the `coordinate` topic/bus-key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateUpdate {
    pub icao24: String,
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
}

/// Payload published on the `altitude` topic/bus-key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AltitudeUpdate {
    pub icao24: String,
    pub timestamp: f64,
    pub altitude: f64,
}

// ---------------------------------------------------------------------------
// History control protocol
// ---------------------------------------------------------------------------

/// Commands sent on `history:control`. Every command carries `sender_id` so
/// the response can be routed to `history:control:response:<sender_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlCommand {
    ListTables {
        sender_id: String,
    },
    DeleteRows {
        sender_id: String,
        table: String,
        predicate: String,
        dry_run: bool,
    },
}

impl ControlCommand {
    pub fn sender_id(&self) -> &str {
        match self {
            ControlCommand::ListTables { sender_id } => sender_id,
            ControlCommand::DeleteRows { sender_id, .. } => sender_id,
        }
    }
}

/// Responses to `ControlCommand`, published to the sender's response channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    TableList { tables: Vec<TableSummary> },
    DeleteOutput { affected_rows: u64, preview_json: Value },
    CommandFailed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub uri: String,
    pub version: i64,
    pub schema_json: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_as_five_element_array() {
        let env = Envelope {
            join_ref: Some("1".to_owned()),
            msg_ref: Some("1".to_owned()),
            topic: "channel:streaming".to_owned(),
            event: "phx_join".to_owned(),
            payload: serde_json::json!({}),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"["1","1","channel:streaming","phx_join",{}]"#);
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn envelope_allows_null_refs() {
        let json = r#"[null,null,"channel:streaming","new-data",{"hello":1}]"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.join_ref, None);
        assert_eq!(env.msg_ref, None);
        assert_eq!(env.event, "new-data");
    }

    #[test]
    fn reply_carries_caller_refs_and_status() {
        let join = Envelope {
            join_ref: Some("1".to_owned()),
            msg_ref: Some("5".to_owned()),
            topic: "phoenix".to_owned(),
            event: control_event::HEARTBEAT.to_owned(),
            payload: Value::Null,
        };
        let reply = join.reply(ReplyStatus::Ok, serde_json::json!({}));
        assert_eq!(reply.event, control_event::REPLY);
        assert_eq!(reply.join_ref, Some("1".to_owned()));
        assert_eq!(reply.msg_ref, Some("5".to_owned()));
        assert_eq!(reply.payload["status"], "ok");
    }

    #[test]
    fn control_command_tags_by_type() {
        let cmd = ControlCommand::DeleteRows {
            sender_id: "cli-1".to_owned(),
            table: "jet1090".to_owned(),
            predicate: "icao24 = 'a0b1c2'".to_owned(),
            dry_run: true,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "DeleteRows");
        assert_eq!(cmd.sender_id(), "cli-1");
    }
}
