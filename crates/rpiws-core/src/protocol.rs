//! JSON messages exchanged between agents, the broker and viewers.
//!
//! Every message except the agent's opening registration request carries a
//! `cmd` discriminator. Each direction has its own enum so a session can
//! only decode what its peer is allowed to send.

use crate::binding::{BindingMap, ChannelPort};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Flat `key -> value` map carried by DATA frames.
pub type ValueMap = IndexMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigPayload {
    #[serde(default)]
    pub read: BindingMap,
    #[serde(default)]
    pub write: BindingMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerToAgent {
    Auth {
        payload: TokenPayload,
    },
    Ack,
    Config {
        payload: ConfigPayload,
    },
    AckData {
        ack_count: i32,
    },
    ResumeStreaming,
    PauseStreaming,
    WriteData {
        inter_face_port: String,
        value: Value,
    },
    DropToConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentToBroker {
    Auth {
        payload: TokenPayload,
    },
    ConfigOk,
    ConfigFail,
    Data {
        #[serde(default)]
        read: ValueMap,
        #[serde(default)]
        write: ValueMap,
    },
    DropToConfigOk,
}

/// Transformed value of a write channel: what the equation computed and
/// the raw value the channel actually holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteSample {
    pub calculated: Value,
    pub real: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentPresence {
    Online,
    Offline,
    Config,
    Stream,
}

impl AgentPresence {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentPresence::Online => "online",
            AgentPresence::Offline => "offline",
            AgentPresence::Config => "config",
            AgentPresence::Stream => "stream",
        }
    }
}

impl fmt::Display for AgentPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerToViewer {
    Data {
        read: ValueMap,
        write: IndexMap<String, WriteSample>,
    },
    RpiStateChange {
        rpi_mac: String,
        rpi_state: AgentPresence,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewerToBroker {
    ConnectRpi {
        rpi_mac: String,
    },
    AckData {
        ack_count: i32,
    },
    WriteData {
        inter_face_port: String,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IoType {
    #[serde(rename = "B")]
    Binary,
    #[serde(rename = "I")]
    Integer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortChoice {
    pub s: ChannelPort,
    pub d: String,
}

/// One channel class an agent can instantiate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceDescription {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub choices: Vec<PortChoice>,
    pub io_type: IoType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    #[serde(default)]
    pub read: Vec<InterfaceDescription>,
    #[serde(default)]
    pub write: Vec<InterfaceDescription>,
}

/// First message on an agent connection. Has no `cmd`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub mac: String,
    #[serde(default)]
    pub inter_face: InterfaceDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("message encode failed: {0}")]
    Encode(String),
    #[error("message decode failed: {0}")]
    Decode(String),
    #[error("unexpected {cmd} while {state}")]
    Unexpected { cmd: String, state: &'static str },
}

pub fn encode_message<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn decode_message<T: DeserializeOwned>(raw: &str, max: usize) -> Result<T, ProtocolError> {
    if raw.len() > max {
        return Err(ProtocolError::Oversized {
            size: raw.len(),
            max,
        });
    }
    serde_json::from_str(raw).map_err(|err| ProtocolError::Decode(err.to_string()))
}

/// Returns the `cmd` of a JSON object, `None` when the object has none.
/// Non-objects and invalid JSON are decode errors.
pub fn peek_cmd(raw: &str, max: usize) -> Result<Option<String>, ProtocolError> {
    let value: Value = decode_message(raw, max)?;
    match value {
        Value::Object(map) => Ok(map.get("cmd").map(|cmd| match cmd {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        _ => Err(ProtocolError::Decode("expected a JSON object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{merge_bindings, BindingRequest};
    use serde_json::json;

    #[test]
    fn commands_use_screaming_snake_case_tags() {
        let cases = vec![
            (encode_message(&BrokerToAgent::Ack).unwrap(), json!({"cmd": "ACK"})),
            (
                encode_message(&BrokerToAgent::AckData { ack_count: 5 }).unwrap(),
                json!({"cmd": "ACK_DATA", "ack_count": 5}),
            ),
            (
                encode_message(&BrokerToAgent::DropToConfig).unwrap(),
                json!({"cmd": "DROP_TO_CONFIG"}),
            ),
            (
                encode_message(&BrokerToViewer::RpiStateChange {
                    rpi_mac: "AA:BB:CC:DD:EE:FF".to_string(),
                    rpi_state: AgentPresence::Online,
                })
                .unwrap(),
                json!({"cmd": "RPI_STATE_CHANGE", "rpi_mac": "AA:BB:CC:DD:EE:FF", "rpi_state": "online"}),
            ),
        ];
        for (encoded, expected) in cases {
            let value: Value = serde_json::from_str(&encoded).unwrap();
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn config_payload_nests_binding_maps() {
        let read = merge_bindings(&[BindingRequest::new("Temp", "dev1", "x*2")]);
        let msg = BrokerToAgent::Config {
            payload: ConfigPayload {
                read,
                write: BindingMap::new(),
            },
        };
        let value: Value = serde_json::from_str(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(value["cmd"], "CONFIG");
        assert_eq!(
            value["payload"]["read"]["cls:Temp, port:dev1"]["equations"],
            json!(["x*2"])
        );
        assert_eq!(value["payload"]["write"], json!({}));
    }

    #[test]
    fn decodes_agent_frames() {
        let data: AgentToBroker = decode_message(
            r#"{"cmd":"DATA","read":{"cls:GPIOInput, port:4":1},"write":{}}"#,
            DEFAULT_MAX_MESSAGE_BYTES,
        )
        .unwrap();
        match data {
            AgentToBroker::Data { read, write } => {
                assert_eq!(read["cls:GPIOInput, port:4"], json!(1));
                assert!(write.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let ok: AgentToBroker =
            decode_message(r#"{"cmd":"CONFIG_OK"}"#, DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        assert_eq!(ok, AgentToBroker::ConfigOk);
    }

    #[test]
    fn registration_request_carries_interface_descriptor() {
        let raw = r#"{
            "mac": "AA:BB:CC:DD:EE:FF",
            "inter_face": {
                "read": [{"name": "GPIOInput", "desc": "GPIO read", "choices": [{"s": 4, "d": "GPIO4 P7"}], "io_type": "B"}],
                "write": []
            }
        }"#;
        let request: RegisterRequest = decode_message(raw, DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        assert_eq!(request.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(request.inter_face.read[0].io_type, IoType::Binary);
        assert_eq!(request.inter_face.read[0].choices[0].s.as_str(), "4");
        assert_eq!(peek_cmd(raw, DEFAULT_MAX_MESSAGE_BYTES).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_and_malformed_messages() {
        let big = format!("{{\"cmd\":\"ACK\",\"pad\":\"{}\"}}", "x".repeat(64));
        assert!(matches!(
            decode_message::<Value>(&big, 16),
            Err(ProtocolError::Oversized { max: 16, .. })
        ));
        assert!(matches!(
            decode_message::<ViewerToBroker>("{not json", DEFAULT_MAX_MESSAGE_BYTES),
            Err(ProtocolError::Decode(_))
        ));
        assert!(matches!(
            decode_message::<ViewerToBroker>(r#"{"cmd":"SELF_DESTRUCT"}"#, DEFAULT_MAX_MESSAGE_BYTES),
            Err(ProtocolError::Decode(_))
        ));
        assert!(peek_cmd("[1,2]", DEFAULT_MAX_MESSAGE_BYTES).is_err());
        assert_eq!(
            peek_cmd(r#"{"cmd":"AUTH"}"#, DEFAULT_MAX_MESSAGE_BYTES).unwrap(),
            Some("AUTH".to_string())
        );
    }
}
