//! Control-channel wire protocol.
//!
//! Messages are tagged unions encoded with BARE (`serde_bare`), the same
//! pairing the runner-protocol crates in this lineage use for versioned
//! binary runner wire formats. `encode_to_server`/`decode_to_client` mirror
//! that crate's helper shape; framing itself (length-prefixing, if any) is
//! left to the WebSocket message boundary, same as the teacher's one-frame-
//! per-`Message::Binary` convention.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// Negotiated wire protocol version (spec §6.5).
pub const PROTOCOL_VERSION: u16 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfigWire {
    pub name: String,
    pub key: Option<String>,
    pub create_ts: i64,
    pub input: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorCheckpoint {
    pub actor_id: String,
    pub generation: u32,
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HibernatingRequestRef {
    pub gateway_id: Vec<u8>,
    pub request_id: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    StartActor {
        config: ActorConfigWire,
        hibernating_requests: Vec<HibernatingRequestRef>,
    },
    StopActor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandWrapper {
    pub checkpoint: ActorCheckpoint,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ActorIntentKind {
    Sleep,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActorRunState {
    Running,
    Stopped {
        code: StopCode,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCode {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    ActorIntent {
        intent: ActorIntentKind,
    },
    ActorStateUpdate {
        state: ActorRunState,
    },
    ActorSetAlarm {
        alarm_ts: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWrapper {
    pub checkpoint: ActorCheckpoint,
    pub event: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCheckpoint {
    pub actor_id: String,
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMetadata {
    pub runner_lost_threshold: u64,
}

/// Composite wire id: (gateway, request, wrapping message index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessageId {
    pub gateway_id: Vec<u8>,
    pub request_id: Vec<u8>,
    pub index: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TunnelMessageFromServer {
    RequestStart {
        actor_id: String,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        stream: bool,
    },
    RequestChunk {
        body: Vec<u8>,
        finish: bool,
    },
    RequestAbort,
    WebSocketOpen {
        actor_id: String,
        path: String,
        headers: Vec<(String, String)>,
    },
    WebSocketMessage {
        data: Vec<u8>,
        binary: bool,
        index: u16,
    },
    WebSocketClose {
        code: Option<u16>,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TunnelMessageFromClient {
    ResponseStart {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        stream: bool,
    },
    ResponseChunk {
        body: Vec<u8>,
        finish: bool,
    },
    ResponseAbort,
    WebSocketOpen {
        can_hibernate: bool,
    },
    WebSocketMessage {
        data: Vec<u8>,
        binary: bool,
    },
    WebSocketMessageAck {
        index: u16,
    },
    WebSocketClose {
        code: Option<u16>,
        reason: Option<String>,
        hibernate: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerInit {
    pub name: String,
    pub version: u16,
    pub total_slots: u32,
    pub prepopulate_actor_names: Vec<String>,
    pub metadata: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerEvents {
    pub actor_id: String,
    pub events: Vec<EventWrapper>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerAckCommands {
    pub last_command_indices: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerKvRequest {
    pub request_id: u32,
    pub actor_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToServerTunnelMessage {
    pub message_id: WireMessageId,
    pub kind: TunnelMessageFromClient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToServer {
    Init(ToServerInit),
    Events(ToServerEvents),
    AckCommands(ToServerAckCommands),
    Stopping,
    Pong { ts: u64 },
    KvRequest(ToServerKvRequest),
    TunnelMessage(ToServerTunnelMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientInit {
    pub runner_id: String,
    pub metadata: ProtocolMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientAckEvents {
    pub last_event_checkpoints: Vec<EventCheckpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientKvResponse {
    pub request_id: u32,
    pub result: std::result::Result<Vec<u8>, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToClientTunnelMessage {
    pub message_id: WireMessageId,
    pub kind: TunnelMessageFromServer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToClient {
    Init(ToClientInit),
    Commands(Vec<CommandWrapper>),
    AckEvents(ToClientAckEvents),
    KvResponse(ToClientKvResponse),
    TunnelMessage(ToClientTunnelMessage),
    Ping { ts: u64 },
}

/// Encode a client->server message for the wire.
pub fn encode_to_server(msg: &ToServer) -> Result<Vec<u8>> {
    serde_bare::to_vec(msg).map_err(|e| RunnerError::Encode(e.into()))
}

/// Decode a server->client message from the wire.
pub fn decode_to_client(data: &[u8]) -> Result<ToClient> {
    serde_bare::from_slice(data).map_err(|e| RunnerError::Decode(e.into()))
}

/// Decode a client->server message (used by tests / fake-host harnesses that
/// play the engine side).
pub fn decode_to_server(data: &[u8]) -> Result<ToServer> {
    serde_bare::from_slice(data).map_err(|e| RunnerError::Decode(e.into()))
}

/// Encode a server->client message (used by tests / fake-host harnesses).
pub fn encode_to_client(msg: &ToClient) -> Result<Vec<u8>> {
    serde_bare::to_vec(msg).map_err(|e| RunnerError::Encode(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_init() {
        let msg = ToServer::Init(ToServerInit {
            name: "runner-1".into(),
            version: PROTOCOL_VERSION,
            total_slots: 10,
            prepopulate_actor_names: vec!["echo".into()],
            metadata: None,
        });
        let bytes = encode_to_server(&msg).unwrap();
        let decoded = decode_to_server(&bytes).unwrap();
        match decoded {
            ToServer::Init(init) => {
                assert_eq!(init.name, "runner-1");
                assert_eq!(init.total_slots, 10);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_tunnel_message_with_composite_id() {
        let msg = ToClient::TunnelMessage(ToClientTunnelMessage {
            message_id: WireMessageId {
                gateway_id: vec![1, 2],
                request_id: vec![3, 4],
                index: 7,
            },
            kind: TunnelMessageFromServer::WebSocketMessage {
                data: vec![9, 9, 9],
                binary: true,
                index: 7,
            },
        });
        let bytes = encode_to_client(&msg).unwrap();
        let decoded = decode_to_client(&bytes).unwrap();
        match decoded {
            ToClient::TunnelMessage(t) => {
                assert_eq!(t.message_id.index, 7);
                match t.kind {
                    TunnelMessageFromServer::WebSocketMessage { binary, .. } => assert!(binary),
                    _ => panic!("wrong kind"),
                }
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_garbage_is_an_error() {
        let err = decode_to_client(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, RunnerError::Decode(_)));
    }

    #[test]
    fn kv_response_preserves_error_variant() {
        let msg = ToClient::KvResponse(ToClientKvResponse {
            request_id: 42,
            result: Err("not found".into()),
        });
        let bytes = encode_to_client(&msg).unwrap();
        let decoded = decode_to_client(&bytes).unwrap();
        match decoded {
            ToClient::KvResponse(r) => assert_eq!(r.result, Err("not found".to_string())),
            _ => panic!("wrong variant"),
        }
    }
}
