//! Opaque binary identifiers used to address gateways, requests, and the
//! composite message ids that tunnel acks are keyed by.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed-width opaque byte identifier assigned by the engine.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayId(pub Vec<u8>);

/// Fixed-width opaque byte identifier assigned by the engine, scoped to a
/// single gateway.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Vec<u8>);

impl GatewayId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl RequestId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Debug for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GatewayId({})", hex_encode(&self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", hex_encode(&self.0))
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The routing key used throughout the tunnel: an active HTTP request or
/// WebSocket is identified by (gateway, request) for the lifetime of that
/// transfer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RequestKey {
    pub gateway_id: GatewayId,
    pub request_id: RequestId,
}

impl RequestKey {
    pub fn new(gateway_id: GatewayId, request_id: RequestId) -> Self {
        Self {
            gateway_id,
            request_id,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gateway_id, self.request_id)
    }
}

/// Composite id used to key outbound tunnel messages awaiting ack:
/// (gateway, request, wrapping message index).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MessageId {
    pub key: RequestKey,
    pub index: u16,
}

impl MessageId {
    pub fn new(key: RequestKey, index: u16) -> Self {
        Self { key, index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(g: u8, r: u8) -> RequestKey {
        RequestKey::new(GatewayId::new(vec![g]), RequestId::new(vec![r]))
    }

    #[test]
    fn equal_byte_content_is_equal_key() {
        assert_eq!(key(1, 2), key(1, 2));
        assert_ne!(key(1, 2), key(1, 3));
    }

    #[test]
    fn message_id_distinguishes_by_index() {
        let a = MessageId::new(key(1, 2), 0);
        let b = MessageId::new(key(1, 2), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn display_is_hex() {
        let g = GatewayId::new(vec![0xab, 0xcd]);
        assert_eq!(g.to_string(), "abcd");
    }

    #[test]
    fn usable_as_hashmap_key() {
        use std::collections::HashMap;
        let mut map: HashMap<RequestKey, u32> = HashMap::new();
        map.insert(key(1, 1), 42);
        assert_eq!(map.get(&key(1, 1)), Some(&42));
        assert_eq!(map.get(&key(1, 2)), None);
    }
}
