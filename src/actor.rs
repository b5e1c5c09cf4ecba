//! Per-actor runtime state.
//!
//! Generalizes the "one struct holds all per-entity shared mutable state"
//! shape the teacher uses for `state::ServerContext` (one instance per
//! upstream connection) down to one instance per hosted actor.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use crate::id::{MessageId, RequestKey};
use crate::protocol::{ActorConfigWire, EventWrapper, HibernatingRequestRef};
use crate::ws_adapter::WebSocketAdapter;

/// User-facing actor configuration, decoded from the wire representation.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub name: String,
    pub key: Option<String>,
    pub create_ts: i64,
    pub input: Option<Vec<u8>>,
}

impl From<ActorConfigWire> for ActorConfig {
    fn from(w: ActorConfigWire) -> Self {
        Self {
            name: w.name,
            key: w.key,
            create_ts: w.create_ts,
            input: w.input,
        }
    }
}

/// Event sent on an in-flight HTTP request body stream.
#[derive(Debug)]
pub enum BodyEvent {
    Chunk(Vec<u8>),
    Abort,
}

/// What a pending (gateway, request) slot is waiting on.
pub enum PendingBody {
    /// Non-streaming request; no further chunks expected.
    None,
    /// Streaming request body; chunks/abort are forwarded here.
    Streaming(mpsc::UnboundedSender<BodyEvent>),
}

pub struct PendingRequest {
    pub client_message_index: u16,
    pub body: PendingBody,
}

pub struct PendingTunnelMessage {
    pub sent_at: Instant,
    pub key: RequestKey,
}

/// Whether the actor's `on_actor_start` handler has resolved.
#[derive(Debug, Clone)]
pub enum ActorStartState {
    Pending,
    Ready,
    Failed(String),
}

struct Locked {
    pending_requests: HashMap<RequestKey, PendingRequest>,
    web_sockets: HashMap<RequestKey, std::sync::Arc<WebSocketAdapter>>,
    pending_tunnel_messages: HashMap<MessageId, PendingTunnelMessage>,
    event_history: Vec<EventWrapper>,
    next_event_idx: u64,
    last_command_idx: i64,
    hibernation_restored: bool,
}

/// A hosted actor and all tunnel/event state scoped to it.
pub struct RunnerActor {
    pub actor_id: String,
    pub generation: u32,
    pub config: ActorConfig,
    pub hibernating_requests: Vec<HibernatingRequestRef>,
    state: Mutex<Locked>,
    start_tx: watch::Sender<ActorStartState>,
    start_rx: watch::Receiver<ActorStartState>,
}

impl RunnerActor {
    pub fn new(
        actor_id: String,
        generation: u32,
        config: ActorConfig,
        hibernating_requests: Vec<HibernatingRequestRef>,
    ) -> Self {
        let (start_tx, start_rx) = watch::channel(ActorStartState::Pending);
        Self {
            actor_id,
            generation,
            config,
            hibernating_requests,
            state: Mutex::new(Locked {
                pending_requests: HashMap::new(),
                web_sockets: HashMap::new(),
                pending_tunnel_messages: HashMap::new(),
                event_history: Vec::new(),
                next_event_idx: 0,
                last_command_idx: -1,
                hibernation_restored: false,
            }),
            start_tx,
            start_rx,
        }
    }

    pub fn resolve_start(&self) {
        let _ = self.start_tx.send(ActorStartState::Ready);
    }

    pub fn reject_start(&self, err: String) {
        let _ = self.start_tx.send(ActorStartState::Failed(err));
    }

    /// Await until `on_actor_start` has resolved (success or failure).
    pub async fn wait_for_start(&self) -> ActorStartState {
        let mut rx = self.start_rx.clone();
        loop {
            match &*rx.borrow() {
                ActorStartState::Pending => {}
                other => return other.clone(),
            }
            if rx.changed().await.is_err() {
                return ActorStartState::Failed("actor start signal dropped".into());
            }
        }
    }

    pub fn insert_pending_request(&self, key: RequestKey, req: PendingRequest) {
        self.state.lock().unwrap().pending_requests.insert(key, req);
    }

    pub fn take_pending_request(&self, key: &RequestKey) -> Option<PendingRequest> {
        self.state.lock().unwrap().pending_requests.remove(key)
    }

    pub fn next_client_message_index(&self, key: &RequestKey) -> u16 {
        let mut state = self.state.lock().unwrap();
        if let Some(req) = state.pending_requests.get_mut(key) {
            let idx = req.client_message_index;
            req.client_message_index = idx.wrapping_add(1);
            idx
        } else {
            0
        }
    }

    pub fn insert_websocket(&self, key: RequestKey, adapter: std::sync::Arc<WebSocketAdapter>) {
        self.state.lock().unwrap().web_sockets.insert(key, adapter);
    }

    pub fn get_websocket(&self, key: &RequestKey) -> Option<std::sync::Arc<WebSocketAdapter>> {
        self.state.lock().unwrap().web_sockets.get(key).cloned()
    }

    pub fn remove_websocket(&self, key: &RequestKey) -> Option<std::sync::Arc<WebSocketAdapter>> {
        self.state.lock().unwrap().web_sockets.remove(key)
    }

    pub fn all_websockets(&self) -> Vec<(RequestKey, std::sync::Arc<WebSocketAdapter>)> {
        self.state
            .lock()
            .unwrap()
            .web_sockets
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn all_pending_request_keys(&self) -> Vec<RequestKey> {
        self.state
            .lock()
            .unwrap()
            .pending_requests
            .keys()
            .cloned()
            .collect()
    }

    pub fn record_pending_message(&self, id: MessageId, key: RequestKey) {
        self.state
            .lock()
            .unwrap()
            .pending_tunnel_messages
            .insert(
                id,
                PendingTunnelMessage {
                    sent_at: Instant::now(),
                    key,
                },
            );
    }

    pub fn clear_pending_message(&self, id: &MessageId) {
        self.state.lock().unwrap().pending_tunnel_messages.remove(id);
    }

    /// Remove and return tunnel messages older than `max_age`.
    pub fn sweep_stale_messages(
        &self,
        max_age: std::time::Duration,
    ) -> Vec<(MessageId, RequestKey)> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let stale: Vec<MessageId> = state
            .pending_tunnel_messages
            .iter()
            .filter(|(_, v)| now.duration_since(v.sent_at) > max_age)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(v) = state.pending_tunnel_messages.remove(&id) {
                out.push((id, v.key));
            }
        }
        out
    }

    pub fn push_event(&self, event: EventWrapper) {
        let mut state = self.state.lock().unwrap();
        state.next_event_idx += 1;
        state.event_history.push(event);
    }

    pub fn next_event_index(&self) -> u64 {
        self.state.lock().unwrap().next_event_idx
    }

    pub fn event_history(&self) -> Vec<EventWrapper> {
        self.state.lock().unwrap().event_history.clone()
    }

    pub fn event_backlog_len(&self) -> usize {
        self.state.lock().unwrap().event_history.len()
    }

    pub fn ack_events_up_to(&self, index: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .event_history
            .retain(|e| e.checkpoint.index > index);
    }

    pub fn last_command_idx(&self) -> i64 {
        self.state.lock().unwrap().last_command_idx
    }

    pub fn set_last_command_idx(&self, idx: i64) {
        self.state.lock().unwrap().last_command_idx = idx;
    }

    pub fn mark_hibernation_restored(&self) -> Result<(), ()> {
        let mut state = self.state.lock().unwrap();
        if state.hibernation_restored {
            return Err(());
        }
        state.hibernation_restored = true;
        Ok(())
    }

    pub fn pending_request_count(&self) -> usize {
        self.state.lock().unwrap().pending_requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{GatewayId, RequestId};

    fn key() -> RequestKey {
        RequestKey::new(GatewayId::new(vec![1]), RequestId::new(vec![2]))
    }

    fn actor() -> RunnerActor {
        RunnerActor::new(
            "a1".into(),
            1,
            ActorConfig {
                name: "echo".into(),
                key: None,
                create_ts: 0,
                input: None,
            },
            Vec::new(),
        )
    }

    #[test]
    fn message_index_increments_from_pending_request() {
        let a = actor();
        let k = key();
        a.insert_pending_request(
            k.clone(),
            PendingRequest {
                client_message_index: 0,
                body: PendingBody::None,
            },
        );
        assert_eq!(a.next_client_message_index(&k), 0);
        assert_eq!(a.next_client_message_index(&k), 1);
        assert_eq!(a.next_client_message_index(&k), 2);
    }

    #[test]
    fn message_index_without_pending_request_warns_and_uses_zero() {
        let a = actor();
        let k = key();
        assert_eq!(a.next_client_message_index(&k), 0);
        assert_eq!(a.next_client_message_index(&k), 0);
    }

    #[tokio::test]
    async fn start_signal_resolves_waiters() {
        let a = std::sync::Arc::new(actor());
        let a2 = a.clone();
        let handle = tokio::spawn(async move { a2.wait_for_start().await });
        a.resolve_start();
        let result = handle.await.unwrap();
        assert!(matches!(result, ActorStartState::Ready));
    }

    #[test]
    fn ack_prunes_event_history() {
        use crate::protocol::{ActorCheckpoint, Event};
        let a = actor();
        for i in 0..3u64 {
            a.push_event(EventWrapper {
                checkpoint: ActorCheckpoint {
                    actor_id: "a1".into(),
                    generation: 1,
                    index: i,
                },
                event: Event::ActorSetAlarm { alarm_ts: None },
            });
        }
        assert_eq!(a.event_history().len(), 3);
        a.ack_events_up_to(1);
        let remaining = a.event_history();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].checkpoint.index, 2);
    }

    #[test]
    fn hibernation_restore_flag_is_single_use() {
        let a = actor();
        assert!(a.mark_hibernation_restored().is_ok());
        assert!(a.mark_hibernation_restored().is_err());
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let a = actor();
        let id1 = MessageId::new(key(), 0);
        a.record_pending_message(id1.clone(), key());
        let stale = a.sweep_stale_messages(std::time::Duration::from_secs(0));
        assert_eq!(stale.len(), 1);
        assert_eq!(a.sweep_stale_messages(std::time::Duration::from_secs(0)).len(), 0);
    }
}
