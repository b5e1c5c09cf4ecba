//! KV request/response forwarding.
//!
//! Requests are opaque byte payloads correlated by a runner-assigned id,
//! mirroring `registration::client::AetherClient::send_with_retry`'s
//! correlate-and-retry discipline, but over the control channel's
//! request/response messages rather than direct HTTP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// How long a buffered (unsent or unanswered) KV request lives before being
/// rejected with a timeout (spec §6.5: `KV_EXPIRE = 30s`).
pub const KV_EXPIRE: Duration = Duration::from_secs(30);

struct Pending {
    actor_id: String,
    payload: Vec<u8>,
    sent: bool,
    ts: Instant,
    resolver: Option<oneshot::Sender<Result<Vec<u8>, String>>>,
}

/// Correlates outbound KV requests with their eventual response, and
/// resends anything still unsent across a reconnect.
#[derive(Default)]
pub struct KvGateway {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Pending>>,
}

impl KvGateway {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new request. Returns its id and a receiver for the
    /// eventual result; the caller is responsible for actually sending the
    /// wire frame and calling `mark_sent`.
    pub fn register(
        &self,
        actor_id: String,
        payload: Vec<u8>,
    ) -> (u32, oneshot::Receiver<Result<Vec<u8>, String>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id,
            Pending {
                actor_id,
                payload,
                sent: false,
                ts: Instant::now(),
                resolver: Some(tx),
            },
        );
        (id, rx)
    }

    pub fn mark_sent(&self, id: u32) {
        if let Some(p) = self.pending.lock().unwrap().get_mut(&id) {
            p.sent = true;
        }
    }

    /// Mark every pending request unsent again, so they are retried on the
    /// next reconnect instead of waiting forever for a response that will
    /// never arrive on the dead connection.
    pub fn reset_unsent(&self) {
        for p in self.pending.lock().unwrap().values_mut() {
            p.sent = false;
        }
    }

    /// Requests never marked sent (accumulated while the control socket was
    /// down), to resend once it becomes READY.
    pub fn unsent(&self) -> Vec<(u32, String, Vec<u8>)> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| !p.sent)
            .map(|(id, p)| (*id, p.actor_id.clone(), p.payload.clone()))
            .collect()
    }

    pub fn resolve(&self, id: u32, result: Result<Vec<u8>, String>) {
        if let Some(p) = self.pending.lock().unwrap().remove(&id) {
            if let Some(tx) = p.resolver {
                let _ = tx.send(result);
            }
        }
    }

    /// Reject and remove every pending request (used on shutdown / runner-lost).
    pub fn reject_all(&self, reason: &str) {
        let mut pending = self.pending.lock().unwrap();
        for (_, p) in pending.drain() {
            if let Some(tx) = p.resolver {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
    }

    /// Reject and remove requests older than `KV_EXPIRE`. Returns the count
    /// purged, for a single summary log line.
    pub fn sweep_expired(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let now = Instant::now();
        let expired_ids: Vec<u32> = pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.ts) > KV_EXPIRE)
            .map(|(id, _)| *id)
            .collect();
        let count = expired_ids.len();
        for id in expired_ids {
            if let Some(p) = pending.remove(&id) {
                if let Some(tx) = p.resolver {
                    let _ = tx.send(Err("kv request timed out".to_string()));
                }
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
