//! Hibernating WebSockets: reconciling the engine's view of a restarted
//! actor's open connections against whatever the host persisted for it.
//!
//! Has no teacher counterpart — `tunnel::heartbeat` only tracks liveness of
//! one persistent connection, not per-request restoration — so this is
//! grounded directly on the three-scenario reconciliation table in
//! SPEC_FULL.md §4.4.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::actor::{PendingBody, PendingRequest, RunnerActor};
use crate::error::{Result, RunnerError};
use crate::id::{GatewayId, RequestId, RequestKey};
use crate::protocol::TunnelMessageFromClient;
use crate::runner::Runner;
use crate::ws_adapter::WebSocketAdapter;

/// Host-persisted metadata for one hibernating WebSocket, supplied by the
/// embedding application when it calls `Runner::restore_hibernating_requests`
/// from inside `RunnerHandler::on_actor_start`.
#[derive(Debug, Clone)]
pub struct HibernatingMeta {
    pub gateway_id: Vec<u8>,
    pub request_id: Vec<u8>,
    pub client_message_index: u16,
    pub server_message_index: u16,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// Outcome of reconciling one engine-known or host-persisted connection
/// (spec §4.4's three-scenario table), as pure data so the matching logic is
/// testable without a live `Runner`.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// Both the engine and the host agree the connection is live: restore it.
    Restore(RequestKey, HibernatingMeta),
    /// The engine lists it but the host has no metadata: tell the engine to
    /// close it.
    CloseOnly(RequestKey),
    /// The host has metadata but the engine no longer lists it: the engine
    /// already forgot the connection, so it's torn down locally only.
    Discard(RequestKey, HibernatingMeta),
}

/// Match the actor's engine-known hibernating requests against host-persisted
/// metadata, in the order `Restore`/`CloseOnly` entries (one per engine
/// entry) followed by any left-over `Discard` entries.
fn partition(
    known: &[crate::protocol::HibernatingRequestRef],
    persisted: Vec<HibernatingMeta>,
) -> Vec<Reconciliation> {
    let mut persisted_by_key: HashMap<RequestKey, HibernatingMeta> = persisted
        .into_iter()
        .map(|meta| {
            let key = RequestKey::new(
                GatewayId::new(meta.gateway_id.clone()),
                RequestId::new(meta.request_id.clone()),
            );
            (key, meta)
        })
        .collect();

    let mut out = Vec::with_capacity(known.len());
    for entry in known {
        let key = RequestKey::new(
            GatewayId::new(entry.gateway_id.clone()),
            RequestId::new(entry.request_id.clone()),
        );
        match persisted_by_key.remove(&key) {
            Some(meta) => out.push(Reconciliation::Restore(key, meta)),
            None => out.push(Reconciliation::CloseOnly(key)),
        }
    }
    for (key, meta) in persisted_by_key {
        out.push(Reconciliation::Discard(key, meta));
    }
    out
}

/// Reconcile the actor's engine-known hibernating requests with whatever the
/// host persisted, restoring, closing, or discarding each per spec §4.4.
/// Single-use per actor instance: a second call returns
/// [`RunnerError::AlreadyRestored`].
pub async fn restore_hibernating_requests(
    runner: &Arc<Runner>,
    actor: &Arc<RunnerActor>,
    persisted: Vec<HibernatingMeta>,
) -> Result<()> {
    actor
        .mark_hibernation_restored()
        .map_err(|_| RunnerError::AlreadyRestored(actor.actor_id.clone()))?;

    for item in partition(&actor.hibernating_requests, persisted) {
        match item {
            Reconciliation::Restore(key, meta) => restore_one(runner, actor, key, meta).await,
            Reconciliation::CloseOnly(key) => {
                warn!(key = %key, "hibernating request has no persisted metadata, closing");
                crate::tunnel::send_message(
                    runner,
                    &key,
                    TunnelMessageFromClient::WebSocketClose {
                        code: Some(1000),
                        reason: Some("ws.meta_not_found_during_restore".into()),
                        hibernate: false,
                    },
                );
                runner.unbind_request(&key);
            }
            Reconciliation::Discard(key, meta) => discard_one(runner, actor, key, meta).await,
        }
    }

    Ok(())
}

/// A connection both sides still agree is live: hand it to the host as an
/// already-open, already-restoring adapter. `request_to_actor` for `key` is
/// pre-registered by `Runner::start_actor` before `on_actor_start` is
/// spawned, so no binding happens here.
async fn restore_one(runner: &Arc<Runner>, actor: &Arc<RunnerActor>, key: RequestKey, meta: HibernatingMeta) {
    let (adapter, mut outbound_rx, event_rx) =
        WebSocketAdapter::new_restoring(meta.server_message_index);
    let adapter = Arc::new(adapter);

    actor.insert_websocket(key.clone(), adapter.clone());
    actor.insert_pending_request(
        key.clone(),
        PendingRequest {
            client_message_index: meta.client_message_index,
            body: PendingBody::None,
        },
    );

    crate::tunnel::spawn_outbound_pump(Arc::clone(runner), key.clone(), &mut outbound_rx);

    let request = crate::host::Request {
        method: "GET".into(),
        path: meta.path,
        headers: meta.headers,
        body: None,
    };
    let runner = Arc::clone(runner);
    let actor_id = actor.actor_id.clone();
    tokio::spawn(async move {
        runner
            .handler()
            .websocket(&runner, &actor_id, adapter, &key, request, true, true, event_rx)
            .await;
    });
}

/// A connection the host still has metadata for but the engine no longer
/// lists: hand it to the host so it can register listeners and observe the
/// close, then close it locally without emitting a tunnel frame (the engine
/// already forgot it, so there's nothing to tell it).
async fn discard_one(runner: &Arc<Runner>, actor: &Arc<RunnerActor>, key: RequestKey, meta: HibernatingMeta) {
    debug!(key = %key, "discarding persisted metadata for a connection the engine forgot");

    let (adapter, _outbound_rx, event_rx) =
        WebSocketAdapter::new_restoring(meta.server_message_index);
    let adapter = Arc::new(adapter);

    let request = crate::host::Request {
        method: "GET".into(),
        path: meta.path,
        headers: meta.headers,
        body: None,
    };
    let runner = Arc::clone(runner);
    let actor_id = actor.actor_id.clone();
    let adapter_for_close = adapter.clone();
    tokio::spawn(async move {
        runner
            .handler()
            .websocket(&runner, &actor_id, adapter, &key, request, true, true, event_rx)
            .await;
        adapter_for_close.close_without_callback(Some(1000), Some("ws.stale_metadata".into()));
    });
}
