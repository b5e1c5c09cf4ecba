//! Tunnel multiplexing: HTTP request/response and WebSocket traffic carried
//! over the control channel.
//!
//! Grounded on `tunnel::dispatcher::run`'s per-message-kind `match` and
//! periodic handler-handle cleanup, and `tunnel::stream_handler::handle_stream`'s
//! per-request task shape, generalized from raw-byte stream ids to the
//! (gateway, request) routing key and the actor-scoped bookkeeping in
//! `actor::RunnerActor`.

pub mod hws;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::actor::{BodyEvent, PendingBody, PendingRequest, RunnerActor};
use crate::host::{Request, Response};
use crate::id::{GatewayId, MessageId, RequestId, RequestKey};
use crate::protocol::{TunnelMessageFromClient, TunnelMessageFromServer, WireMessageId};
use crate::runner::Runner;

/// Response bodies larger than this are rejected rather than forwarded
/// (spec §6.5).
pub const MAX_BODY_SIZE: usize = 20 * 1024 * 1024;

/// How long an outbound tunnel message may go un-acked before GC reclaims it
/// (spec §6.5).
pub const MESSAGE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// GC sweep interval (spec §6.5).
pub const GC_INTERVAL: Duration = Duration::from_secs(60);

fn request_key(gateway_id: &[u8], request_id: &[u8]) -> RequestKey {
    RequestKey::new(
        GatewayId::new(gateway_id.to_vec()),
        RequestId::new(request_id.to_vec()),
    )
}

fn wire_id(key: &RequestKey, index: u16) -> WireMessageId {
    WireMessageId {
        gateway_id: key.gateway_id.0.clone(),
        request_id: key.request_id.0.clone(),
        index,
    }
}

/// Send an outbound tunnel message for `key`, buffering it if the control
/// socket is not currently connected (spec §4.3 "Outbound send").
pub fn send_message(runner: &Runner, key: &RequestKey, kind: TunnelMessageFromClient) {
    if !runner.is_ready() {
        runner.buffer_message(key.clone(), kind);
        return;
    }

    let actor_id = match runner.lookup_actor_id(key) {
        Some(id) => id,
        None => {
            warn!(key = %key, "no actor routed for outbound tunnel message, dropping");
            return;
        }
    };
    let actor = match runner.get_actor(&actor_id) {
        Some(a) => a,
        None => {
            warn!(actor_id = %actor_id, "actor vanished before send, dropping message");
            return;
        }
    };

    let index = actor.next_client_message_index(key);
    let message_id = MessageId::new(key.clone(), index);
    actor.record_pending_message(message_id, key.clone());

    runner.send_wire_tunnel_message(wire_id(key, index), kind);
}

/// Dispatch an inbound tunnel message from the engine.
pub async fn handle_tunnel_message(
    runner: &Arc<Runner>,
    message_id: WireMessageId,
    kind: TunnelMessageFromServer,
) {
    let key = request_key(&message_id.gateway_id, &message_id.request_id);

    match kind {
        TunnelMessageFromServer::RequestStart {
            actor_id,
            method,
            path,
            headers,
            body,
            stream,
        } => {
            handle_request_start(runner, key, actor_id, method, path, headers, body, stream).await;
        }
        TunnelMessageFromServer::RequestChunk { body, finish } => {
            handle_request_chunk(runner, &key, body, finish);
        }
        TunnelMessageFromServer::RequestAbort => {
            handle_request_abort(runner, &key);
        }
        TunnelMessageFromServer::WebSocketOpen {
            actor_id,
            path,
            headers,
        } => {
            handle_websocket_open(runner, key, actor_id, path, headers).await;
        }
        TunnelMessageFromServer::WebSocketMessage {
            data,
            binary,
            index,
        } => {
            handle_websocket_message(runner, &key, data, binary, index);
        }
        TunnelMessageFromServer::WebSocketClose { code, reason } => {
            handle_websocket_close(runner, &key, code, reason);
        }
    }
}

async fn handle_request_start(
    runner: &Arc<Runner>,
    key: RequestKey,
    actor_id: String,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    stream: bool,
) {
    let actor = match runner.get_and_wait_for_actor(&actor_id).await {
        Some(a) => a,
        None => {
            send_message(
                runner,
                &key,
                TunnelMessageFromClient::ResponseStart {
                    status: 503,
                    headers: vec![("x-rivet-error".into(), "runner.actor_not_found".into())],
                    body: Some(Vec::new()),
                    stream: false,
                },
            );
            return;
        }
    };
    runner.bind_request(key.clone(), actor_id.clone());

    if stream {
        let (tx, rx) = mpsc::unbounded_channel();
        actor.insert_pending_request(
            key.clone(),
            PendingRequest {
                client_message_index: 0,
                body: PendingBody::Streaming(tx),
            },
        );
        let runner = Arc::clone(runner);
        tokio::spawn(async move {
            run_fetch_streaming(runner, actor, key, method, path, headers, body, rx).await;
        });
    } else {
        actor.insert_pending_request(
            key.clone(),
            PendingRequest {
                client_message_index: 0,
                body: PendingBody::None,
            },
        );
        let runner = Arc::clone(runner);
        tokio::spawn(async move {
            run_fetch_buffered(runner, actor, key, method, path, headers, body).await;
        });
    }
}

async fn run_fetch_buffered(
    runner: Arc<Runner>,
    actor: Arc<RunnerActor>,
    key: RequestKey,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
) {
    let request = Request {
        method,
        path,
        headers,
        body,
    };
    let result = runner
        .handler()
        .fetch(&runner, &actor.actor_id, &key, request)
        .await;

    actor.take_pending_request(&key);
    runner.unbind_request(&key);

    match result {
        Ok(resp) => send_response(&runner, &key, resp),
        Err(e) => {
            warn!(error = %e, "fetch handler failed");
            send_message(
                &runner,
                &key,
                TunnelMessageFromClient::ResponseStart {
                    status: 500,
                    headers: Vec::new(),
                    body: Some(Vec::new()),
                    stream: false,
                },
            );
        }
    }
}

async fn run_fetch_streaming(
    runner: Arc<Runner>,
    actor: Arc<RunnerActor>,
    key: RequestKey,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    mut body_rx: mpsc::UnboundedReceiver<BodyEvent>,
) {
    // The host-facing `Request` is fully-buffered; streaming applies to wire
    // framing only, so the body is collected before invoking `fetch`.
    let mut parts = body.map(|b| vec![b]).unwrap_or_default();
    while let Some(event) = body_rx.recv().await {
        match event {
            BodyEvent::Chunk(chunk) => parts.push(chunk),
            BodyEvent::Abort => {
                actor.take_pending_request(&key);
                runner.unbind_request(&key);
                return;
            }
        }
    }
    let combined: Vec<u8> = parts.into_iter().flatten().collect();

    let request = Request {
        method,
        path,
        headers,
        body: Some(combined),
    };
    let result = runner
        .handler()
        .fetch(&runner, &actor.actor_id, &key, request)
        .await;

    actor.take_pending_request(&key);
    runner.unbind_request(&key);

    match result {
        Ok(resp) => send_response(&runner, &key, resp),
        Err(e) => {
            warn!(error = %e, "fetch handler failed");
            send_message(
                &runner,
                &key,
                TunnelMessageFromClient::ResponseStart {
                    status: 500,
                    headers: Vec::new(),
                    body: Some(Vec::new()),
                    stream: false,
                },
            );
        }
    }
}

fn send_response(runner: &Runner, key: &RequestKey, resp: Response) {
    if resp.body.len() > MAX_BODY_SIZE {
        warn!(size = resp.body.len(), "response body exceeds max size");
        send_message(
            runner,
            key,
            TunnelMessageFromClient::ResponseStart {
                status: 500,
                headers: Vec::new(),
                body: Some(Vec::new()),
                stream: false,
            },
        );
        return;
    }
    send_message(
        runner,
        key,
        TunnelMessageFromClient::ResponseStart {
            status: resp.status,
            headers: resp.headers,
            body: Some(resp.body),
            stream: false,
        },
    );
}

fn handle_request_chunk(runner: &Runner, key: &RequestKey, body: Vec<u8>, finish: bool) {
    let Some(actor_id) = runner.lookup_actor_id(key) else {
        return;
    };
    let Some(actor) = runner.get_actor(&actor_id) else {
        return;
    };
    if let Some(pending) = actor.take_pending_request(key) {
        if let PendingBody::Streaming(tx) = &pending.body {
            let _ = tx.send(BodyEvent::Chunk(body));
            if finish {
                debug!(key = %key, "request body stream finished");
            } else {
                actor.insert_pending_request(key.clone(), pending);
            }
        }
    }
}

fn handle_request_abort(runner: &Runner, key: &RequestKey) {
    let Some(actor_id) = runner.lookup_actor_id(key) else {
        return;
    };
    let Some(actor) = runner.get_actor(&actor_id) else {
        return;
    };
    if let Some(pending) = actor.take_pending_request(key) {
        if let PendingBody::Streaming(tx) = &pending.body {
            let _ = tx.send(BodyEvent::Abort);
        }
    }
    runner.unbind_request(key);
}

async fn handle_websocket_open(
    runner: &Arc<Runner>,
    key: RequestKey,
    actor_id: String,
    path: String,
    headers: Vec<(String, String)>,
) {
    let actor = match runner.get_and_wait_for_actor(&actor_id).await {
        Some(a) => a,
        None => {
            send_message(
                runner,
                &key,
                TunnelMessageFromClient::WebSocketClose {
                    code: Some(1011),
                    reason: Some("Actor not found".into()),
                    hibernate: false,
                },
            );
            return;
        }
    };

    if let Some(old) = actor.remove_websocket(&key) {
        old.close_without_callback(Some(1000), Some("ws.duplicate_open".into()));
    }

    let request = Request {
        method: "GET".into(),
        path: path.clone(),
        headers: headers.clone(),
        body: None,
    };
    let can_hibernate = runner.handler().can_hibernate(&actor_id, &key, &request).await;

    let (adapter, mut outbound_rx, event_rx) =
        crate::ws_adapter::WebSocketAdapter::new_fresh(can_hibernate);
    let adapter = Arc::new(adapter);
    actor.insert_websocket(key.clone(), adapter.clone());
    actor.insert_pending_request(
        key.clone(),
        PendingRequest {
            client_message_index: 0,
            body: PendingBody::None,
        },
    );

    send_message(
        runner,
        &key,
        TunnelMessageFromClient::WebSocketOpen { can_hibernate },
    );
    adapter.handle_open();

    spawn_outbound_pump(Arc::clone(runner), key.clone(), &mut outbound_rx);
    let runner = Arc::clone(runner);
    let actor_id_for_task = actor_id.clone();
    tokio::spawn(async move {
        runner
            .handler()
            .websocket(
                &runner,
                &actor_id_for_task,
                adapter,
                &key,
                request,
                can_hibernate,
                false,
                event_rx,
            )
            .await;
    });
}

/// Pump a `WebSocketAdapter`'s outbound actions into tunnel frames. Spawned
/// once per adapter; exits when the adapter (and its outbound sender) is
/// dropped.
pub(crate) fn spawn_outbound_pump(
    runner: Arc<Runner>,
    key: RequestKey,
    outbound_rx: &mut mpsc::UnboundedReceiver<crate::ws_adapter::OutboundAction>,
) {
    let mut rx = std::mem::replace(outbound_rx, mpsc::unbounded_channel().1);
    tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            match action {
                crate::ws_adapter::OutboundAction::Send { data, binary } => {
                    send_message(
                        &runner,
                        &key,
                        TunnelMessageFromClient::WebSocketMessage { data, binary },
                    );
                }
                crate::ws_adapter::OutboundAction::Close {
                    code,
                    reason,
                    hibernate,
                } => {
                    send_message(
                        &runner,
                        &key,
                        TunnelMessageFromClient::WebSocketClose {
                            code,
                            reason,
                            hibernate,
                        },
                    );
                }
            }
        }
    });
}

fn handle_websocket_message(runner: &Runner, key: &RequestKey, data: Vec<u8>, binary: bool, index: u16) {
    let Some(actor_id) = runner.lookup_actor_id(key) else {
        warn!(key = %key, "websocket message for unrouted request, dropping");
        return;
    };
    let Some(actor) = runner.get_actor(&actor_id) else {
        return;
    };
    let Some(adapter) = actor.get_websocket(key) else {
        warn!(key = %key, "websocket message with no adapter, dropping");
        return;
    };

    if let Err(reason) = adapter.handle_message(data, binary, index) {
        adapter.close(Some(1008), Some(reason.to_string()));
        actor.remove_websocket(key);
    }
}

fn handle_websocket_close(runner: &Runner, key: &RequestKey, code: Option<u16>, reason: Option<String>) {
    let Some(actor_id) = runner.lookup_actor_id(key) else {
        return;
    };
    let Some(actor) = runner.get_actor(&actor_id) else {
        return;
    };
    if let Some(adapter) = actor.remove_websocket(key) {
        adapter.handle_close(code, reason);
    }
    runner.unbind_request(key);
}

/// Periodic GC: reclaim un-acked outbound tunnel messages (spec §4.3).
pub fn gc_sweep(runner: &Runner) {
    let mut purged = 0usize;
    for actor in runner.all_actors() {
        for (_id, key) in actor.sweep_stale_messages(MESSAGE_ACK_TIMEOUT) {
            purged += 1;
            if let Some(pending) = actor.take_pending_request(&key) {
                if let PendingBody::Streaming(tx) = pending.body {
                    let _ = tx.send(BodyEvent::Abort);
                }
            }
            if let Some(adapter) = actor.remove_websocket(&key) {
                adapter.close_without_callback(Some(1000), Some("ws.ack_timeout".into()));
            }
            runner.unbind_request(&key);
        }
    }
    if purged > 0 {
        warn!(purged, "tunnel GC purged stale un-acked messages");
    }
}

/// Close all active requests for `actor` without removing the actor
/// (spec §4.2 `force_stop_actor` step 3). Hibernatable WebSockets are left
/// untouched for the engine to hibernate.
pub fn close_active_requests(runner: &Runner, actor: &RunnerActor) {
    for key in actor.all_pending_request_keys() {
        if let Some(pending) = actor.take_pending_request(&key) {
            if let PendingBody::Streaming(tx) = pending.body {
                let _ = tx.send(BodyEvent::Abort);
            }
        }
        runner.unbind_request(&key);
    }
    for (key, adapter) in actor.all_websockets() {
        if adapter.is_hibernatable() {
            continue;
        }
        adapter.close(Some(1000), Some("actor.stopped".into()));
        actor.remove_websocket(&key);
        runner.unbind_request(&key);
    }
}

/// Tear down the tunnel on runner shutdown (spec §4.3 "Shutdown").
pub fn shutdown(runner: &Runner) {
    for actor in runner.all_actors() {
        for key in actor.all_pending_request_keys() {
            if let Some(pending) = actor.take_pending_request(&key) {
                if let PendingBody::Streaming(tx) = pending.body {
                    let _ = tx.send(BodyEvent::Abort);
                }
            }
        }
        for (key, adapter) in actor.all_websockets() {
            if adapter.is_hibernatable() {
                continue;
            }
            adapter.close(Some(1000), Some("ws.tunnel_shutdown".into()));
            actor.remove_websocket(&key);
        }
    }
    runner.clear_routing();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_id_round_trips_key_and_index() {
        let key = request_key(&[1, 2], &[3, 4]);
        let id = wire_id(&key, 9);
        assert_eq!(id.gateway_id, vec![1, 2]);
        assert_eq!(id.request_id, vec![3, 4]);
        assert_eq!(id.index, 9);
    }
}
