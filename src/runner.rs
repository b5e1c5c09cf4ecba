//! The runner: control-channel connection lifecycle, actor registry, and
//! the public API surface embedding applications drive.
//!
//! The connect/reconnect loop, single-writer task, and TLS setup are
//! grounded on `tunnel::client::connect_and_run` and `tunnel::writer::spawn_writer`;
//! the periodic command-ack cadence and graceful-shutdown signalling mirror
//! `app.rs`'s `run`/`wait_for_shutdown`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, info, warn};

use crate::actor::{ActorConfig, ActorStartState, RunnerActor};
use crate::backoff::Backoff;
use crate::config::RunnerConfig;
use crate::error::{Result, RunnerError};
use crate::host::RunnerHandler;
use crate::id::{GatewayId, RequestId, RequestKey};
use crate::kv::KvGateway;
use crate::protocol::{
    ActorCheckpoint, ActorRunState, Command, CommandWrapper, Event, EventWrapper, ProtocolMetadata,
    StopCode, ToClient, ToServer, ToServerAckCommands, ToServerEvents, ToServerInit,
    ToServerKvRequest, ToServerTunnelMessage, WireMessageId,
};
use crate::tunnel;
use crate::tunnel::hws::HibernatingMeta;

/// How often accumulated command checkpoints are batched and acked
/// (spec §6.5).
const COMMAND_ACK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// An actor's in-memory event backlog above this size logs a warning —
/// it likely means the control channel has been down a long time
/// (spec §6.5).
const EVENT_BACKLOG_WARN_THRESHOLD: usize = 10_000;

/// How long a KV round trip may take before the caller sees a timeout.
const KV_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard cap on a graceful shutdown's actor-drain wait (spec §6.5).
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

/// What the writer task can be asked to do: encode and send a wire frame, or
/// send a raw close frame and stop.
enum WriterMsg {
    Frame(ToServer),
    Close { code: u16, reason: String },
}

struct Connection {
    outbound_tx: mpsc::UnboundedSender<WriterMsg>,
}

/// Runner-side control channel, actor lifecycle, and tunnel core.
///
/// Constructed via [`Runner::new`], which returns an `Arc<Runner>` — the
/// runner is always shared between its background tasks and the embedding
/// application.
pub struct Runner {
    self_ref: Weak<Runner>,
    config: RunnerConfig,
    handler: Arc<dyn RunnerHandler>,
    actors: Mutex<HashMap<String, Arc<RunnerActor>>>,
    request_to_actor: Mutex<HashMap<RequestKey, String>>,
    kv: KvGateway,
    conn: Mutex<Option<Connection>>,
    buffered_tunnel: Mutex<VecDeque<(RequestKey, crate::protocol::TunnelMessageFromClient)>>,
    protocol_metadata: Mutex<Option<ProtocolMetadata>>,
    runner_id: Mutex<Option<String>>,
    ready: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    disconnected_since: Mutex<Option<std::time::Instant>>,
    runner_lost_fired: AtomicBool,
    last_close_reason: Mutex<Option<(Option<u16>, Option<String>)>>,
}

impl Runner {
    /// Construct a new runner. Call [`Runner::start`] to connect.
    pub fn new(config: RunnerConfig, handler: Arc<dyn RunnerHandler>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Runner {
            self_ref: self_ref.clone(),
            config,
            handler,
            actors: Mutex::new(HashMap::new()),
            request_to_actor: Mutex::new(HashMap::new()),
            kv: KvGateway::new(),
            conn: Mutex::new(None),
            buffered_tunnel: Mutex::new(VecDeque::new()),
            protocol_metadata: Mutex::new(None),
            runner_id: Mutex::new(None),
            ready: AtomicBool::new(false),
            shutdown_tx,
            disconnected_since: Mutex::new(None),
            runner_lost_fired: AtomicBool::new(false),
            last_close_reason: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<Runner> {
        self.self_ref
            .upgrade()
            .expect("Runner dropped while still in use")
    }

    pub fn handler(&self) -> &Arc<dyn RunnerHandler> {
        &self.handler
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn runner_id(&self) -> Option<String> {
        self.runner_id.lock().unwrap().clone()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn lookup_actor_id(&self, key: &RequestKey) -> Option<String> {
        self.request_to_actor.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn get_actor(&self, actor_id: &str) -> Option<Arc<RunnerActor>> {
        self.actors.lock().unwrap().get(actor_id).cloned()
    }

    pub(crate) async fn get_and_wait_for_actor(&self, actor_id: &str) -> Option<Arc<RunnerActor>> {
        let actor = self.get_actor(actor_id)?;
        match actor.wait_for_start().await {
            ActorStartState::Ready => Some(actor),
            _ => None,
        }
    }

    pub(crate) fn bind_request(&self, key: RequestKey, actor_id: String) {
        self.request_to_actor.lock().unwrap().insert(key, actor_id);
    }

    pub(crate) fn unbind_request(&self, key: &RequestKey) {
        self.request_to_actor.lock().unwrap().remove(key);
    }

    pub(crate) fn all_actors(&self) -> Vec<Arc<RunnerActor>> {
        self.actors.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn clear_routing(&self) {
        self.request_to_actor.lock().unwrap().clear();
    }

    pub(crate) fn buffer_message(&self, key: RequestKey, kind: crate::protocol::TunnelMessageFromClient) {
        self.buffered_tunnel.lock().unwrap().push_back((key, kind));
    }

    fn send_wire(&self, msg: ToServer) {
        let conn = self.conn.lock().unwrap();
        if let Some(conn) = conn.as_ref() {
            let _ = conn.outbound_tx.send(WriterMsg::Frame(msg));
        }
    }

    /// Ask the writer task to send a raw close frame and stop. A no-op if
    /// the control socket isn't currently connected.
    fn send_close_frame(&self, code: u16, reason: impl Into<String>) {
        let conn = self.conn.lock().unwrap();
        if let Some(conn) = conn.as_ref() {
            let _ = conn.outbound_tx.send(WriterMsg::Close {
                code,
                reason: reason.into(),
            });
        }
    }

    pub(crate) fn send_wire_tunnel_message(
        &self,
        message_id: WireMessageId,
        kind: crate::protocol::TunnelMessageFromClient,
    ) {
        self.send_wire(ToServer::TunnelMessage(ToServerTunnelMessage {
            message_id,
            kind,
        }));
    }

    /// Reconcile an actor's engine-known hibernating requests against
    /// host-persisted metadata. MUST be called once, from inside
    /// `RunnerHandler::on_actor_start`, before it returns.
    pub async fn restore_hibernating_requests(
        &self,
        actor_id: &str,
        persisted: Vec<HibernatingMeta>,
    ) -> Result<()> {
        let actor = self
            .get_actor(actor_id)
            .ok_or_else(|| RunnerError::ActorNotFound(actor_id.to_string()))?;
        tunnel::hws::restore_hibernating_requests(&self.arc(), &actor, persisted).await
    }

    /// Forward an opaque KV request to the engine and await its response.
    pub async fn kv_request(&self, actor_id: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (id, rx) = self.kv.register(actor_id.to_string(), payload.clone());
        if self.is_ready() {
            self.send_kv(id, actor_id, payload);
        }
        match tokio::time::timeout(KV_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(bytes))) => Ok(bytes),
            Ok(Ok(Err(msg))) => Err(RunnerError::HandlerException(anyhow::anyhow!(msg))),
            Ok(Err(_)) | Err(_) => Err(RunnerError::KvRequestTimeout),
        }
    }

    fn send_kv(&self, id: u32, actor_id: &str, payload: Vec<u8>) {
        self.kv.mark_sent(id);
        self.send_wire(ToServer::KvRequest(ToServerKvRequest {
            request_id: id,
            actor_id: actor_id.to_string(),
            payload,
        }));
    }

    /// Emit an actor intent to hibernate/sleep (spec §4.2).
    pub fn sleep_actor(&self, actor_id: &str) -> Result<()> {
        self.emit_intent(actor_id, crate::protocol::ActorIntentKind::Sleep)
    }

    /// Emit an actor intent to stop (spec §4.2). The engine is expected to
    /// follow up with an explicit `CommandStopActor`.
    pub fn stop_actor_intent(&self, actor_id: &str) -> Result<()> {
        self.emit_intent(actor_id, crate::protocol::ActorIntentKind::Stop)
    }

    fn emit_intent(&self, actor_id: &str, intent: crate::protocol::ActorIntentKind) -> Result<()> {
        let actor = self
            .get_actor(actor_id)
            .ok_or_else(|| RunnerError::ActorNotFound(actor_id.to_string()))?;
        self.emit_event(&actor, Event::ActorIntent { intent });
        Ok(())
    }

    fn emit_event(&self, actor: &RunnerActor, event: Event) {
        let checkpoint = ActorCheckpoint {
            actor_id: actor.actor_id.clone(),
            generation: actor.generation,
            index: actor.next_event_index(),
        };
        let wrapper = EventWrapper { checkpoint, event };
        actor.push_event(wrapper.clone());

        if actor.event_backlog_len() > EVENT_BACKLOG_WARN_THRESHOLD {
            warn!(
                actor_id = %actor.actor_id,
                backlog = actor.event_backlog_len(),
                "actor event backlog exceeds warning threshold"
            );
        }

        if self.is_ready() {
            self.send_wire(ToServer::Events(ToServerEvents {
                actor_id: actor.actor_id.clone(),
                events: vec![wrapper],
            }));
        }
    }

    /// Force-stop a locally hosted actor without waiting for an explicit
    /// `CommandStopActor` (spec §4.2 `force_stop_actor`).
    pub async fn force_stop_actor(&self, actor_id: &str) -> Result<()> {
        let actor = self
            .actors
            .lock()
            .unwrap()
            .remove(actor_id)
            .ok_or_else(|| RunnerError::ActorNotFound(actor_id.to_string()))?;

        tunnel::close_active_requests(self, &actor);

        if let Err(e) = self.handler.on_actor_stop(actor_id, actor.generation).await {
            warn!(actor_id = %actor_id, error = %e, "on_actor_stop handler failed during force stop");
        }

        self.emit_event(
            &actor,
            Event::ActorStateUpdate {
                state: ActorRunState::Stopped {
                    code: StopCode::Ok,
                    message: None,
                },
            },
        );
        Ok(())
    }

    /// Run the control-channel connect/reconnect loop until `shutdown` is
    /// called. Intended to be awaited as the runner's main task.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let backoff = Backoff::default();
        let mut attempt = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.run_connection(&mut shutdown_rx).await {
                Ok(graceful) => {
                    if graceful {
                        break;
                    }
                    attempt = 0;
                }
                Err(e) => {
                    warn!(error = %e, "control connection lost");
                }
            }

            self.ready.store(false, Ordering::Release);
            *self.conn.lock().unwrap() = None;
            self.kv.reset_unsent();

            let (close_code, close_reason) = self
                .last_close_reason
                .lock()
                .unwrap()
                .take()
                .unwrap_or((None, None));
            self.handler
                .on_disconnected(close_code, close_reason.clone())
                .await;

            if is_eviction_reason(close_reason.as_deref()) {
                warn!(reason = ?close_reason, "engine evicted runner, shutting down immediately");
                self.shutdown(true).await;
                break;
            }

            {
                let mut since = self.disconnected_since.lock().unwrap();
                if since.is_none() {
                    *since = Some(std::time::Instant::now());
                }
            }
            self.check_runner_lost().await;

            if *shutdown_rx.borrow() {
                break;
            }

            let delay = backoff.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            info!(delay_ms = delay.as_millis(), "reconnecting control channel");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        self.handler.on_shutdown().await;
        Ok(())
    }

    /// Abandon every hosted actor once the control channel has been down
    /// continuously for longer than the engine-negotiated
    /// `runner_lost_threshold` (spec §4.1 "Runner-lost timer"). A no-op
    /// until the threshold is both known and exceeded, and fires at most
    /// once per disconnection.
    async fn check_runner_lost(&self) {
        if self.runner_lost_fired.load(Ordering::Acquire) {
            return;
        }
        let threshold_ms = match self.protocol_metadata.lock().unwrap().as_ref() {
            Some(m) if m.runner_lost_threshold > 0 => m.runner_lost_threshold,
            _ => return,
        };
        let since = match *self.disconnected_since.lock().unwrap() {
            Some(t) => t,
            None => return,
        };
        if since.elapsed() < Duration::from_millis(threshold_ms) {
            return;
        }

        self.runner_lost_fired.store(true, Ordering::Release);
        warn!(
            threshold_ms,
            "runner-lost threshold exceeded, abandoning all hosted actors"
        );
        self.kv.reject_all("runner lost");
        for actor in self.all_actors() {
            let _ = self.force_stop_actor(&actor.actor_id).await;
        }
    }

    /// Request shutdown: stops reconnecting and tears down the tunnel and all
    /// actors. `immediate` skips the `ToServerStopping` drain handshake and
    /// closes the control socket right away; otherwise the engine is told to
    /// stop issuing new commands and the actor map is given up to
    /// `SHUTDOWN_TIMEOUT` to drain via engine-issued `CommandStopActor`s
    /// before the socket is closed (spec §4.1 "Shutdown").
    pub async fn shutdown(&self, immediate: bool) {
        let _ = self.shutdown_tx.send(true);

        if immediate {
            self.send_close_frame(1000, "pegboard.runner_shutdown");
        } else {
            self.send_wire(ToServer::Stopping);
            self.drain_actors_before_shutdown().await;
            self.send_close_frame(1000, "pegboard.runner_shutdown");
        }

        tunnel::shutdown(self);
        self.kv.reject_all("runner shutdown");
    }

    async fn drain_actors_before_shutdown(&self) {
        let deadline = std::time::Instant::now() + SHUTDOWN_TIMEOUT;
        let mut last_log = std::time::Instant::now();
        loop {
            let remaining = self.actors.lock().unwrap().len();
            if remaining == 0 {
                return;
            }
            if std::time::Instant::now() >= deadline {
                warn!(remaining, "graceful shutdown hit its drain cap with actors still hosted");
                return;
            }
            if last_log.elapsed() >= Duration::from_secs(5) {
                info!(remaining, "draining hosted actors before shutdown");
                last_log = std::time::Instant::now();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn run_connection(
        self: &Arc<Self>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<bool> {
        let ws_stream = self.connect().await?;
        *self.disconnected_since.lock().unwrap() = None;
        self.runner_lost_fired.store(false, Ordering::Release);
        *self.last_close_reason.lock().unwrap() = None;
        let (ws_sink, mut ws_read) = ws_stream.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<WriterMsg>();
        let writer_handle = spawn_writer(ws_sink, outbound_rx);
        *self.conn.lock().unwrap() = Some(Connection {
            outbound_tx: outbound_tx.clone(),
        });

        self.send_wire(ToServer::Init(ToServerInit {
            name: self.config.name.clone(),
            version: crate::protocol::PROTOCOL_VERSION,
            total_slots: self.config.total_slots,
            prepopulate_actor_names: self.config.prepopulate_actor_names.clone(),
            metadata: self.config.metadata.clone(),
        }));

        let mut ack_interval = tokio::time::interval(COMMAND_ACK_INTERVAL);
        ack_interval.tick().await; // first tick fires immediately
        let mut gc_interval = tokio::time::interval(tunnel::GC_INTERVAL);
        gc_interval.tick().await;

        let mut writer_handle = writer_handle;
        let graceful = loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    break true;
                }

                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.handle_frame(&data).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (Some(u16::from(f.code)), Some(f.reason.to_string())))
                                .unwrap_or((None, None));
                            debug!(?code, ?reason, "control channel closed by engine");
                            *self.last_close_reason.lock().unwrap() = Some((code, reason));
                            break false;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "control channel read error");
                            break false;
                        }
                        None => {
                            break false;
                        }
                    }
                }

                _ = ack_interval.tick() => {
                    self.send_command_acks();
                }

                _ = gc_interval.tick() => {
                    tunnel::gc_sweep(self);
                    let purged = self.kv.sweep_expired();
                    if purged > 0 {
                        warn!(purged, "kv gateway purged expired requests");
                    }
                }

                _ = &mut writer_handle => {
                    warn!("control channel writer task exited, reconnecting");
                    break false;
                }
            }
        };

        // Clear the shared connection handle before waiting on the writer so
        // its channel actually closes once our own sender below is dropped.
        *self.conn.lock().unwrap() = None;
        drop(outbound_tx);
        if !writer_handle.is_finished() {
            let _ = tokio::time::timeout(Duration::from_secs(5), writer_handle).await;
        }

        Ok(graceful)
    }

    async fn connect(&self) -> anyhow::Result<tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >> {
        let url = build_connect_url(&self.config);
        let mut request = url.into_client_request()?;
        let protocol = match &self.config.token {
            Some(token) => format!("rivet, rivet_token.{token}"),
            None => "rivet".to_string(),
        };
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(&protocol)?);

        let ws_config = WebSocketConfig {
            max_frame_size: Some(tunnel::MAX_BODY_SIZE + (1 << 16)),
            max_message_size: Some(tunnel::MAX_BODY_SIZE + (1 << 16)),
            ..Default::default()
        };
        let connector = Connector::Rustls(Arc::new(build_tls_config()));
        let (stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            Some(ws_config),
            false,
            Some(connector),
        )
        .await?;
        info!(endpoint = %self.config.endpoint, "control channel connected");
        Ok(stream)
    }

    async fn handle_frame(self: &Arc<Self>, data: &[u8]) {
        let msg = match crate::protocol::decode_to_client(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to decode control frame");
                return;
            }
        };

        match msg {
            ToClient::Init(init) => {
                let changed = self.runner_id.lock().unwrap().as_ref() != Some(&init.runner_id);
                if changed {
                    let actor_ids: Vec<String> =
                        self.all_actors().into_iter().map(|a| a.actor_id.clone()).collect();
                    if !actor_ids.is_empty() {
                        warn!(
                            count = actor_ids.len(),
                            "runner_id changed, resetting all hosted actors"
                        );
                    }
                    for actor_id in actor_ids {
                        let _ = self.force_stop_actor(&actor_id).await;
                    }
                }
                *self.runner_id.lock().unwrap() = Some(init.runner_id);
                *self.protocol_metadata.lock().unwrap() = Some(init.metadata);
                self.ready.store(true, Ordering::Release);
                self.flush_on_connect();
                self.handler.on_connected().await;
            }
            ToClient::Commands(commands) => {
                for cmd in commands {
                    self.handle_command(cmd).await;
                }
            }
            ToClient::AckEvents(ack) => {
                for checkpoint in ack.last_event_checkpoints {
                    if let Some(actor) = self.get_actor(&checkpoint.actor_id) {
                        actor.ack_events_up_to(checkpoint.index);
                    }
                }
            }
            ToClient::KvResponse(resp) => {
                self.kv.resolve(resp.request_id, resp.result);
            }
            ToClient::TunnelMessage(t) => {
                tunnel::handle_tunnel_message(&self.arc(), t.message_id, t.kind).await;
            }
            ToClient::Ping { ts } => {
                self.send_wire(ToServer::Pong { ts });
            }
        }
    }

    fn flush_on_connect(&self) {
        for (id, actor_id, payload) in self.kv.unsent() {
            self.send_kv(id, &actor_id, payload);
        }

        for actor in self.all_actors() {
            let events = actor.event_history();
            if !events.is_empty() {
                self.send_wire(ToServer::Events(ToServerEvents {
                    actor_id: actor.actor_id.clone(),
                    events,
                }));
            }
        }

        let buffered: Vec<_> = {
            let mut queue = self.buffered_tunnel.lock().unwrap();
            queue.drain(..).collect()
        };
        for (key, kind) in buffered {
            tunnel::send_message(self, &key, kind);
        }
    }

    fn send_command_acks(&self) {
        let indices: Vec<(String, i64)> = self
            .all_actors()
            .into_iter()
            .map(|a| (a.actor_id.clone(), a.last_command_idx()))
            .collect();
        if indices.is_empty() {
            return;
        }
        self.send_wire(ToServer::AckCommands(ToServerAckCommands {
            last_command_indices: indices,
        }));
    }

    async fn handle_command(self: &Arc<Self>, wrapper: CommandWrapper) {
        let CommandWrapper { checkpoint, command } = wrapper;

        if let Some(actor) = self.get_actor(&checkpoint.actor_id) {
            // At-least-once delivery: replay of an already-applied command
            // is a no-op (spec §8 idempotent replay invariant).
            if checkpoint.index as i64 <= actor.last_command_idx() {
                return;
            }
        }

        match command {
            Command::StartActor {
                config,
                hibernating_requests,
            } => {
                self.start_actor(checkpoint, config, hibernating_requests).await;
            }
            Command::StopActor => {
                self.stop_actor(checkpoint).await;
            }
        }
    }

    async fn start_actor(
        self: &Arc<Self>,
        checkpoint: ActorCheckpoint,
        config: crate::protocol::ActorConfigWire,
        hibernating_requests: Vec<crate::protocol::HibernatingRequestRef>,
    ) {
        let actor_config: ActorConfig = config.into();
        let actor = Arc::new(RunnerActor::new(
            checkpoint.actor_id.clone(),
            checkpoint.generation,
            actor_config.clone(),
            hibernating_requests,
        ));
        actor.set_last_command_idx(checkpoint.index as i64);

        // Register routing for every hibernating request up front, before
        // `on_actor_start` is even spawned, so a tunnel frame racing the
        // handler's restore call still finds its actor (spec §4.4).
        for req in &actor.hibernating_requests {
            let key = RequestKey::new(
                GatewayId::new(req.gateway_id.clone()),
                RequestId::new(req.request_id.clone()),
            );
            self.bind_request(key, checkpoint.actor_id.clone());
        }

        self.actors
            .lock()
            .unwrap()
            .insert(checkpoint.actor_id.clone(), actor.clone());

        let runner = Arc::clone(self);
        let actor_id = checkpoint.actor_id.clone();
        let generation = checkpoint.generation;
        tokio::spawn(async move {
            let result = runner
                .handler
                .on_actor_start(&runner, &actor_id, generation, &actor_config)
                .await;
            match result {
                Ok(()) => actor.resolve_start(),
                Err(e) => {
                    warn!(actor_id = %actor_id, error = %e, "on_actor_start handler failed");
                    actor.reject_start(e.to_string());
                    runner.emit_event(
                        &actor,
                        Event::ActorStateUpdate {
                            state: ActorRunState::Stopped {
                                code: StopCode::Error,
                                message: Some(e.to_string()),
                            },
                        },
                    );
                }
            }
        });
    }

    async fn stop_actor(self: &Arc<Self>, checkpoint: ActorCheckpoint) {
        let actor = self.actors.lock().unwrap().remove(&checkpoint.actor_id);
        let Some(actor) = actor else {
            return;
        };
        if actor.generation != checkpoint.generation {
            // Stale command for a generation we've already superseded.
            self.actors
                .lock()
                .unwrap()
                .insert(checkpoint.actor_id.clone(), actor);
            return;
        }

        tunnel::close_active_requests(self, &actor);

        if let Err(e) = self
            .handler
            .on_actor_stop(&checkpoint.actor_id, checkpoint.generation)
            .await
        {
            warn!(actor_id = %checkpoint.actor_id, error = %e, "on_actor_stop handler failed");
        }

        self.emit_event(
            &actor,
            Event::ActorStateUpdate {
                state: ActorRunState::Stopped {
                    code: StopCode::Ok,
                    message: None,
                },
            },
        );
    }
}

/// Build the control-channel connect URL, appending the protocol version,
/// namespace, and runner key as query params (spec §4.1 "Connect handshake").
fn build_connect_url(config: &RunnerConfig) -> String {
    let separator = if config.endpoint.contains('?') { '&' } else { '?' };
    format!(
        "{}{separator}protocol_version={}&namespace={}&runner_key={}",
        config.endpoint,
        crate::protocol::PROTOCOL_VERSION,
        percent_encode_component(&config.namespace),
        percent_encode_component(&config.runner_key),
    )
}

/// Percent-encode everything but RFC 3986 unreserved characters. No `url`
/// crate dependency for one query param.
fn percent_encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Split a close reason of the form `group.error[#ray_id]` into its group and
/// error segments (spec §6.4 / §4.1).
fn parse_close_reason(reason: &str) -> Option<(&str, &str)> {
    let (group, rest) = reason.split_once('.')?;
    let error = rest.split('[').next().unwrap_or(rest);
    Some((group, error))
}

/// Whether a close reason indicates the engine evicted this runner, which
/// skips reconnect/runner-lost handling and shuts the runner down immediately.
fn is_eviction_reason(reason: Option<&str>) -> bool {
    reason
        .and_then(parse_close_reason)
        .map(|(group, error)| group == "ws" && error == "eviction")
        .unwrap_or(false)
}

fn build_tls_config() -> rustls::ClientConfig {
    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Dedicated control-channel writer task (mirrors `tunnel::writer::spawn_writer`):
/// all outbound frames funnel through one task to avoid sink write contention.
fn spawn_writer<S>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) -> tokio::task::JoinHandle<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                WriterMsg::Frame(msg) => {
                    let data = match crate::protocol::encode_to_server(&msg) {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(error = %e, "failed to encode outbound control message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Binary(data.into())).await {
                        warn!(error = %e, "failed to write control frame");
                        break;
                    }
                }
                WriterMsg::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
        debug!("control channel writer task exiting");
        let _ = sink.close().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{GatewayId, RequestId};

    struct NoopHandler;

    #[async_trait::async_trait]
    impl RunnerHandler for NoopHandler {
        async fn fetch(
            &self,
            _runner: &Runner,
            _actor_id: &str,
            _key: &RequestKey,
            _request: crate::host::Request,
        ) -> anyhow::Result<crate::host::Response> {
            Ok(crate::host::Response::status(200, "ok"))
        }

        async fn websocket(
            &self,
            _runner: &Runner,
            _actor_id: &str,
            _ws: Arc<crate::ws_adapter::WebSocketAdapter>,
            _key: &RequestKey,
            _request: crate::host::Request,
            _is_hibernatable: bool,
            _is_restoring_hibernatable: bool,
            _events: mpsc::UnboundedReceiver<crate::ws_adapter::AdapterEvent>,
        ) {
        }

        async fn on_actor_start(
            &self,
            _runner: &Runner,
            _actor_id: &str,
            _generation: u32,
            _config: &ActorConfig,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn on_actor_stop(&self, _actor_id: &str, _generation: u32) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> RunnerConfig {
        RunnerConfig::builder()
            .endpoint("wss://example.invalid/runner")
            .name("test-runner")
            .namespace("default")
            .runner_key("runner-abc")
            .total_slots(4)
            .build()
            .unwrap()
    }

    #[test]
    fn new_runner_starts_unready_with_no_actors() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        assert!(!runner.is_ready());
        assert!(runner.all_actors().is_empty());
    }

    #[test]
    fn unrouted_request_key_has_no_actor() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        let key = RequestKey::new(GatewayId::new(vec![1]), RequestId::new(vec![2]));
        assert!(runner.lookup_actor_id(&key).is_none());
    }

    #[test]
    fn bind_and_unbind_request_routing() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        let key = RequestKey::new(GatewayId::new(vec![1]), RequestId::new(vec![2]));
        runner.bind_request(key.clone(), "actor-1".into());
        assert_eq!(runner.lookup_actor_id(&key), Some("actor-1".to_string()));
        runner.unbind_request(&key);
        assert!(runner.lookup_actor_id(&key).is_none());
    }

    #[tokio::test]
    async fn force_stop_actor_without_registration_errors() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        let err = runner.force_stop_actor("missing").await.unwrap_err();
        assert!(matches!(err, RunnerError::ActorNotFound(_)));
    }

    #[tokio::test]
    async fn runner_lost_timer_force_stops_all_actors_after_threshold() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        *runner.protocol_metadata.lock().unwrap() = Some(ProtocolMetadata {
            runner_lost_threshold: 10,
        });
        let actor = Arc::new(RunnerActor::new(
            "a1".into(),
            1,
            ActorConfig {
                name: "echo".into(),
                key: None,
                create_ts: 0,
                input: None,
            },
            Vec::new(),
        ));
        runner.actors.lock().unwrap().insert("a1".into(), actor);
        *runner.disconnected_since.lock().unwrap() =
            Some(std::time::Instant::now() - Duration::from_millis(50));

        runner.check_runner_lost().await;

        assert!(runner.all_actors().is_empty());
        assert!(runner.runner_lost_fired.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn runner_lost_timer_is_noop_before_threshold_elapses() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        *runner.protocol_metadata.lock().unwrap() = Some(ProtocolMetadata {
            runner_lost_threshold: 60_000,
        });
        let actor = Arc::new(RunnerActor::new(
            "a1".into(),
            1,
            ActorConfig {
                name: "echo".into(),
                key: None,
                create_ts: 0,
                input: None,
            },
            Vec::new(),
        ));
        runner.actors.lock().unwrap().insert("a1".into(), actor);
        *runner.disconnected_since.lock().unwrap() = Some(std::time::Instant::now());

        runner.check_runner_lost().await;

        assert_eq!(runner.all_actors().len(), 1);
    }

    #[tokio::test]
    async fn runner_id_change_force_stops_existing_actors() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        let actor = Arc::new(RunnerActor::new(
            "a1".into(),
            1,
            ActorConfig {
                name: "echo".into(),
                key: None,
                create_ts: 0,
                input: None,
            },
            Vec::new(),
        ));
        runner.actors.lock().unwrap().insert("a1".into(), actor);
        *runner.runner_id.lock().unwrap() = Some("old-runner".into());

        let frame = crate::protocol::encode_to_client(&ToClient::Init(crate::protocol::ToClientInit {
            runner_id: "new-runner".into(),
            metadata: ProtocolMetadata {
                runner_lost_threshold: 0,
            },
        }))
        .unwrap();
        runner.handle_frame(&frame).await;

        assert!(runner.all_actors().is_empty());
        assert_eq!(runner.runner_id(), Some("new-runner".to_string()));
    }

    #[tokio::test]
    async fn kv_request_with_no_connection_times_out() {
        // With no control channel connected, the request is buffered but
        // never answered; exercising the registration path does not require
        // waiting out the full timeout since we just check it's pending.
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        assert!(!runner.is_ready());
        let (id, _rx) = runner.kv.register("a1".into(), vec![1]);
        assert_eq!(runner.kv.unsent().len(), 1);
        runner.kv.resolve(id, Ok(vec![9]));
        assert!(runner.kv.is_empty());
    }

    #[test]
    fn percent_encode_component_leaves_unreserved_alone() {
        assert_eq!(percent_encode_component("runner-abc_1.2~3"), "runner-abc_1.2~3");
    }

    #[test]
    fn percent_encode_component_escapes_everything_else() {
        assert_eq!(percent_encode_component("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn build_connect_url_appends_query_params() {
        let url = build_connect_url(&test_config());
        assert_eq!(
            url,
            format!(
                "wss://example.invalid/runner?protocol_version={}&namespace=default&runner_key=runner-abc",
                crate::protocol::PROTOCOL_VERSION
            )
        );
    }

    #[test]
    fn build_connect_url_uses_ampersand_when_endpoint_has_query() {
        let mut config = test_config();
        config.endpoint = "wss://example.invalid/runner?foo=bar".into();
        let url = build_connect_url(&config);
        assert!(url.starts_with("wss://example.invalid/runner?foo=bar&protocol_version="));
    }

    #[test]
    fn parse_close_reason_splits_group_and_error() {
        assert_eq!(parse_close_reason("ws.eviction"), Some(("ws", "eviction")));
        assert_eq!(
            parse_close_reason("ws.eviction[#abc123]"),
            Some(("ws", "eviction"))
        );
        assert_eq!(parse_close_reason("no_dot_here"), None);
    }

    #[test]
    fn is_eviction_reason_matches_only_ws_eviction() {
        assert!(is_eviction_reason(Some("ws.eviction[#ray1]")));
        assert!(!is_eviction_reason(Some("ws.other_error")));
        assert!(!is_eviction_reason(Some("runner.eviction")));
        assert!(!is_eviction_reason(None));
    }

    #[tokio::test]
    async fn immediate_shutdown_skips_stopping_frame() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        let mut shutdown_rx = runner.shutdown_tx.subscribe();
        runner.shutdown(true).await;
        assert!(*shutdown_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn graceful_shutdown_drains_until_actors_empty() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        let actor = Arc::new(RunnerActor::new(
            "a1".into(),
            1,
            ActorConfig {
                name: "echo".into(),
                key: None,
                create_ts: 0,
                input: None,
            },
            Vec::new(),
        ));
        runner.actors.lock().unwrap().insert("a1".into(), actor);

        let runner_for_drain = Arc::clone(&runner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            runner_for_drain.actors.lock().unwrap().clear();
        });

        tokio::time::timeout(Duration::from_secs(1), runner.shutdown(false))
            .await
            .expect("graceful shutdown should return once actors drain");
    }

    #[test]
    fn start_actor_preregisters_hibernating_request_routing() {
        let runner = Runner::new(test_config(), Arc::new(NoopHandler));
        let key = RequestKey::new(GatewayId::new(vec![1]), RequestId::new(vec![2]));
        let checkpoint = ActorCheckpoint {
            actor_id: "a1".into(),
            generation: 1,
            index: 1,
        };
        let config = crate::protocol::ActorConfigWire {
            name: "echo".into(),
            key: None,
            create_ts: 0,
            input: None,
        };
        let hibernating = vec![crate::protocol::HibernatingRequestRef {
            gateway_id: vec![1],
            request_id: vec![2],
        }];

        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(runner.start_actor(checkpoint, config, hibernating));

        assert_eq!(runner.lookup_actor_id(&key), Some("a1".to_string()));
    }
}
