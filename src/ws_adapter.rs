//! Virtual WebSocket presented to user actor code.
//!
//! Bridges the tunnel's wire-level WebSocket events to a small callback
//! registry, the way `tunnel::heartbeat::HeartbeatHandle` in the teacher
//! bridges ack frames into an async task via a channel handle, generalized
//! here to a full open/message/close/error event surface.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wrapping::wrapping_le;

/// WebSocket ready states, mirroring the standard browser WebSocket enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// An outbound frame the adapter wants the tunnel to send on its behalf.
#[derive(Debug, Clone)]
pub enum OutboundAction {
    Send { data: Vec<u8>, binary: bool },
    Close {
        code: Option<u16>,
        reason: Option<String>,
        hibernate: bool,
    },
}

/// Inbound event delivered to user code.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Open,
    Message { data: Vec<u8>, binary: bool },
    Close { code: Option<u16>, reason: Option<String> },
}

struct Inner {
    state: ReadyState,
    server_message_index: u16,
    has_received_first: bool,
    is_hibernatable: bool,
}

/// A virtual WebSocket bound to one (gateway, request) pair.
///
/// `outbound_tx` carries actions the tunnel must translate into
/// `ToServerTunnelMessage` frames; `event_tx` carries events for the user's
/// registered listener (normally consumed by the host's `websocket` handler
/// task).
pub struct WebSocketAdapter {
    inner: Mutex<Inner>,
    outbound_tx: mpsc::UnboundedSender<OutboundAction>,
    event_tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl WebSocketAdapter {
    /// Construct a fresh adapter (not yet open — `open` event will be fired
    /// by `handle_open`).
    pub fn new_fresh(
        is_hibernatable: bool,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundAction>, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let adapter = Self {
            inner: Mutex::new(Inner {
                state: ReadyState::Connecting,
                server_message_index: 0,
                has_received_first: false,
                is_hibernatable,
            }),
            outbound_tx,
            event_tx,
        };
        (adapter, outbound_rx, event_rx)
    }

    /// Construct an adapter restoring a hibernating connection: already
    /// OPEN, no `open` event fired, resuming from a persisted message index.
    pub fn new_restoring(
        server_message_index: u16,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundAction>, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let adapter = Self {
            inner: Mutex::new(Inner {
                state: ReadyState::Open,
                server_message_index,
                has_received_first: true,
                is_hibernatable: true,
            }),
            outbound_tx,
            event_tx,
        };
        (adapter, outbound_rx, event_rx)
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.lock().unwrap().state
    }

    pub fn is_hibernatable(&self) -> bool {
        self.inner.lock().unwrap().is_hibernatable
    }

    /// Dispatch the `open` event (fresh connections only).
    pub fn handle_open(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ReadyState::Open;
        }
        let _ = self.event_tx.send(AdapterEvent::Open);
    }

    /// Send data to the remote peer.
    ///
    /// Errors are reported as a no-op on CLOSING/CLOSED (mirroring a real
    /// WebSocket) and a panic-free "InvalidStateError" style log on
    /// CONNECTING.
    pub fn send(&self, data: Vec<u8>, binary: bool, max_body_size: usize) {
        let state = self.inner.lock().unwrap().state;
        match state {
            ReadyState::Connecting => {
                warn!("send() called before websocket is open (InvalidStateError)");
            }
            ReadyState::Closing | ReadyState::Closed => {
                debug!("send() called on a closing/closed websocket, dropping");
            }
            ReadyState::Open => {
                if data.len() > max_body_size {
                    warn!(
                        size = data.len(),
                        max = max_body_size,
                        "outbound websocket message exceeds max body size, dropping"
                    );
                    return;
                }
                let _ = self.outbound_tx.send(OutboundAction::Send { data, binary });
            }
        }
    }

    /// Close the connection, emitting the tunnel close frame.
    pub fn close(&self, code: Option<u16>, reason: Option<String>) {
        self.close_inner(code, reason, true);
    }

    /// Close the connection without sending a tunnel frame (used when the
    /// engine is already known to have closed it).
    pub fn close_without_callback(&self, code: Option<u16>, reason: Option<String>) {
        self.close_inner(code, reason, false);
    }

    fn close_inner(&self, code: Option<u16>, reason: Option<String>, emit_frame: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state as u8 >= ReadyState::Closing as u8 {
                return;
            }
            inner.state = ReadyState::Closing;
        }

        if emit_frame {
            let hibernate = self.is_hibernatable();
            let _ = self.outbound_tx.send(OutboundAction::Close {
                code,
                reason: reason.clone(),
                hibernate,
            });
        }

        self.inner.lock().unwrap().state = ReadyState::Closed;
        let _ = self.event_tx.send(AdapterEvent::Close { code, reason });
    }

    /// Handle an inbound message from the engine, validating the wrapping
    /// sequence index before delivery (spec §4.4).
    ///
    /// Returns `Err` with the close reason if the index indicates a gap.
    pub fn handle_message(
        &self,
        data: Vec<u8>,
        binary: bool,
        index: u16,
    ) -> Result<(), &'static str> {
        let mut inner = self.inner.lock().unwrap();

        if inner.has_received_first {
            let last = inner.server_message_index;
            if wrapping_le(index, last) {
                debug!(index, last, "duplicate websocket message index, dropping");
                return Ok(());
            }
            let expected = last.wrapping_add(1);
            if index != expected {
                drop(inner);
                return Err("ws.message_index_skip");
            }
        }

        inner.server_message_index = index;
        inner.has_received_first = true;
        drop(inner);

        let _ = self.event_tx.send(AdapterEvent::Message { data, binary });
        Ok(())
    }

    /// Handle an inbound close from the engine.
    pub fn handle_close(&self, code: Option<u16>, reason: Option<String>) {
        self.inner.lock().unwrap().state = ReadyState::Closed;
        let _ = self.event_tx.send(AdapterEvent::Close { code, reason });
    }

    pub fn server_message_index(&self) -> u16 {
        self.inner.lock().unwrap().server_message_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_adapter_starts_connecting_then_opens() {
        let (adapter, _out_rx, mut ev_rx) = WebSocketAdapter::new_fresh(false);
        assert_eq!(adapter.ready_state(), ReadyState::Connecting);
        adapter.handle_open();
        assert_eq!(adapter.ready_state(), ReadyState::Open);
        assert!(matches!(ev_rx.try_recv(), Ok(AdapterEvent::Open)));
    }

    #[test]
    fn restoring_adapter_is_open_without_open_event() {
        let (adapter, _out_rx, mut ev_rx) = WebSocketAdapter::new_restoring(5);
        assert_eq!(adapter.ready_state(), ReadyState::Open);
        assert!(ev_rx.try_recv().is_err());
        assert_eq!(adapter.server_message_index(), 5);
    }

    #[test]
    fn send_before_open_is_rejected_silently() {
        let (adapter, mut out_rx, _ev_rx) = WebSocketAdapter::new_fresh(false);
        adapter.send(vec![1], false, 1024);
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn send_after_open_forwards_outbound_action() {
        let (adapter, mut out_rx, _ev_rx) = WebSocketAdapter::new_fresh(false);
        adapter.handle_open();
        adapter.send(vec![1, 2, 3], true, 1024);
        match out_rx.try_recv().unwrap() {
            OutboundAction::Send { data, binary } => {
                assert_eq!(data, vec![1, 2, 3]);
                assert!(binary);
            }
            _ => panic!("expected Send"),
        }
    }

    #[test]
    fn oversized_send_is_dropped() {
        let (adapter, mut out_rx, _ev_rx) = WebSocketAdapter::new_fresh(false);
        adapter.handle_open();
        adapter.send(vec![0u8; 10], false, 4);
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn in_order_messages_are_delivered() {
        let (adapter, _out_rx, mut ev_rx) = WebSocketAdapter::new_fresh(true);
        adapter.handle_open();
        ev_rx.try_recv().unwrap(); // drain Open
        assert!(adapter.handle_message(vec![1], false, 0).is_ok());
        assert!(adapter.handle_message(vec![2], false, 1).is_ok());
        assert!(matches!(ev_rx.try_recv(), Ok(AdapterEvent::Message { .. })));
        assert!(matches!(ev_rx.try_recv(), Ok(AdapterEvent::Message { .. })));
    }

    #[test]
    fn duplicate_index_is_dropped_not_delivered() {
        let (adapter, _out_rx, mut ev_rx) = WebSocketAdapter::new_fresh(true);
        adapter.handle_open();
        ev_rx.try_recv().unwrap();
        adapter.handle_message(vec![1], false, 0).unwrap();
        ev_rx.try_recv().unwrap();
        adapter.handle_message(vec![1], false, 0).unwrap();
        assert!(ev_rx.try_recv().is_err());
    }

    #[test]
    fn gap_in_index_is_rejected() {
        let (adapter, _out_rx, mut ev_rx) = WebSocketAdapter::new_fresh(true);
        adapter.handle_open();
        ev_rx.try_recv().unwrap();
        adapter.handle_message(vec![1], false, 0).unwrap();
        ev_rx.try_recv().unwrap();
        let err = adapter.handle_message(vec![2], false, 3).unwrap_err();
        assert_eq!(err, "ws.message_index_skip");
    }

    #[test]
    fn close_is_idempotent() {
        let (adapter, mut out_rx, mut ev_rx) = WebSocketAdapter::new_fresh(false);
        adapter.handle_open();
        ev_rx.try_recv().unwrap();
        adapter.close(Some(1000), Some("bye".into()));
        assert!(out_rx.try_recv().is_ok());
        assert!(matches!(ev_rx.try_recv(), Ok(AdapterEvent::Close { .. })));
        // second close: no further frame or event
        adapter.close(Some(1000), Some("bye".into()));
        assert!(out_rx.try_recv().is_err());
        assert!(ev_rx.try_recv().is_err());
    }

    #[test]
    fn close_without_callback_skips_outbound_frame() {
        let (adapter, mut out_rx, mut ev_rx) = WebSocketAdapter::new_fresh(false);
        adapter.handle_open();
        ev_rx.try_recv().unwrap();
        adapter.close_without_callback(Some(1000), Some("stale".into()));
        assert!(out_rx.try_recv().is_err());
        assert!(matches!(ev_rx.try_recv(), Ok(AdapterEvent::Close { .. })));
    }
}
