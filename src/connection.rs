//! # Connection State Machine and Message I/O Path
//!
//! A [`Connection`] is the uniform surface over whichever protocol stack
//! won establishment. It owns the per-connection state machine
//! (`Establishing → Ready → Closing → Closed`, with `Errored` for failed
//! establishment), the ordered send queue, the receive path with optional
//! length-prefixed framing, and the registered callback set through which
//! every asynchronous outcome is delivered.
//!
//! ## Ordering guarantees
//!
//! - `ready` fires before any receive delivery on the same connection.
//! - `sent` completions are delivered in send order (one dispatch task per
//!   connection drains the FIFO).
//! - `closed` (or `aborted`) is terminal; nothing follows it.
//!
//! ## Cancellation
//!
//! `close` and `abort` cancel in-flight sends, pending receives and — when
//! still establishing — the candidate race. Cancelled operations never
//! invoke their completion callbacks; only the lifecycle callback fires.
//! Cancellation is a flag checked at every task iteration, which is all the
//! single-threaded reactor requires.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::defaults;
use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::error::{Result, TapsError};
use crate::framing::{encode_frame, FrameAssembler};
use crate::listener::Listener;
use crate::message::{Message, MessageContext};
use crate::properties::{ConnectionState, Preference, SelectionProperty, TransportProperties};
use crate::protocol::{Delivery, EstablishedTransport, ProtocolCapabilities, ProtocolSocket};
use crate::runtime;
use crate::security::SecurityParameters;
use crate::socket_manager::SocketManager;

/// Lifecycle callback: receives the connection it fired on.
pub type ConnectionHandler = Box<dyn FnMut(&Rc<Connection>)>;
/// Error callback: receives the connection and the failure.
pub type ConnectionErrorHandler = Box<dyn FnMut(&Rc<Connection>, &TapsError)>;

/// The registered callback set of a connection. Each slot is optional;
/// unregistered events are logged and dropped. Contexts travel as closure
/// captures: one context per registration, delivered unchanged on every
/// invocation.
#[derive(Default)]
pub struct ConnectionCallbacks {
    pub ready: Option<ConnectionHandler>,
    pub establishment_error: Option<ConnectionErrorHandler>,
    pub sent: Option<ConnectionHandler>,
    pub send_error: Option<ConnectionErrorHandler>,
    pub expired: Option<ConnectionHandler>,
    pub connection_error: Option<ConnectionErrorHandler>,
    pub soft_error: Option<ConnectionErrorHandler>,
    pub path_change: Option<ConnectionHandler>,
    pub closed: Option<ConnectionHandler>,
    pub aborted: Option<ConnectionHandler>,
}

/// One receive registration: delivers exactly one message.
pub struct ReceiveCallbacks {
    pub received: Box<dyn FnMut(&Rc<Connection>, Message, MessageContext)>,
    pub receive_error: Option<ConnectionErrorHandler>,
}

struct QueuedSend {
    payload: Vec<u8>,
    ctx: MessageContext,
    enqueued: Instant,
    is_final: bool,
}

/// Generate a lifecycle-event dispatcher: take the slot, invoke it, put it
/// back unless the callback re-registered meanwhile.
macro_rules! dispatch_event {
    ($name:ident, $slot:ident) => {
        fn $name(self: &Rc<Self>) {
            let callback = self.callbacks.borrow_mut().$slot.take();
            if let Some(mut callback) = callback {
                trace!("{} fired on {}", stringify!($slot), self.uuid());
                callback(self);
                let mut callbacks = self.callbacks.borrow_mut();
                if callbacks.$slot.is_none() {
                    callbacks.$slot = Some(callback);
                }
            } else {
                trace!("{} on {} had no registered callback", stringify!($slot), self.uuid());
            }
        }
    };
}

macro_rules! dispatch_error_event {
    ($name:ident, $slot:ident) => {
        fn $name(self: &Rc<Self>, error: &TapsError) {
            let callback = self.callbacks.borrow_mut().$slot.take();
            if let Some(mut callback) = callback {
                trace!("{} fired on {}: {}", stringify!($slot), self.uuid(), error);
                callback(self, error);
                let mut callbacks = self.callbacks.borrow_mut();
                if callbacks.$slot.is_none() {
                    callbacks.$slot = Some(callback);
                }
            } else {
                debug!(
                    "{} on {} had no registered callback: {}",
                    stringify!($slot),
                    self.uuid(),
                    error
                );
            }
        }
    };
}

pub struct Connection {
    uuid: Uuid,
    transport_properties: RefCell<TransportProperties>,
    security_parameters: SecurityParameters,
    remote_endpoint: RefCell<Option<RemoteEndpoint>>,
    local_endpoint: RefCell<Option<LocalEndpoint>>,
    callbacks: RefCell<ConnectionCallbacks>,
    socket: RefCell<Option<Rc<dyn ProtocolSocket>>>,
    socket_manager: RefCell<Option<Rc<SocketManager>>>,
    send_tx: RefCell<Option<mpsc::UnboundedSender<QueuedSend>>>,
    send_rx: RefCell<Option<mpsc::UnboundedReceiver<QueuedSend>>>,
    pending_receives: RefCell<VecDeque<ReceiveCallbacks>>,
    buffered_messages: RefCell<VecDeque<(Message, MessageContext)>>,
    explicit_framing: Cell<bool>,
    cancelled: Cell<bool>,
    race_task: RefCell<Option<JoinHandle<()>>>,
    send_task: RefCell<Option<JoinHandle<()>>>,
    recv_task: RefCell<Option<JoinHandle<()>>>,
}

impl Connection {
    fn build(
        transport_properties: TransportProperties,
        security_parameters: SecurityParameters,
        callbacks: ConnectionCallbacks,
    ) -> Rc<Connection> {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        Rc::new(Connection {
            uuid: Uuid::new_v4(),
            transport_properties: RefCell::new(transport_properties),
            security_parameters,
            remote_endpoint: RefCell::new(None),
            local_endpoint: RefCell::new(None),
            callbacks: RefCell::new(callbacks),
            socket: RefCell::new(None),
            socket_manager: RefCell::new(None),
            send_tx: RefCell::new(Some(send_tx)),
            send_rx: RefCell::new(Some(send_rx)),
            pending_receives: RefCell::new(VecDeque::new()),
            buffered_messages: RefCell::new(VecDeque::new()),
            explicit_framing: Cell::new(false),
            cancelled: Cell::new(false),
            race_task: RefCell::new(None),
            send_task: RefCell::new(None),
            recv_task: RefCell::new(None),
        })
    }

    /// Client-path constructor: the connection starts establishing and is
    /// attached to the race winner by the establishment engine.
    pub(crate) fn new_outbound(
        transport_properties: &TransportProperties,
        security_parameters: &SecurityParameters,
        callbacks: ConnectionCallbacks,
    ) -> Rc<Connection> {
        let conn = Self::build(
            transport_properties.clone(),
            security_parameters.clone(),
            callbacks,
        );
        runtime::register_connection(&conn);
        conn
    }

    /// Accept-path constructor: born ready, sharing the listener's socket
    /// manager, with transport properties inherited (copied) from the
    /// listener at accept time.
    pub(crate) fn accept_multiplexed(
        listener: &Rc<Listener>,
        socket: Rc<dyn ProtocolSocket>,
        manager: &Rc<SocketManager>,
        remote: RemoteEndpoint,
        local: LocalEndpoint,
    ) -> Rc<Connection> {
        let mut properties = listener.transport_properties();
        properties.set_connection_state(ConnectionState::Ready);

        let conn = Self::build(
            properties,
            listener.security_parameters().clone(),
            ConnectionCallbacks::default(),
        );
        *conn.remote_endpoint.borrow_mut() = Some(remote);
        *conn.local_endpoint.borrow_mut() = Some(local);
        conn.explicit_framing
            .set(conn.requires_framing(listener.protocol_capabilities()));
        *conn.socket.borrow_mut() = Some(socket);
        manager.attach_connection(&conn);
        *conn.socket_manager.borrow_mut() = Some(Rc::clone(manager));

        runtime::register_connection(&conn);
        conn.start_io();
        conn
    }

    fn requires_framing(&self, capabilities: &'static ProtocolCapabilities) -> bool {
        !capabilities.message_oriented
            && self
                .transport_properties
                .borrow()
                .selection()
                .preference(SelectionProperty::PreserveMsgBoundaries)
                == Preference::Require
    }

    /// Attach the race winner and go ready. Called once by the
    /// establishment engine on the reactor.
    pub(crate) fn attach_transport(
        self: &Rc<Self>,
        transport: EstablishedTransport,
        remote: RemoteEndpoint,
        capabilities: &'static ProtocolCapabilities,
    ) {
        debug!("{} established over {}", self.uuid(), capabilities.name);
        *self.remote_endpoint.borrow_mut() = Some(remote);
        if let Some(addr) = transport.socket.local_addr() {
            *self.local_endpoint.borrow_mut() = Some(LocalEndpoint::from_socket_addr(addr));
        }
        self.explicit_framing.set(self.requires_framing(capabilities));
        *self.socket.borrow_mut() = Some(transport.socket);
        transport.manager.attach_connection(self);
        *self.socket_manager.borrow_mut() = Some(transport.manager);

        self.set_state(ConnectionState::Ready);
        // ready precedes any receive delivery: the loops start after it.
        self.dispatch_ready();
        self.start_io();
    }

    /// Establishment ended without a winner.
    pub(crate) fn establishment_failed(self: &Rc<Self>, error: TapsError) {
        if self.cancelled.get() {
            return;
        }
        self.teardown(ConnectionState::Errored);
        self.dispatch_establishment_error(&error);
    }

    pub(crate) fn set_race_task(&self, task: JoinHandle<()>) {
        *self.race_task.borrow_mut() = Some(task);
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    fn start_io(self: &Rc<Self>) {
        let receiver = self
            .send_rx
            .borrow_mut()
            .take()
            .expect("send queue started twice");
        *self.send_task.borrow_mut() = Some(runtime::spawn(send_loop(Rc::clone(self), receiver)));
        *self.recv_task.borrow_mut() = Some(runtime::spawn(receive_loop(Rc::clone(self))));
    }

    // --- public surface -------------------------------------------------

    /// Stable RFC 4122 identifier in hyphenated form.
    pub fn uuid(&self) -> String {
        self.uuid.hyphenated().to_string()
    }

    pub(crate) fn uuid_value(&self) -> Uuid {
        self.uuid
    }

    pub fn state(&self) -> ConnectionState {
        self.transport_properties.borrow().connection_state()
    }

    /// Copy of the connection's effective transport properties.
    pub fn transport_properties(&self) -> TransportProperties {
        self.transport_properties.borrow().clone()
    }

    pub fn security_parameters(&self) -> &SecurityParameters {
        &self.security_parameters
    }

    pub fn remote_endpoint(&self) -> Option<RemoteEndpoint> {
        self.remote_endpoint.borrow().clone()
    }

    pub fn local_endpoint(&self) -> Option<LocalEndpoint> {
        self.local_endpoint.borrow().clone()
    }

    pub fn socket_manager(&self) -> Option<Rc<SocketManager>> {
        self.socket_manager.borrow().clone()
    }

    /// Replace the registered callback set (used on accepted connections,
    /// which are created with an empty set).
    pub fn set_callbacks(&self, callbacks: ConnectionCallbacks) {
        *self.callbacks.borrow_mut() = callbacks;
    }

    /// Queue a message with default per-send properties.
    pub fn send_message(self: &Rc<Self>, message: Message) -> Result<()> {
        self.send_message_with_context(message, MessageContext::new())
    }

    /// Queue a message for ordered dispatch. Returns immediately; the
    /// outcome arrives on `sent`, `expired` or `send_error`.
    pub fn send_message_with_context(
        self: &Rc<Self>,
        message: Message,
        ctx: MessageContext,
    ) -> Result<()> {
        match self.state() {
            ConnectionState::Establishing | ConnectionState::Ready => {}
            _ => return Err(TapsError::ConnectionClosed),
        }
        let queued = QueuedSend {
            payload: message.into_bytes(),
            is_final: ctx.message_properties.is_final(),
            ctx,
            enqueued: Instant::now(),
        };
        self.send_tx
            .borrow()
            .as_ref()
            .ok_or(TapsError::ConnectionClosed)?
            .send(queued)
            .map_err(|_| TapsError::ConnectionClosed)?;
        Ok(())
    }

    /// Register one receive: the callback is invoked with the next message
    /// (immediately, if one is already buffered).
    pub fn receive_message(self: &Rc<Self>, callbacks: ReceiveCallbacks) -> Result<()> {
        match self.state() {
            ConnectionState::Establishing | ConnectionState::Ready => {}
            _ => return Err(TapsError::ConnectionClosed),
        }
        let buffered = self.buffered_messages.borrow_mut().pop_front();
        match buffered {
            Some((message, ctx)) => {
                let mut callbacks = callbacks;
                (callbacks.received)(self, message, ctx);
            }
            None => self.pending_receives.borrow_mut().push_back(callbacks),
        }
        Ok(())
    }

    /// Graceful close: flush queued sends, signal end of data, then fire
    /// `closed`. Safe in every state; repeated calls are no-ops.
    pub fn close(self: &Rc<Self>) {
        match self.state() {
            ConnectionState::Establishing => {
                debug!("{} closed during establishment", self.uuid());
                self.teardown(ConnectionState::Closed);
                self.dispatch_closed();
            }
            ConnectionState::Ready => {
                debug!("closing {}", self.uuid());
                self.set_state(ConnectionState::Closing);
                // Dropping the queue sender lets the send loop drain the
                // remaining messages and exit.
                let sender = self.send_tx.borrow_mut().take();
                drop(sender);

                let conn = Rc::clone(self);
                runtime::spawn(async move {
                    let send_task = conn.send_task.borrow_mut().take();
                    if let Some(task) = send_task {
                        let _ = task.await;
                    }
                    let socket = conn.socket.borrow().clone();
                    if let Some(socket) = socket {
                        if let Err(e) = socket.close().await {
                            debug!("graceful close of {} reported: {}", conn.uuid(), e);
                        }
                    }
                    // An abort may have raced us while flushing.
                    if conn.state() == ConnectionState::Closing {
                        conn.teardown(ConnectionState::Closed);
                        conn.dispatch_closed();
                    }
                });
            }
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Errored => {
                trace!("close on {} ignored in state {:?}", self.uuid(), self.state());
            }
        }
    }

    /// Immediate termination: cancel everything in flight, tear the
    /// transport down, fire `aborted`.
    pub fn abort(self: &Rc<Self>) {
        match self.state() {
            ConnectionState::Closed | ConnectionState::Errored => return,
            _ => {}
        }
        debug!("aborting {}", self.uuid());
        let socket = self.socket.borrow().clone();
        if let Some(socket) = socket {
            socket.abort();
        }
        self.teardown(ConnectionState::Closed);
        self.dispatch_aborted();
    }

    // --- internal machinery ---------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        trace!("{} -> {:?}", self.uuid(), state);
        self.transport_properties
            .borrow_mut()
            .set_connection_state(state);
    }

    /// Cancel every task and drop the transport references. Cancelled
    /// operations do not see their completion callbacks.
    fn teardown(&self, final_state: ConnectionState) {
        self.cancelled.set(true);
        self.send_tx.borrow_mut().take();
        self.send_rx.borrow_mut().take();
        for task in [
            self.race_task.borrow_mut().take(),
            self.send_task.borrow_mut().take(),
            self.recv_task.borrow_mut().take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.pending_receives.borrow_mut().clear();
        if let Some(manager) = self.socket_manager.borrow_mut().take() {
            manager.detach_connection(self.uuid);
        }
        self.socket.borrow_mut().take();
        self.set_state(final_state);
    }

    /// Peer signalled an orderly end of the connection.
    fn handle_peer_close(self: &Rc<Self>) {
        debug!("{} closed by peer", self.uuid());
        self.teardown(ConnectionState::Closed);
        self.dispatch_closed();
    }

    /// Peer reset or fatal transport error.
    fn handle_connection_error(self: &Rc<Self>, error: TapsError) {
        warn!("{} failed: {}", self.uuid(), error);
        // Outstanding receive registrations learn about the failure before
        // the lifecycle transition discards them.
        let pending: Vec<ReceiveCallbacks> =
            self.pending_receives.borrow_mut().drain(..).collect();
        for mut request in pending {
            if let Some(ref mut receive_error) = request.receive_error {
                receive_error(self, &error);
            }
        }
        self.teardown(ConnectionState::Closed);
        self.dispatch_connection_error(&error);
    }

    /// A send failed fatally: the connection transitions to CLOSED after
    /// `send_error`.
    fn handle_fatal_send_error(self: &Rc<Self>, error: TapsError) {
        warn!("fatal send failure on {}: {}", self.uuid(), error);
        self.dispatch_send_error(&error);
        let socket = self.socket.borrow().clone();
        if let Some(socket) = socket {
            socket.abort();
        }
        self.teardown(ConnectionState::Closed);
    }

    fn deliver_message(self: &Rc<Self>, message: Message) {
        let ctx = MessageContext {
            message_properties: Default::default(),
            local_endpoint: self.local_endpoint.borrow().clone(),
            remote_endpoint: self.remote_endpoint.borrow().clone(),
        };
        let request = self.pending_receives.borrow_mut().pop_front();
        match request {
            Some(mut request) => (request.received)(self, message, ctx),
            None => {
                trace!("buffering message on {} until a receive is registered", self.uuid());
                self.buffered_messages.borrow_mut().push_back((message, ctx));
            }
        }
    }

    dispatch_event!(dispatch_ready, ready);
    dispatch_event!(dispatch_sent, sent);
    dispatch_event!(dispatch_expired, expired);
    dispatch_event!(dispatch_closed, closed);
    dispatch_event!(dispatch_aborted, aborted);
    dispatch_error_event!(dispatch_establishment_error, establishment_error);
    dispatch_error_event!(dispatch_send_error, send_error);
    dispatch_error_event!(dispatch_connection_error, connection_error);
    dispatch_error_event!(dispatch_soft_error, soft_error);
}

/// Drain the per-connection FIFO: frame, dispatch, honor lifetimes, and
/// report completions in order.
async fn send_loop(conn: Rc<Connection>, mut queue: mpsc::UnboundedReceiver<QueuedSend>) {
    while let Some(item) = queue.recv().await {
        if conn.cancelled() {
            break;
        }

        let lifetime = item.ctx.message_properties.lifetime();
        if lifetime != defaults::MSG_LIFETIME_INFINITE {
            let deadline = item.enqueued + Duration::from_millis(lifetime);
            if Instant::now() > deadline {
                debug!("message expired before dispatch on {}", conn.uuid());
                conn.dispatch_expired_or_send_error();
                continue;
            }
        }

        let socket = conn.socket.borrow().clone();
        let Some(socket) = socket else {
            break;
        };
        let payload = if conn.explicit_framing.get() {
            encode_frame(&item.payload)
        } else {
            item.payload
        };

        match socket.send(&payload, &item.ctx).await {
            Ok(()) => {
                if conn.cancelled() {
                    break;
                }
                conn.dispatch_sent();
                if item.is_final {
                    debug!("final message sent on {}, closing", conn.uuid());
                    conn.close();
                }
            }
            Err(error) => {
                if !conn.cancelled() {
                    conn.handle_fatal_send_error(error);
                }
                break;
            }
        }
    }
    trace!("send queue drained for {}", conn.uuid());
}

impl Connection {
    /// Lifetime expiry prefers the dedicated `expired` callback and falls
    /// back to `send_error` when none is registered.
    fn dispatch_expired_or_send_error(self: &Rc<Self>) {
        let has_expired_callback = self.callbacks.borrow().expired.is_some();
        if has_expired_callback {
            self.dispatch_expired();
        } else {
            self.dispatch_send_error(&TapsError::SendExpired);
        }
    }
}

/// Drive the adapter's receive side: frame chunks into messages when
/// required, deliver to pending receive registrations, and translate
/// terminal deliveries into lifecycle transitions.
async fn receive_loop(conn: Rc<Connection>) {
    let mut assembler = FrameAssembler::new();
    loop {
        if conn.cancelled() {
            break;
        }
        let socket = conn.socket.borrow().clone();
        let Some(socket) = socket else {
            break;
        };

        match socket.receive().await {
            Ok(Delivery::Message(bytes)) => conn.deliver_message(Message::new(bytes)),
            Ok(Delivery::Chunk(bytes)) => {
                if conn.explicit_framing.get() {
                    assembler.push(&bytes);
                    while let Some(frame) = assembler.next_frame() {
                        conn.deliver_message(Message::new(frame));
                    }
                } else {
                    // Boundaries are undefined: deliver the chunk as-is.
                    conn.deliver_message(Message::new(bytes));
                }
            }
            Ok(Delivery::Eof) => {
                if !conn.cancelled() {
                    conn.handle_peer_close();
                }
                break;
            }
            Err(error) => {
                if conn.cancelled() {
                    break;
                }
                if is_soft_error(&error) {
                    conn.dispatch_soft_error(&error);
                    continue;
                }
                conn.handle_connection_error(error);
                break;
            }
        }
    }
}

/// Transient routing conditions are informational; they never close the
/// connection.
fn is_soft_error(error: &TapsError) -> bool {
    match error {
        TapsError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::HostUnreachable
                | std::io::ErrorKind::NetworkUnreachable
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::TransportProperties;
    use crate::security::SecurityParameters;

    fn test_connection() -> Rc<Connection> {
        Connection::new_outbound(
            &TransportProperties::build(),
            &SecurityParameters::build(),
            ConnectionCallbacks::default(),
        )
    }

    #[test]
    fn uuid_is_rfc_4122_hyphenated() {
        let conn = test_connection();
        let uuid = conn.uuid();

        assert_eq!(uuid.len(), 36);
        for (index, character) in uuid.chars().enumerate() {
            match index {
                8 | 13 | 18 | 23 => assert_eq!(character, '-', "position {index}"),
                _ => assert!(
                    character.is_ascii_hexdigit(),
                    "position {index} in {uuid}"
                ),
            }
        }
    }

    #[test]
    fn uuids_are_unique_per_connection() {
        let first = test_connection();
        let second = test_connection();
        assert_ne!(first.uuid(), second.uuid());
    }

    #[test]
    fn new_connection_is_establishing() {
        let conn = test_connection();
        assert_eq!(conn.state(), ConnectionState::Establishing);
        assert!(conn.remote_endpoint().is_none());
    }

    #[test]
    fn properties_accessor_returns_a_copy() {
        let conn = test_connection();
        let mut copy = conn.transport_properties();
        copy.set_selection_preference(SelectionProperty::Reliability, Preference::Prohibit);

        assert_eq!(
            conn.transport_properties()
                .selection()
                .preference(SelectionProperty::Reliability),
            Preference::NoPreference
        );
    }

    #[test]
    fn send_on_closed_connection_is_rejected() {
        let conn = test_connection();
        conn.teardown(ConnectionState::Closed);

        let result = conn.send_message(Message::new(b"x".to_vec()));
        assert!(matches!(result, Err(TapsError::ConnectionClosed)));

        let result = conn.receive_message(ReceiveCallbacks {
            received: Box::new(|_, _, _| {}),
            receive_error: None,
        });
        assert!(matches!(result, Err(TapsError::ConnectionClosed)));
    }
}
