//! Shared ownership of a protocol handle between a Listener and its
//! Connections.
//!
//! A `SocketManager` is the only co-owned resource in the system: a
//! Listener and every Connection it accepts hold a strong reference to the
//! same manager, which anchors the underlying OS handle (the UDP socket, a
//! QUIC endpoint, ...). Back-references are weak and nullable, so the
//! Listener↔Manager↔Connection cycle never leaks. When the last strong
//! reference drops — listener stopped and every connection released — the
//! anchored handle is closed with it. A Connection never owns its handle
//! directly; all handle access goes through the manager's anchor.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::trace;
use uuid::Uuid;

use crate::connection::Connection;
use crate::listener::Listener;

pub struct SocketManager {
    protocol: &'static str,
    /// Keeps the shared protocol handle alive for the manager's lifetime.
    keepalive: RefCell<Option<Box<dyn Any>>>,
    listener: RefCell<Option<Weak<Listener>>>,
    connections: RefCell<Vec<(Uuid, Weak<Connection>)>>,
}

impl SocketManager {
    pub(crate) fn new(protocol: &'static str, keepalive: Box<dyn Any>) -> Rc<Self> {
        Rc::new(SocketManager {
            protocol,
            keepalive: RefCell::new(Some(keepalive)),
            listener: RefCell::new(None),
            connections: RefCell::new(Vec::new()),
        })
    }

    /// Name of the protocol whose handle this manager anchors.
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub(crate) fn set_listener(&self, listener: &Rc<Listener>) {
        *self.listener.borrow_mut() = Some(Rc::downgrade(listener));
    }

    /// Detach the listener back-reference when the listener stops. Live
    /// connections keep the manager (and the handle) alive on their own.
    pub(crate) fn clear_listener(&self) {
        self.listener.borrow_mut().take();
    }

    /// The owning listener, while it is still alive.
    pub fn listener(&self) -> Option<Rc<Listener>> {
        self.listener.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn attach_connection(&self, conn: &Rc<Connection>) {
        self.connections
            .borrow_mut()
            .push((conn.uuid_value(), Rc::downgrade(conn)));
    }

    pub(crate) fn detach_connection(&self, uuid: Uuid) {
        self.connections.borrow_mut().retain(|(id, _)| *id != uuid);
    }

    /// Number of connections still sharing this manager.
    pub fn live_connections(&self) -> usize {
        let mut connections = self.connections.borrow_mut();
        connections.retain(|(_, weak)| weak.strong_count() > 0);
        connections.len()
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        // Last strong reference is gone; release the anchored handle.
        self.keepalive.borrow_mut().take();
        trace!("released {} socket manager", self.protocol);
    }
}
