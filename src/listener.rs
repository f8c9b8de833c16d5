//! Listener: passive establishment and connection multiplexing.
//!
//! `listen` picks the single highest-ranked eligible protocol adapter (no
//! racing on the passive path), resolves the local endpoint, binds, and
//! accepts. Every inbound association — a TCP stream, a distinct UDP peer
//! address, a QUIC stream — becomes its own [`Connection`] sharing the
//! listener's [`SocketManager`] and inheriting a copy of the listener's
//! transport properties at accept time.
//!
//! Stopping the listener drops its socket-manager reference and stops
//! accepting, but never force-closes connections that were already
//! delivered; the shared handle lives until the last of them is released.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::connection::Connection;
use crate::endpoint::LocalEndpoint;
use crate::error::TapsError;
use crate::properties::TransportProperties;
use crate::protocol::{ProtocolAdapter, ProtocolCapabilities};
use crate::runtime;
use crate::security::SecurityParameters;
use crate::socket_manager::SocketManager;

pub type ListenerHandler = Box<dyn FnMut(&Rc<Listener>)>;
pub type ListenerErrorHandler = Box<dyn FnMut(&Rc<Listener>, &TapsError)>;
pub type ConnectionReceivedHandler = Box<dyn FnMut(&Rc<Listener>, Rc<Connection>)>;

/// The registered callback set of a listener.
#[derive(Default)]
pub struct ListenerCallbacks {
    pub connection_received: Option<ConnectionReceivedHandler>,
    pub establishment_error: Option<ListenerErrorHandler>,
    pub stopped: Option<ListenerHandler>,
}

pub struct Listener {
    adapter: &'static dyn ProtocolAdapter,
    transport_properties: TransportProperties,
    security_parameters: SecurityParameters,
    local_endpoint_template: LocalEndpoint,
    resolved_local: RefCell<Option<LocalEndpoint>>,
    callbacks: RefCell<ListenerCallbacks>,
    manager: RefCell<Option<Rc<SocketManager>>>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
    stopped: Cell<bool>,
}

impl Listener {
    pub(crate) fn new(
        adapter: &'static dyn ProtocolAdapter,
        local_endpoint: LocalEndpoint,
        transport_properties: TransportProperties,
        security_parameters: SecurityParameters,
        callbacks: ListenerCallbacks,
    ) -> Rc<Listener> {
        Rc::new(Listener {
            adapter,
            transport_properties,
            security_parameters,
            local_endpoint_template: local_endpoint,
            resolved_local: RefCell::new(None),
            callbacks: RefCell::new(callbacks),
            manager: RefCell::new(None),
            accept_task: RefCell::new(None),
            stopped: Cell::new(false),
        })
    }

    /// Resolve, bind and start accepting; bind failures surface through
    /// the listener's `establishment_error` callback.
    pub(crate) fn start(listener: &Rc<Listener>) {
        let this = Rc::clone(listener);
        runtime::spawn(async move {
            let outcome = async {
                let resolved = this.local_endpoint_template.resolve().await?;
                let local = resolved
                    .into_iter()
                    .next()
                    .ok_or(TapsError::InvalidArgument("no usable local endpoint"))?;
                this.adapter.listen(&local, &this).await
            }
            .await;

            match outcome {
                Ok(transport) => {
                    debug!(
                        "listener bound on {} over {}",
                        transport.local_addr,
                        this.protocol_capabilities().name
                    );
                    *this.resolved_local.borrow_mut() =
                        Some(LocalEndpoint::from_socket_addr(transport.local_addr));
                    transport.manager.set_listener(&this);
                    *this.manager.borrow_mut() = Some(transport.manager);
                    *this.accept_task.borrow_mut() = Some(transport.accept_task);
                    // A stop that raced the bind wins.
                    if this.stopped.get() {
                        this.release_transport();
                    }
                }
                Err(e) => {
                    error!("listener establishment failed: {}", e);
                    this.dispatch_establishment_error(&e);
                }
            }
        });
    }

    /// The adapter chosen for this listener.
    pub(crate) fn protocol_capabilities(&self) -> &'static ProtocolCapabilities {
        self.adapter.capabilities()
    }

    /// Copy of the property template accepted connections inherit.
    pub fn transport_properties(&self) -> TransportProperties {
        self.transport_properties.clone()
    }

    pub(crate) fn security_parameters(&self) -> &SecurityParameters {
        &self.security_parameters
    }

    /// The bound local endpoint, once the bind completed.
    pub fn local_endpoint(&self) -> Option<LocalEndpoint> {
        self.resolved_local.borrow().clone()
    }

    pub fn socket_manager(&self) -> Option<Rc<SocketManager>> {
        self.manager.borrow().clone()
    }

    /// Stop accepting and release the listener's share of the socket
    /// manager. Idempotent. Live connections are unaffected.
    pub fn stop(self: &Rc<Self>) {
        if self.stopped.replace(true) {
            trace!("listener stop ignored; already stopped");
            return;
        }
        debug!("stopping listener");
        self.release_transport();
        self.dispatch_stopped();
    }

    fn release_transport(&self) {
        if let Some(task) = self.accept_task.borrow_mut().take() {
            task.abort();
        }
        if let Some(manager) = self.manager.borrow_mut().take() {
            manager.clear_listener();
        }
    }

    /// Hand a freshly-accepted connection to the application.
    pub(crate) fn deliver_connection(self: &Rc<Self>, conn: Rc<Connection>) {
        if self.stopped.get() {
            debug!("dropping accepted connection; listener already stopped");
            conn.abort();
            return;
        }
        let callback = self.callbacks.borrow_mut().connection_received.take();
        match callback {
            Some(mut callback) => {
                trace!("connection_received fired for {}", conn.uuid());
                callback(self, conn);
                let mut callbacks = self.callbacks.borrow_mut();
                if callbacks.connection_received.is_none() {
                    callbacks.connection_received = Some(callback);
                }
            }
            None => {
                warn!("accepted a connection but no connection_received callback is registered")
            }
        }
    }

    pub(crate) fn dispatch_establishment_error(self: &Rc<Self>, error: &TapsError) {
        let callback = self.callbacks.borrow_mut().establishment_error.take();
        match callback {
            Some(mut callback) => {
                callback(self, error);
                let mut callbacks = self.callbacks.borrow_mut();
                if callbacks.establishment_error.is_none() {
                    callbacks.establishment_error = Some(callback);
                }
            }
            None => debug!("listener establishment error without callback: {}", error),
        }
    }

    fn dispatch_stopped(self: &Rc<Self>) {
        let callback = self.callbacks.borrow_mut().stopped.take();
        if let Some(mut callback) = callback {
            callback(self);
            let mut callbacks = self.callbacks.borrow_mut();
            if callbacks.stopped.is_none() {
                callbacks.stopped = Some(callback);
            }
        }
    }
}
