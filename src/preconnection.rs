//! Preconnection: the pre-establishment bundle.
//!
//! A short-lived builder aggregating endpoints, transport properties and
//! security parameters. Everything passed in is copied, so callers keep
//! ownership of (and may immediately reuse) their inputs. A Preconnection
//! is activated by [`initiate`](Preconnection::initiate) on the client path
//! or [`listen`](Preconnection::listen) on the server path; it can be
//! reused for several activations.

use std::rc::Rc;
use std::time::Duration;

use crate::connection::{Connection, ConnectionCallbacks};
use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::error::{Result, TapsError};
use crate::listener::{Listener, ListenerCallbacks};
use crate::properties::TransportProperties;
use crate::racing;
use crate::runtime;
use crate::security::SecurityParameters;

#[derive(Debug, Clone)]
pub struct Preconnection {
    remote_endpoints: Vec<RemoteEndpoint>,
    local_endpoint: Option<LocalEndpoint>,
    transport_properties: TransportProperties,
    security_parameters: SecurityParameters,
}

impl Preconnection {
    /// Bundle remote endpoints with transport properties. Inputs are
    /// copied.
    pub fn new(remotes: &[RemoteEndpoint], transport_properties: &TransportProperties) -> Self {
        Preconnection {
            remote_endpoints: remotes.to_vec(),
            local_endpoint: None,
            transport_properties: transport_properties.clone(),
            security_parameters: SecurityParameters::build(),
        }
    }

    pub fn with_security(mut self, security_parameters: &SecurityParameters) -> Self {
        self.security_parameters = security_parameters.clone();
        self
    }

    pub fn with_local(mut self, local_endpoint: &LocalEndpoint) -> Self {
        self.local_endpoint = Some(local_endpoint.clone());
        self
    }

    pub fn remote_endpoints(&self) -> &[RemoteEndpoint] {
        &self.remote_endpoints
    }

    pub fn local_endpoint(&self) -> Option<&LocalEndpoint> {
        self.local_endpoint.as_ref()
    }

    pub fn transport_properties(&self) -> &TransportProperties {
        &self.transport_properties
    }

    pub fn security_parameters(&self) -> &SecurityParameters {
        &self.security_parameters
    }

    /// Active open: gather candidate stacks and race them. Fails
    /// synchronously with `NoCandidate` when no adapter satisfies the
    /// selection properties; every later outcome arrives on the callbacks.
    pub fn initiate(&self, callbacks: ConnectionCallbacks) -> Result<Rc<Connection>> {
        racing::initiate(self, callbacks, None)
    }

    /// Active open bounded by a deadline; expiry aborts every outstanding
    /// candidate and reports `Timeout` through `establishment_error`.
    pub fn initiate_with_timeout(
        &self,
        callbacks: ConnectionCallbacks,
        timeout: Duration,
    ) -> Result<Rc<Connection>> {
        racing::initiate(self, callbacks, Some(timeout))
    }

    /// Passive open: bind the single highest-ranked eligible adapter on
    /// the local endpoint and deliver accepted connections through the
    /// listener callbacks.
    pub fn listen(&self, callbacks: ListenerCallbacks) -> Result<Rc<Listener>> {
        runtime::ensure_initialized()?;
        let adapters = runtime::adapters()?;
        let ranked = racing::rank_eligible(self.transport_properties.selection(), &adapters);
        let adapter = ranked.first().copied().ok_or(TapsError::NoCandidate)?;

        let listener = Listener::new(
            adapter,
            self.local_endpoint.clone().unwrap_or_default(),
            self.transport_properties.clone(),
            self.security_parameters.clone(),
            callbacks,
        );
        Listener::start(&listener);
        Ok(listener)
    }
}
