use super::{SipAddr, SipConnection, TransportLayer, TransportStatus};
use crate::{config::AddressChangePolicy, rsip_ext::RsipResponseExt, Error, Result};
use parking_lot::Mutex;
use rsip::{transport::Transport, SipMessage};
use std::{net::SocketAddr, time::Duration};
use tracing::{debug, info, warn};

/// Transport parameters a signaling leg asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingParams {
    pub protocol: Transport,
    pub local: Option<SocketAddr>,
    pub remote: Option<SipAddr>,
    pub transport_id: Option<String>,
    pub tls_context: Option<String>,
}

impl Default for BindingParams {
    fn default() -> Self {
        Self {
            protocol: Transport::Udp,
            local: None,
            remote: None,
            transport_id: None,
            tls_context: None,
        }
    }
}

impl BindingParams {
    pub fn new(protocol: Transport, remote: SocketAddr) -> Self {
        Self {
            protocol,
            remote: Some(SipAddr::from_socket(protocol, remote)),
            ..Default::default()
        }
    }

    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_transport_id(mut self, id: &str) -> Self {
        self.transport_id = Some(id.to_string());
        self
    }

    pub fn with_tls_context(mut self, name: &str) -> Self {
        self.tls_context = Some(name.to_string());
        self
    }
}

/// Binds one signaling leg to a live transport
///
/// `PartyBinding` is what a session sends through. It keeps the transport
/// parameters the leg asked for ([`BindingParams`]) and resolves them to a
/// transport of the [`TransportLayer`] lazily, on first use, and again
/// whenever the bound transport dies or the parameters change.
///
/// Resolution order:
///
/// 1. the transport named by `transport_id`, while it is registered
/// 2. for UDP, the transport bound to `local`, else the default one
/// 3. for TCP/TLS, a live stream towards `remote`, else a new outgoing one
///
/// The binding holds one reference on the transport it uses and drops it
/// when it moves or is dropped. The pointer is guarded by its own lock,
/// separate from the transport's state.
///
/// # Examples
///
/// ## Calling out over TCP
///
/// ```rust,no_run
/// # use rsipchan::{config::AddressChangePolicy, transport::{BindingParams, PartyBinding, TransportLayer}};
/// # use rsip::transport::Transport;
/// # async fn example(layer: TransportLayer, invite: rsip::Request) -> rsipchan::Result<()> {
/// let params = BindingParams::new(Transport::Tcp, "192.0.2.10:5060".parse()?);
/// let binding = PartyBinding::new(layer, params, AddressChangePolicy::Ignore);
/// if !binding.bind(false) {
///     println!("no transport: {:?}", binding.last_error());
/// }
/// binding.send(invite.into()).await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Moving a leg to TLS
///
/// ```rust,no_run
/// # use rsipchan::transport::{BindingParams, PartyBinding};
/// # use rsip::transport::Transport;
/// # fn example(binding: &PartyBinding) -> rsipchan::Result<()> {
/// let params = BindingParams::new(Transport::Tls, "192.0.2.10:5061".parse()?)
///     .with_tls_context("carrier");
/// // the old transport is released, a TLS stream replaces it
/// assert!(binding.rebind(params));
/// # Ok(())
/// # }
/// ```
pub struct PartyBinding {
    registry: TransportLayer,
    params: Mutex<BindingParams>,
    transport: Mutex<Option<SipConnection>>,
    last_error: Mutex<Option<String>>,
    policy: AddressChangePolicy,
}

impl PartyBinding {
    pub fn new(
        registry: TransportLayer,
        params: BindingParams,
        policy: AddressChangePolicy,
    ) -> Self {
        Self {
            registry,
            params: Mutex::new(params),
            transport: Mutex::new(None),
            last_error: Mutex::new(None),
            policy,
        }
    }

    /// Binding for a leg that arrived on `connection` from `source`
    pub fn from_connection(
        registry: TransportLayer,
        connection: SipConnection,
        source: SipAddr,
        policy: AddressChangePolicy,
    ) -> Self {
        let local = match &connection {
            SipConnection::Udp(t) => t.local_addr(),
            SipConnection::Stream(_) => None,
        };
        let params = BindingParams {
            protocol: connection.protocol(),
            local,
            remote: Some(SipAddr::new(connection.protocol(), source.addr)),
            transport_id: Some(connection.id().to_string()),
            tls_context: None,
        };
        connection.acquire();
        Self {
            registry,
            params: Mutex::new(params),
            transport: Mutex::new(Some(connection)),
            last_error: Mutex::new(None),
            policy,
        }
    }

    pub fn params(&self) -> BindingParams {
        self.params.lock().clone()
    }

    pub fn remote(&self) -> Option<SipAddr> {
        self.params.lock().remote.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// The transport currently in use, if it is still alive
    pub fn transport(&self) -> Option<SipConnection> {
        self.transport
            .lock()
            .as_ref()
            .filter(|t| t.status() < TransportStatus::Terminating)
            .cloned()
    }

    fn replace(&self, connection: Option<SipConnection>) {
        if let Some(connection) = &connection {
            connection.acquire();
        }
        let previous = std::mem::replace(&mut *self.transport.lock(), connection);
        if let Some(previous) = previous {
            previous.release();
        }
    }

    fn resolve(&self, params: &BindingParams) -> std::result::Result<SipConnection, String> {
        if let Some(id) = &params.transport_id {
            if let Some(connection) = self.registry.find(id) {
                return Ok(connection);
            }
            debug!(id, "bound transport gone, resolving by address");
        }
        let remote = params
            .remote
            .as_ref()
            .ok_or_else(|| "no remote address".to_string())?;
        match params.protocol {
            Transport::Udp => self
                .registry
                .find_udp(params.local)
                .map(SipConnection::Udp)
                .ok_or_else(|| match params.local {
                    Some(local) => format!("no UDP transport on {}", local),
                    None => "no UDP transport".to_string(),
                }),
            protocol @ (Transport::Tcp | Transport::Tls) => {
                let target = SipAddr::new(protocol, remote.addr.clone());
                self.registry
                    .connect_stream(&target, params.tls_context.as_deref())
                    .map(SipConnection::Stream)
                    .map_err(|e| e.to_string())
            }
            other => Err(format!("unsupported protocol {}", other)),
        }
    }

    /// Resolves a transport; a no-op when one is bound and `force` is unset
    ///
    /// Returns false, with the reason in [`PartyBinding::last_error`], when
    /// nothing satisfies the parameters. A new outgoing stream counts as
    /// bound while it is still connecting.
    pub fn bind(&self, force: bool) -> bool {
        if !force && self.transport().is_some() {
            return true;
        }
        let params = self.params();
        match self.resolve(&params) {
            Ok(connection) => {
                debug!(transport = %connection, "party bound");
                if let SipConnection::Stream(_) = &connection {
                    self.params.lock().transport_id = Some(connection.id().to_string());
                }
                self.replace(Some(connection));
                *self.last_error.lock() = None;
                true
            }
            Err(reason) => {
                warn!(remote = ?params.remote, "party binding failed: {}", reason);
                self.replace(None);
                *self.last_error.lock() = Some(reason);
                false
            }
        }
    }

    /// Applies new parameters, rebuilding the binding when they changed
    ///
    /// A `transport_id` of `None` does not by itself count as a change. With
    /// unchanged parameters this is [`PartyBinding::bind`] without force.
    pub fn rebind(&self, params: BindingParams) -> bool {
        let changed = {
            let mut current = self.params.lock();
            let changed = current.protocol != params.protocol
                || current.local != params.local
                || current.remote != params.remote
                || current.tls_context != params.tls_context
                || (params.transport_id.is_some() && current.transport_id != params.transport_id);
            if changed {
                *current = params;
            }
            changed
        };
        if !changed {
            return self.bind(false);
        }
        info!(params = ?self.params(), "rebinding party");
        self.replace(None);
        self.bind(true)
    }

    /// Follows a leg whose requests now arrive from a different address
    ///
    /// `via` is the address announced by the topmost Via of the request.
    /// Returns true when the binding moved.
    pub fn on_remote_address_changed(
        &self,
        observed: &SipAddr,
        connection: &SipConnection,
        via: Option<&SipAddr>,
    ) -> bool {
        let current = self.params();
        let same_remote = current
            .remote
            .as_ref()
            .is_some_and(|r| r.addr == observed.addr);
        let same_transport = current.transport_id.as_deref() == Some(connection.id());
        if same_remote && same_transport {
            return false;
        }
        let allowed = match self.policy {
            AddressChangePolicy::Ignore => false,
            AddressChangePolicy::Observed => true,
            AddressChangePolicy::Via => via.is_some_and(|v| v.addr == observed.addr),
        };
        if !allowed {
            debug!(
                from = ?current.remote, to = %observed, policy = ?self.policy,
                "ignoring remote address change"
            );
            return false;
        }
        info!(from = ?current.remote, to = %observed, transport = %connection, "remote address changed");
        {
            let mut params = self.params.lock();
            params.protocol = connection.protocol();
            params.remote = Some(SipAddr::new(connection.protocol(), observed.addr.clone()));
            params.transport_id = Some(connection.id().to_string());
        }
        self.replace(Some(connection.clone()));
        true
    }

    /// Sends `msg` to the remote party, binding first if needed
    ///
    /// # Errors
    ///
    /// [`Error::TransportLayerError`] when no transport can be bound or the
    /// bound one fails to send.
    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        if !self.bind(false) {
            let reason = self.last_error().unwrap_or_default();
            return Err(Error::TransportLayerError(
                reason,
                self.remote().unwrap_or_default(),
            ));
        }
        let connection = self.transport().ok_or_else(|| {
            Error::TransportLayerError(
                "transport not available".to_string(),
                self.remote().unwrap_or_default(),
            )
        })?;
        let remote = self.remote();
        connection.send(msg, remote.as_ref()).await
    }

    /// Applies the Flow-Timer of a response to the bound stream transport
    pub fn apply_flow_timer(&self, response: &rsip::Response) -> Option<Duration> {
        let value = response.flow_timer()?;
        match self.transport() {
            Some(SipConnection::Stream(t)) => {
                t.set_flow_timer(Duration::from_secs(value));
                Some(t.idle_interval())
            }
            _ => None,
        }
    }
}

impl Drop for PartyBinding {
    fn drop(&mut self) {
        if let Some(connection) = self.transport.get_mut().take() {
            connection.release();
        }
    }
}

impl std::fmt::Debug for PartyBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartyBinding")
            .field("params", &*self.params.lock())
            .field("transport", &*self.transport.lock())
            .finish()
    }
}
