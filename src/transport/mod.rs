pub mod backoff;
pub mod binding;
pub mod codec;
pub mod connection;
pub mod listener;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod transport_layer;
pub mod udp;
pub mod worker;

pub use binding::{BindingParams, PartyBinding};
pub use connection::{Process, SipConnection, TransportEvent, TransportStatus};
pub use listener::Listener;
pub use sip_addr::SipAddr;
pub use stream::StreamTransport;
pub use transport_layer::TransportLayer;
pub use udp::UdpTransport;

#[cfg(test)]
pub mod tests;
