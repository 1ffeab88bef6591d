use super::{stream::StreamIo, SipAddr};
use crate::{error::Error, Result};
use rustls::client::danger::ServerCertVerifier;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{pki_types, ClientConfig, RootCertStore, ServerConfig},
    TlsAcceptor, TlsConnector,
};
use tracing::debug;

/// PEM material of a named TLS context
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Server certificate chain
    pub cert: Option<Vec<u8>>,
    /// Server private key
    pub key: Option<Vec<u8>>,
    /// Client certificate chain presented on outgoing connections
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
    /// Trusted roots for verifying peers
    pub ca_certs: Option<Vec<u8>>,
    /// Replaces root-store verification of outgoing peers
    pub server_verifier: Option<Arc<dyn ServerCertVerifier>>,
}

/// Ready-to-use acceptor and connector built from a [`TlsConfig`]
///
/// Listeners require the acceptor and wait while their context has none;
/// outgoing TLS transports use the connector.
#[derive(Clone)]
pub struct TlsContext {
    pub name: String,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    generation: u64,
}

impl TlsContext {
    pub fn new(name: &str, config: &TlsConfig) -> Result<Self> {
        let acceptor = match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => Some(create_acceptor(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(Error::TlsError(format!(
                    "context {}: certificate and key must be given together",
                    name
                )))
            }
        };
        let connector = create_connector(config)?;
        Ok(Self {
            name: name.to_string(),
            acceptor,
            connector,
            generation: rand::random(),
        })
    }

    pub fn acceptor(&self) -> Option<&TlsAcceptor> {
        self.acceptor.as_ref()
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    /// Differs between two contexts built under the same name
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("name", &self.name)
            .field("server", &self.acceptor.is_some())
            .finish()
    }
}

fn load_certs(pem: &[u8]) -> Result<Vec<pki_types::CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()
        .map_err(|e| Error::TlsError(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::TlsError("No certificate found".to_string()));
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> Result<pki_types::PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()
        .map_err(|e| Error::TlsError(format!("Failed to parse PKCS8 key: {}", e)))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(pki_types::PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = std::io::BufReader::new(pem);
    let keys = rustls_pemfile::rsa_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()
        .map_err(|e| Error::TlsError(format!("Failed to parse RSA key: {}", e)))?;
    match keys.into_iter().next() {
        Some(key) => Ok(pki_types::PrivateKeyDer::Pkcs1(key)),
        None => Err(Error::TlsError("No valid private key found".to_string())),
    }
}

fn create_acceptor(cert: &[u8], key: &[u8]) -> Result<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_key(key)?;
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsError(format!("TLS configuration error: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn create_connector(config: &TlsConfig) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    if let Some(ca) = &config.ca_certs {
        for cert in load_certs(ca)? {
            root_store
                .add(cert)
                .map_err(|e| Error::TlsError(format!("Invalid CA certificate: {}", e)))?;
        }
    }
    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let mut client_config = match (&config.client_cert, &config.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| Error::TlsError(format!("Client certificate error: {}", e)))?,
        _ => builder.with_no_client_auth(),
    };
    if let Some(verifier) = &config.server_verifier {
        client_config
            .dangerous()
            .set_certificate_verifier(verifier.clone());
    }
    Ok(TlsConnector::from(Arc::new(client_config)))
}

fn server_name(remote: &SipAddr) -> Result<pki_types::ServerName<'static>> {
    let name = match &remote.addr.host {
        rsip::host_with_port::Host::Domain(domain) => domain.to_string(),
        rsip::host_with_port::Host::IpAddr(ip) => ip.to_string(),
    };
    pki_types::ServerName::try_from(name.as_str())
        .map(|n| n.to_owned())
        .map_err(|_| Error::TlsError(format!("Invalid DNS name: {}", name)))
}

/// Opens a TCP connection to `remote` and runs the client handshake
pub async fn connect(
    connector: &TlsConnector,
    remote: &SipAddr,
) -> Result<(StreamIo, SocketAddr)> {
    let socket_addr = remote.get_socketaddr()?;
    let name = server_name(remote)?;
    let stream = TcpStream::connect(socket_addr).await?;
    stream.set_nodelay(true).ok();
    let local = stream.local_addr()?;
    let tls_stream = connector
        .connect(name, stream)
        .await
        .map_err(|e| Error::TlsError(format!("handshake with {} failed: {}", socket_addr, e)))?;
    debug!(%local, remote = %socket_addr, "TLS connected");
    Ok((StreamIo::new(tls_stream), local))
}

/// Runs the server handshake on an accepted socket
pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<StreamIo> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::TlsError(format!("handshake failed: {}", e)))?;
    Ok(StreamIo::new(tls_stream))
}
