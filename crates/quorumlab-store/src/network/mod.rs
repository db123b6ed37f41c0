//! Network transport for Raft and clients.
//!
//! - [`NngRaftNetwork`] - Network client for sending Raft RPCs
//! - [`NngNetworkFactory`] - Factory for creating network connections
//! - [`RepServer`] - REP socket loop serving peer or client requests
//! - Wire message types

pub mod factory;
pub mod messages;
pub mod server;
pub mod transport;

use nng::options::Options;
use nng::Socket;

use crate::config::TlsInfo;
use crate::error::StoreError;

pub use factory::NngNetworkFactory;
pub use messages::{ClientReply, ClientRequest, LeaderReply, LeaderRequest, NodeStatus, RaftMessage};
pub use server::RepServer;
pub use transport::NngRaftNetwork;

/// Apply certificate material to a socket. No-op for plain TCP.
pub(crate) fn configure_tls(socket: &Socket, tls: &TlsInfo) -> Result<(), StoreError> {
    if tls.is_empty() {
        return Ok(());
    }

    if let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) {
        let cert_key_path = format!("{}:{}", cert_path.display(), key_path.display());
        socket
            .set_opt::<nng::options::transport::tls::CertKeyFile>(cert_key_path)
            .map_err(|e| StoreError::Tls(format!("failed to set cert/key: {}", e)))?;
    }

    if let Some(ca_path) = &tls.ca_path {
        socket
            .set_opt::<nng::options::transport::tls::CaFile>(ca_path.display().to_string())
            .map_err(|e| StoreError::Tls(format!("failed to set CA: {}", e)))?;
    }

    Ok(())
}
