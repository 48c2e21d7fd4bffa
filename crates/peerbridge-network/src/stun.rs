//! STUN client for public address discovery
//!
//! Implements the minimal RFC 5389 exchange the session needs: a single
//! Binding Request, accepting only a Binding Success Response and only
//! its XOR-MAPPED-ADDRESS attribute.
//!
//! The client binds the UDP socket itself and hands it over to the
//! transport afterwards, so the NAT mapping discovered here stays valid
//! for the hole-punching phase.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{NetworkError, NetworkResult};

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_SUCCESS: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute type
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Response wait limit
const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Server-reflexive address discovered via STUN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl std::fmt::Display for PublicAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// STUN client owning the session's UDP socket until discovery is done
pub struct StunClient {
    socket: Option<UdpSocket>,
    server: String,
}

impl StunClient {
    /// Bind a socket on `local_port` (0 = ephemeral) for discovery.
    pub async fn bind(server: impl Into<String>, local_port: u16) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        debug!("STUN socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Some(socket),
            server: server.into(),
        })
    }

    /// Perform the binding request and return our public address.
    pub async fn discover_public_address(&self) -> NetworkResult<PublicAddress> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| NetworkError::Stun("Socket already handed over".into()))?;

        let server_addr: SocketAddr = tokio::net::lookup_host(&self.server)
            .await
            .map_err(|e| NetworkError::Stun(format!("Cannot resolve '{}': {}", self.server, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| {
                NetworkError::Stun(format!("No IPv4 address for STUN server {}", self.server))
            })?;

        let mut transaction_id = [0u8; 12];
        getrandom::getrandom(&mut transaction_id)
            .map_err(|e| NetworkError::Stun(e.to_string()))?;

        let request = build_binding_request(&transaction_id);
        socket.send_to(&request, server_addr).await?;
        debug!("Sent STUN binding request to {}", server_addr);

        let mut buf = [0u8; 576];
        let (len, from) = timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NetworkError::Timeout)??;
        debug!("STUN response from {} ({} bytes)", from, len);

        let public = parse_binding_response(&buf[..len], &transaction_id)?;
        info!("Public address discovered via STUN: {}", public);
        Ok(public)
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| NetworkError::Stun("Socket already handed over".into()))?;
        Ok(socket.local_addr()?)
    }

    /// Give up the socket so the transport can take it over.
    pub fn into_socket(mut self) -> NetworkResult<UdpSocket> {
        self.socket
            .take()
            .ok_or_else(|| NetworkError::Stun("Socket already handed over".into()))
    }
}

/// Build a 20-byte STUN Binding Request
fn build_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // Message length stays zero: no attributes
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(transaction_id);
    request
}

/// Validate a Binding Success Response and extract XOR-MAPPED-ADDRESS
fn parse_binding_response(
    data: &[u8],
    expected_txn_id: &[u8; 12],
) -> NetworkResult<PublicAddress> {
    if data.len() < 20 {
        return Err(NetworkError::Stun("Response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_SUCCESS {
        return Err(NetworkError::Stun(format!(
            "Not a binding success response: 0x{:04x}",
            msg_type
        )));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if 20 + msg_len > data.len() {
        return Err(NetworkError::Stun("Message length exceeds response".into()));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(NetworkError::Stun("Invalid magic cookie".into()));
    }

    if &data[8..20] != expected_txn_id {
        return Err(NetworkError::Stun("Transaction ID mismatch".into()));
    }

    // Walk attributes looking for XOR-MAPPED-ADDRESS
    let mut pos = 20;
    while pos + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if pos + attr_len > data.len() {
            break;
        }

        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 && data[pos + 1] == 0x01 {
            let xport = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
            let xip = u32::from_be_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
            ]);

            let port = xport ^ (MAGIC_COOKIE >> 16) as u16;
            let ip = Ipv4Addr::from(xip ^ MAGIC_COOKIE);
            return Ok(PublicAddress { ip, port });
        }

        // Attributes are padded to 4-byte boundaries
        pos += (attr_len + 3) & !3;
    }

    Err(NetworkError::Stun(
        "No XOR-MAPPED-ADDRESS in response".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_response(txn_id: &[u8; 12], ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let xport = port ^ (MAGIC_COOKIE >> 16) as u16;
        let xip = u32::from(ip) ^ MAGIC_COOKIE;

        let mut resp = Vec::new();
        resp.extend_from_slice(&STUN_BINDING_SUCCESS.to_be_bytes());
        resp.extend_from_slice(&12u16.to_be_bytes()); // one 8-byte attribute + TLV
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(txn_id);
        resp.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        resp.extend_from_slice(&8u16.to_be_bytes());
        resp.push(0x00);
        resp.push(0x01); // IPv4 family
        resp.extend_from_slice(&xport.to_be_bytes());
        resp.extend_from_slice(&xip.to_be_bytes());
        resp
    }

    #[test]
    fn request_layout() {
        let txn_id = [7u8; 12];
        let request = build_binding_request(&txn_id);

        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &txn_id);
    }

    #[test]
    fn parses_xor_mapped_address() {
        let txn_id = [3u8; 12];
        let ip = Ipv4Addr::new(198, 51, 100, 42);
        let resp = success_response(&txn_id, ip, 62001);

        let addr = parse_binding_response(&resp, &txn_id).unwrap();
        assert_eq!(addr.ip, ip);
        assert_eq!(addr.port, 62001);
    }

    #[test]
    fn rejects_error_response() {
        let txn_id = [1u8; 12];
        let mut resp = success_response(&txn_id, Ipv4Addr::new(1, 2, 3, 4), 1000);
        resp[0..2].copy_from_slice(&0x0111u16.to_be_bytes()); // binding error
        assert!(parse_binding_response(&resp, &txn_id).is_err());
    }

    #[test]
    fn rejects_transaction_mismatch() {
        let txn_id = [1u8; 12];
        let resp = success_response(&txn_id, Ipv4Addr::new(1, 2, 3, 4), 1000);
        assert!(parse_binding_response(&resp, &[2u8; 12]).is_err());
    }

    #[test]
    fn rejects_truncated_response() {
        let txn_id = [1u8; 12];
        let resp = success_response(&txn_id, Ipv4Addr::new(1, 2, 3, 4), 1000);
        assert!(parse_binding_response(&resp[..10], &txn_id).is_err());
    }

    #[tokio::test]
    async fn socket_hand_over() {
        let client = StunClient::bind(DEFAULT_STUN_SERVER, 0).await.unwrap();
        let local = client.local_addr().unwrap();
        let socket = client.into_socket().unwrap();
        assert_eq!(socket.local_addr().unwrap(), local);
    }
}
