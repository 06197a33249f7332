//! SOCKS5 inbound listener (RFC 1928): no-auth, CONNECT only.

use std::net::IpAddr;
use std::sync::Arc;

use rudder_proto::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, Address};
use rudder_tunnel::Tunnel;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{InboundError, StreamConn};

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Accept loop. Each accepted client is handled on its own task; handshake
/// failures close the connection and never disturb the listener.
pub async fn serve(
    listener: TcpListener,
    tunnel: Arc<Tunnel>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(address = %listener.local_addr()?, "SOCKS5 proxy listening");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("SOCKS5 listener stopped");
                return Ok(());
            }

            result = listener.accept() => {
                let (stream, peer) = result?;
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handshake(stream, tunnel).await {
                        debug!(peer = %peer, error = %e, "socks5 handshake failed");
                    }
                });
            }
        }
    }
}

async fn handshake(mut stream: TcpStream, tunnel: Arc<Tunnel>) -> Result<(), InboundError> {
    negotiate_method(&mut stream).await?;

    let (command, addr) = read_request(&mut stream).await?;
    if command != CMD_CONNECT {
        send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(InboundError::UnsupportedCommand(command));
    }

    // The reply goes out before dispatch; a failed outbound dial later
    // surfaces to the client as an immediate close.
    send_reply(&mut stream, REPLY_SUCCEEDED).await?;
    tunnel.enqueue(Box::new(StreamConn::new(addr, stream)))?;
    Ok(())
}

/// Method negotiation: the client offers methods, we require NO AUTH.
async fn negotiate_method<S>(stream: &mut S) -> Result<(), InboundError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(InboundError::Version(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    } else {
        let _ = stream
            .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
            .await;
        Err(InboundError::NoAcceptableAuth)
    }
}

/// Read the request after negotiation; returns the command and destination.
///
/// IP literals arrive with their address resolved; domain destinations are
/// left unresolved, rule matching never does DNS.
async fn read_request<S>(stream: &mut S) -> Result<(u8, Address), InboundError>
where
    S: AsyncRead + Unpin,
{
    // VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(InboundError::Version(header[0]));
    }
    let command = header[1];

    let addr = match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let octets: [u8; 4] = buf[..4].try_into().expect("sliced to 4 bytes");
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Address::from_ip(IpAddr::from(octets), port)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let domain_len = len[0] as usize;
            let host = std::str::from_utf8(&buf[..domain_len])
                .map_err(|_| InboundError::Malformed("domain is not valid UTF-8".into()))?;
            let port = u16::from_be_bytes([buf[domain_len], buf[domain_len + 1]]);
            Address::new(host, port)
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let octets: [u8; 16] = buf[..16].try_into().expect("sliced to 16 bytes");
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Address::from_ip(IpAddr::from(octets), port)
        }
        other => return Err(InboundError::UnsupportedAddressType(other)),
    };

    Ok((command, addr))
}

/// Reply with an unspecified bind address (0.0.0.0:0).
async fn send_reply<S>(stream: &mut S, reply: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let buf = [
        SOCKS5_VERSION,
        reply,
        0x00, // RSV
        ATYP_IPV4,
        0,
        0,
        0,
        0, // BND.ADDR
        0,
        0, // BND.PORT
    ];
    stream.write_all(&buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn negotiation_accepts_no_auth() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { negotiate_method(&mut server).await.map(|_| server) });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn negotiation_rejects_auth_only_clients() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { negotiate_method(&mut server).await });

        // Offers only username/password auth.
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xff]);
        assert!(matches!(
            task.await.unwrap(),
            Err(InboundError::NoAcceptableAuth)
        ));
    }

    #[tokio::test]
    async fn request_parses_all_address_types() {
        // IPv4
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x4e, 0x1f])
            .await
            .unwrap();
        let (cmd, addr) = read_request(&mut server).await.unwrap();
        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(addr.to_string(), "127.0.0.1:19999");
        assert!(addr.ip().is_some());

        // Domain
        let (mut client, mut server) = duplex(256);
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 12];
        req.extend_from_slice(b"blocked.test");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let (_, addr) = read_request(&mut server).await.unwrap();
        assert_eq!(addr.host(), "blocked.test");
        assert_eq!(addr.port(), 443);
        assert!(addr.ip().is_none());

        // IPv6
        let (mut client, mut server) = duplex(256);
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&[0u8; 15]);
        req.push(1); // ::1
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let (_, addr) = read_request(&mut server).await.unwrap();
        assert_eq!(addr.to_string(), "[::1]:80");
    }

    #[tokio::test]
    async fn bad_version_is_rejected() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(matches!(
            negotiate_method(&mut server).await,
            Err(InboundError::Version(0x04))
        ));
    }
}
