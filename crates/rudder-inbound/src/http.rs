//! HTTP proxy inbound listener.
//!
//! `CONNECT host:port` answers `200 OK` and hands the raw stream to the
//! dispatcher for splicing. Any other method is forward-mode proxying: the
//! request is replayed through the outbound as one round trip, the response
//! is copied back with hop-by-hop headers stripped, and chunked response
//! bodies are flushed to the client chunk by chunk. After a cleanly
//! delimited round trip the client connection is reused for its next
//! request; each request is still dispatched through the ruleset on its
//! own.

use std::sync::Arc;

use async_trait::async_trait;
use rudder_proto::Address;
use rudder_tunnel::{ProxyStream, ServerConn, Tunnel};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{InboundError, StreamConn};

/// Upper bound on a request or response head.
const MAX_HEAD_BYTES: usize = 8192;

type ClientStream = BufReader<TcpStream>;

/// Accept loop; one task per client connection.
pub async fn serve(
    listener: TcpListener,
    tunnel: Arc<Tunnel>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(address = %listener.local_addr()?, "HTTP proxy listening");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("HTTP listener stopped");
                return Ok(());
            }

            result = listener.accept() => {
                let (stream, peer) = result?;
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, tunnel).await {
                        debug!(peer = %peer, error = %e, "http client failed");
                    }
                });
            }
        }
    }
}

async fn handle_client(stream: TcpStream, tunnel: Arc<Tunnel>) -> Result<(), InboundError> {
    let mut client: ClientStream = BufReader::new(stream);

    loop {
        let Some(request) = read_head(&mut client).await? else {
            // Client closed between requests.
            return Ok(());
        };

        if request.method().eq_ignore_ascii_case("CONNECT") {
            let addr = parse_host_port(request.target(), 443)?;
            client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
            tunnel.enqueue(Box::new(StreamConn::new(addr, client)))?;
            return Ok(());
        }

        let addr = forward_target(&request)?;
        let (done_tx, done_rx) = oneshot::channel();
        tunnel.enqueue(Box::new(HttpConn {
            addr,
            request,
            client,
            done: done_tx,
        }))?;

        // The worker sends the client stream back when the connection can
        // carry another request.
        match done_rx.await {
            Ok(stream) => client = stream,
            Err(_) => return Ok(()),
        }
    }
}

/// A parsed request or response head. The start line is kept verbatim so a
/// response can be replayed byte-for-byte (reason phrases contain spaces).
#[derive(Debug)]
struct Head {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl Head {
    fn token(&self, idx: usize) -> &str {
        self.start_line.split_whitespace().nth(idx).unwrap_or("")
    }

    /// Request method (or the HTTP version of a response).
    fn method(&self) -> &str {
        self.token(0)
    }

    /// Request target (or the status code of a response).
    fn target(&self) -> &str {
        self.token(1)
    }

    /// Request HTTP version.
    fn version(&self) -> &str {
        self.token(2)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    fn wants_close(&self) -> bool {
        self.header("Connection")
            .or_else(|| self.header("Proxy-Connection"))
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }
}

/// Read one head (start line + headers) from `reader`.
///
/// Returns `None` on EOF before any bytes, which is a clean close.
async fn read_head<R>(reader: &mut R) -> Result<Option<Head>, InboundError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut budget = MAX_HEAD_BYTES.saturating_sub(line.len());

    let start_line = line.trim_end().to_string();
    if start_line.split_whitespace().count() < 2 {
        return Err(InboundError::Malformed(format!(
            "bad start line: {start_line:?}"
        )));
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(InboundError::Malformed("eof inside head".into()));
        }
        budget = budget
            .checked_sub(line.len())
            .ok_or_else(|| InboundError::Malformed("head too large".into()))?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(InboundError::Malformed(format!("bad header: {trimmed:?}")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(Head {
        start_line,
        headers,
    }))
}

/// Destination of a forward-mode request: the `Host` header (port 80 when
/// absent), falling back to the absolute request URI.
fn forward_target(request: &Head) -> Result<Address, InboundError> {
    if let Some(host) = request.header("Host") {
        return parse_host_port(host, 80);
    }
    if let Some(rest) = request.target().strip_prefix("http://") {
        let host_port = rest.split('/').next().unwrap_or("");
        return parse_host_port(host_port, 80);
    }
    Err(InboundError::Malformed(
        "no Host header and no absolute URI".into(),
    ))
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
fn parse_host_port(target: &str, default_port: u16) -> Result<Address, InboundError> {
    if target.is_empty() {
        return Err(InboundError::Malformed("empty host".into()));
    }
    if let Some(rest) = target.strip_prefix('[') {
        let Some((host, after)) = rest.split_once(']') else {
            return Err(InboundError::Malformed(format!("bad host: {target:?}")));
        };
        let port = match after.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| InboundError::Malformed(format!("bad port: {p:?}")))?,
            None => default_port,
        };
        return Ok(Address::new(host, port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| InboundError::Malformed(format!("bad port: {port:?}")))?;
            Ok(Address::new(host, port))
        }
        _ => Ok(Address::new(target, default_port)),
    }
}

/// Headers that belong to one hop and must not be replayed.
fn is_hop_by_hop(name: &str) -> bool {
    const HOP: &[&str] = &[
        "Connection",
        "Proxy-Connection",
        "Keep-Alive",
        "Proxy-Authenticate",
        "Proxy-Authorization",
        "TE",
        "Trailer",
        "Upgrade",
    ];
    HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Forward-mode connection: one request/response round trip per dispatch.
struct HttpConn {
    addr: Address,
    request: Head,
    client: ClientStream,
    done: oneshot::Sender<ClientStream>,
}

#[async_trait]
impl ServerConn for HttpConn {
    fn addr(&self) -> &Address {
        &self.addr
    }

    async fn connect(self: Box<Self>, mut outbound: ProxyStream) {
        let this = *self;
        let (request, mut client, done) = (this.request, this.client, this.done);
        match round_trip(&request, &mut client, &mut outbound).await {
            Ok(true) => {
                // Cleanly delimited exchange: offer the client back to the
                // listener for its next request.
                let _ = done.send(client);
            }
            Ok(false) => {}
            Err(e) => debug!(error = %e, "forward round trip failed"),
        }
    }
}

/// Replay `request` through the outbound, stream the response back.
///
/// Returns whether the client connection can carry another request.
async fn round_trip(
    request: &Head,
    client: &mut ClientStream,
    outbound: &mut ProxyStream,
) -> Result<bool, InboundError> {
    // Request head, origin-form, hop-by-hop stripped. The upstream leg is
    // never reused, so it is told to close.
    let mut head = format!(
        "{} {} HTTP/1.1\r\n",
        request.method(),
        origin_form(request.target())
    );
    for (name, value) in &request.headers {
        if !is_hop_by_hop(name) {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    head.push_str("Connection: close\r\n\r\n");
    outbound.write_all(head.as_bytes()).await?;

    // Request body.
    if request.is_chunked() {
        copy_chunked(client, outbound, false).await?;
    } else if let Some(n) = request.content_length() {
        copy_exact(client, outbound, n).await?;
    }
    outbound.flush().await?;

    // Response head, replayed with hop-by-hop headers stripped.
    let mut upstream = BufReader::new(outbound);
    let Some(response) = read_head(&mut upstream).await? else {
        return Err(InboundError::Malformed("no response from upstream".into()));
    };

    let mut out = format!("{}\r\n", response.start_line);
    for (name, value) in &response.headers {
        if !is_hop_by_hop(name) {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    out.push_str("\r\n");
    client.write_all(out.as_bytes()).await?;

    // Response body. HEAD responses and 1xx/204/304 statuses carry headers
    // like Content-Length but no body; reading one would block on upstream
    // EOF and poison the client connection.
    let delimited = if body_is_empty(request, &response) {
        true
    } else if response.is_chunked() {
        // Flush after every chunk so streaming responses stream.
        copy_chunked(&mut upstream, client, true).await?;
        true
    } else if let Some(n) = response.content_length() {
        copy_exact(&mut upstream, client, n).await?;
        true
    } else {
        // Body runs to EOF; the client connection cannot be reused.
        tokio::io::copy(&mut upstream, client).await?;
        false
    };
    client.flush().await?;

    let reusable = delimited
        && !request.wants_close()
        && !response.wants_close()
        && request.version().eq_ignore_ascii_case("HTTP/1.1");
    Ok(reusable)
}

/// Whether a response has no body regardless of its framing headers
/// (RFC 9110 §6.4.1): any response to HEAD, and 1xx/204/304 statuses.
fn body_is_empty(request: &Head, response: &Head) -> bool {
    if request.method().eq_ignore_ascii_case("HEAD") {
        return true;
    }
    match response.target().parse::<u16>() {
        Ok(status) => status / 100 == 1 || status == 204 || status == 304,
        Err(_) => false,
    }
}

/// The path portion of a request target, for the upstream request line.
fn origin_form(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix("http://") {
        match rest.find('/') {
            Some(i) => &rest[i..],
            None => "/",
        }
    } else {
        target
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, mut remaining: u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Copy a chunked body through, re-emitting the framing verbatim.
///
/// With `flush_each` set the writer is flushed after every chunk.
async fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    flush_each: bool,
) -> Result<(), InboundError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).await? == 0 {
            return Err(InboundError::Malformed("eof inside chunked body".into()));
        }
        let size_str = size_line.trim_end();
        let size_hex = size_str.split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_hex.trim(), 16)
            .map_err(|_| InboundError::Malformed(format!("bad chunk size: {size_str:?}")))?;

        writer.write_all(size_line.as_bytes()).await?;

        if size == 0 {
            // Trailers, through to the blank line.
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).await? == 0 {
                    return Err(InboundError::Malformed("eof inside trailers".into()));
                }
                writer.write_all(trailer.as_bytes()).await?;
                if trailer.trim_end().is_empty() {
                    break;
                }
            }
            if flush_each {
                writer.flush().await?;
            }
            return Ok(());
        }

        // Chunk data plus its trailing CRLF.
        let mut remaining = size + 2;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = buf.len().min(remaining);
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(InboundError::Malformed("eof inside chunk".into()));
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n;
        }
        if flush_each {
            writer.flush().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn origin_form_strips_the_authority() {
        assert_eq!(origin_form("http://example.com/a/b?q=1"), "/a/b?q=1");
        assert_eq!(origin_form("http://example.com"), "/");
        assert_eq!(origin_form("/already/origin"), "/already/origin");
    }

    #[test]
    fn host_port_defaults() {
        let addr = parse_host_port("example.com", 80).unwrap();
        assert_eq!(addr.to_string(), "example.com:80");
        let addr = parse_host_port("example.com:8080", 80).unwrap();
        assert_eq!(addr.port(), 8080);
        let addr = parse_host_port("[::1]:443", 80).unwrap();
        assert_eq!(addr.to_string(), "[::1]:443");
        let addr = parse_host_port("[::1]", 80).unwrap();
        assert_eq!(addr.port(), 80);
        assert!(parse_host_port("example.com:x", 80).is_err());
    }

    #[tokio::test]
    async fn head_parsing_and_lookup() {
        let raw =
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbody";
        let (mut tx, rx) = duplex(1024);
        tx.write_all(raw.as_bytes()).await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let head = read_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.method(), "GET");
        assert_eq!(head.target(), "http://example.com/");
        assert_eq!(head.version(), "HTTP/1.1");
        assert_eq!(head.header("host"), Some("example.com"));
        assert_eq!(head.content_length(), Some(4));
        assert!(!head.is_chunked());

        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "body");
    }

    #[tokio::test]
    async fn response_reason_phrase_survives() {
        let raw = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let (mut tx, rx) = duplex(1024);
        tx.write_all(raw.as_bytes()).await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let head = read_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(head.start_line, "HTTP/1.1 404 Not Found");
        assert_eq!(head.target(), "404");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (tx, rx) = duplex(16);
        drop(tx);
        let mut reader = BufReader::new(rx);
        assert!(read_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut tx, rx) = duplex(64 * 1024);
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..1000 {
            raw.push_str(&format!("X-Filler-{i}: {}\r\n", "v".repeat(64)));
        }
        raw.push_str("\r\n");
        tokio::spawn(async move {
            let _ = tx.write_all(raw.as_bytes()).await;
        });

        let mut reader = BufReader::new(rx);
        assert!(matches!(
            read_head(&mut reader).await,
            Err(InboundError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn chunked_copy_preserves_framing() {
        let raw = "4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (mut tx, rx) = duplex(1024);
        tx.write_all(raw.as_bytes()).await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut out = Vec::new();
        copy_chunked(&mut reader, &mut out, false).await.unwrap();
        assert_eq!(out, raw.as_bytes());
    }

    #[tokio::test]
    async fn chunk_size_extensions_are_tolerated() {
        let raw = "4;ext=1\r\nWiki\r\n0\r\n\r\n";
        let (mut tx, rx) = duplex(1024);
        tx.write_all(raw.as_bytes()).await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut out = Vec::new();
        copy_chunked(&mut reader, &mut out, false).await.unwrap();
        assert_eq!(out, raw.as_bytes());
    }

    #[tokio::test]
    async fn truncated_chunk_is_an_error() {
        let raw = "9\r\nWiki";
        let (mut tx, rx) = duplex(1024);
        tx.write_all(raw.as_bytes()).await.unwrap();
        drop(tx);

        let mut reader = BufReader::new(rx);
        let mut out = Vec::new();
        assert!(copy_chunked(&mut reader, &mut out, false).await.is_err());
    }

    #[test]
    fn bodyless_responses_are_recognized() {
        let head = |line: &str| Head {
            start_line: line.to_string(),
            headers: Vec::new(),
        };

        // Any response to HEAD has no body, whatever the status says.
        assert!(body_is_empty(
            &head("HEAD /big HTTP/1.1"),
            &head("HTTP/1.1 200 OK")
        ));

        let get = head("GET / HTTP/1.1");
        assert!(body_is_empty(&get, &head("HTTP/1.1 204 No Content")));
        assert!(body_is_empty(&get, &head("HTTP/1.1 304 Not Modified")));
        assert!(body_is_empty(&get, &head("HTTP/1.1 100 Continue")));
        assert!(!body_is_empty(&get, &head("HTTP/1.1 200 OK")));
        assert!(!body_is_empty(&get, &head("HTTP/1.1 404 Not Found")));
    }

    #[test]
    fn hop_by_hop_filter() {
        assert!(is_hop_by_hop("Proxy-Connection"));
        assert!(is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("Content-Length"));
        assert!(!is_hop_by_hop("Transfer-Encoding"));
    }
}
