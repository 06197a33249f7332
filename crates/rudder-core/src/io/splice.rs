//! Bidirectional byte splice between a client stream and an outbound stream.
//!
//! Each direction is a plain copy loop feeding a shared byte counter. EOF on
//! one direction shuts down the peer's write half, so the opposite direction
//! can drain before the splice completes. Idleness is detected by a watchdog
//! that wakes every `idle_timeout` and gives up when neither counter has
//! moved since its last look; an idle connection is therefore closed after
//! at most two periods, and the counters double as the transfer stats for
//! every exit path.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes transferred in each direction during a splice.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceStats {
    /// Bytes from the client to the outbound.
    pub client_to_remote: u64,
    /// Bytes from the outbound back to the client.
    pub remote_to_client: u64,
}

/// Copy one direction until EOF, counting transferred bytes.
///
/// On EOF the writer is shut down (half-close) so the peer sees the end of
/// this direction while its own direction keeps flowing.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    transferred: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        transferred.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Splice `client` and `remote` together until both directions complete.
///
/// Returns the per-direction byte counts. A mid-stream I/O error on either
/// direction ends the splice with that error; dropping the streams then
/// closes both sides. When neither direction moves any bytes for an idle
/// period the splice returns with whatever was transferred.
pub async fn splice<A, B>(
    client: A,
    remote: B,
    idle_timeout: Duration,
    buffer_size: usize,
) -> io::Result<SpliceStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let up_bytes = AtomicU64::new(0);
    let down_bytes = AtomicU64::new(0);

    let (client_r, client_w) = tokio::io::split(client);
    let (remote_r, remote_w) = tokio::io::split(remote);

    let transfer = async {
        tokio::try_join!(
            pump(client_r, remote_w, buffer_size, &up_bytes),
            pump(remote_r, client_w, buffer_size, &down_bytes),
        )
        .map(|_| ())
    };
    tokio::pin!(transfer);

    let stats = |up: &AtomicU64, down: &AtomicU64| SpliceStats {
        client_to_remote: up.load(Ordering::Relaxed),
        remote_to_client: down.load(Ordering::Relaxed),
    };

    let mut last_seen = (0u64, 0u64);
    loop {
        tokio::select! {
            result = &mut transfer => {
                result?;
                return Ok(stats(&up_bytes, &down_bytes));
            }
            _ = tokio::time::sleep(idle_timeout) => {
                let moved = (
                    up_bytes.load(Ordering::Relaxed),
                    down_bytes.load(Ordering::Relaxed),
                );
                if moved == last_seen {
                    return Ok(stats(&up_bytes, &down_bytes));
                }
                last_seen = moved;
            }
        }
    }
}
