//! Connection read loop.
//!
//! Turns one socket read half into a sequence of owned frames on a channel,
//! plus exactly one terminal error. A zero-byte read means the peer closed
//! the connection and is reported as a terminal error like any other; the
//! loop never retries after an error. Every read is bounded by the fixed
//! deadline stamped at accept time — the deadline is not renewed on
//! activity, so an idle or stalled peer is cut off deterministically.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};

/// Read frames from `conn` until a terminal error or shutdown.
///
/// Each successful read of `n > 0` bytes is copied into a fresh buffer and
/// sent on `frames`. The terminal error is sent once on `errors`; nothing is
/// sent there when the loop ends through `shutdown` or because the frame
/// receiver went away.
pub(crate) async fn run_reader<R>(
    mut conn: R,
    deadline: Instant,
    buffer_size: usize,
    frames: mpsc::Sender<Vec<u8>>,
    errors: mpsc::Sender<io::Error>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let result = tokio::select! {
            result = timeout_at(deadline, conn.read(&mut buf)) => result,
            _ = shutdown.changed() => return,
        };
        let err = match result {
            Ok(Ok(0)) => io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"),
            Ok(Ok(n)) => {
                if frames.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed"),
        };
        let _ = errors.send(err).await;
        return;
    }
}
