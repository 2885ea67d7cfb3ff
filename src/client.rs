//! Client session task.
//!
//! One task per client connection of one host. The task registers with its
//! host's client registry before any data is relayed, forwards every inbound
//! frame tagged with its own id, reports a terminal read error on the host's
//! client-error channel, and deregisters before its socket closes. All of
//! that flows over channels owned by the host's event loop — the client task
//! never touches the host's registry directly.

use std::io;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::reader::run_reader;
use crate::session::{ClientEntry, ClientId, DataPack, HostId, RegistryEvent};

/// Everything a client session task needs, handed over at spawn.
pub(crate) struct ClientTask {
    pub id: ClientId,
    pub host: HostId,
    pub stream: TcpStream,
    /// Fixed read deadline stamped at accept time.
    pub deadline: Instant,
    pub read_buffer_size: usize,
    pub frame_queue_capacity: usize,
    /// The owning host's client-registry channel.
    pub registry: mpsc::Sender<RegistryEvent<ClientId, ClientEntry>>,
    /// The owning host's client→host data channel.
    pub data: mpsc::Sender<DataPack>,
    /// The owning host's client-error channel.
    pub errors: mpsc::Sender<(ClientId, io::Error)>,
    /// Host-scoped shutdown signal.
    pub shutdown: watch::Receiver<bool>,
}

pub(crate) async fn run_client(task: ClientTask) {
    let display_name = task
        .stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| task.id.to_string());
    let (read_half, write_half) = task.stream.into_split();

    // Register before relaying anything, so the host's broadcast set can
    // include this client from its first frame onward.
    let entry = ClientEntry {
        id: task.id,
        display_name,
        writer: write_half,
    };
    if task.registry.send(RegistryEvent::Add(entry)).await.is_err() {
        // Host already tearing down; nothing to relay to.
        return;
    }

    let (frame_tx, mut frame_rx) = mpsc::channel(task.frame_queue_capacity);
    let (err_tx, mut err_rx) = mpsc::channel(1);
    tokio::spawn(run_reader(
        read_half,
        task.deadline,
        task.read_buffer_size,
        frame_tx,
        err_tx,
        task.shutdown.clone(),
    ));

    let mut shutdown = task.shutdown;
    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(data) => {
                    debug!(host = %task.host, client = %task.id, len = data.len(), "client frame");
                    let pack = DataPack { source: task.id, data };
                    if task.data.send(pack).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Reader is done. Its terminal error, if any, was queued
                    // before the frame channel closed.
                    if let Ok(err) = err_rx.try_recv() {
                        let _ = task.errors.send((task.id, err)).await;
                    }
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    // Deregister before the socket closes.
    let _ = task.registry.send(RegistryEvent::Remove(task.id)).await;
    debug!(host = %task.host, client = %task.id, "client session ended");
}
