//! Host session task.
//!
//! One task per connected host, alive for the host's entire connected
//! lifetime. The task allocates the host's client-facing port, registers
//! with the supervisor, and then runs the relay's core event loop: host
//! payloads fan out to every registered client, client frames fan in to the
//! host socket, and SBRP control commands are applied inline. The actor owns
//! the client registry and the host write half outright — every other party
//! talks to it through channels.

use std::collections::HashMap;
use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{run_client, ClientTask};
use crate::config::Config;
use crate::error::{QuitCode, RelayError};
use crate::reader::run_reader;
use crate::sbrp::{self, ControlCommand};
use crate::session::{ClientEntry, ClientId, DataPack, HostEntry, HostId, RegistryEvent};
use crate::supervisor::{is_transient_accept, ACCEPT_RETRY_DELAY};

/// Everything a host session task needs, handed over at accept.
pub(crate) struct HostTask {
    pub id: HostId,
    pub stream: TcpStream,
    /// Fixed read deadline stamped at accept time.
    pub deadline: Instant,
    pub config: Config,
    /// The supervisor's host-registry channel.
    pub registry: mpsc::Sender<RegistryEvent<HostId, HostEntry>>,
    /// The supervisor's quit channel, fed when the host sends `QUIT_RELAY`.
    pub quit: mpsc::Sender<QuitCode>,
    /// Process-wide shutdown signal.
    pub shutdown: watch::Receiver<bool>,
}

pub(crate) async fn run_host(task: HostTask) {
    let id = task.id;
    let (read_half, mut write_half) = task.stream.into_split();
    let use_protocol = task.config.use_relay_protocol;

    // Allocate the client-facing port before registering anywhere. On
    // exhaustion the host gets an error response and the session ends
    // without ever entering the supervisor registry.
    let (client_listener, port) = match allocate_client_port(
        task.config.client_port_min,
        task.config.client_port_max,
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            warn!(host = %id, error = %e, "host session ends before registration");
            let _ = sbrp::send_error(
                Some(&mut write_half),
                e.quit_code(),
                use_protocol,
                &e.to_string(),
            )
            .await;
            return;
        }
    };

    let entry = HostEntry {
        id,
        assigned_port: port,
        display_name: port.to_string(),
    };
    if task.registry.send(RegistryEvent::Add(entry)).await.is_err() {
        return;
    }

    // A failed port-assignment write is the one write failure that ends
    // host setup.
    if let Err(e) = sbrp::send_port_assignment(&mut write_half, port, use_protocol).await {
        let err = RelayError::WritingToHost(e);
        warn!(host = %id, error = %err, "host setup failed");
        let _ = task.registry.send(RegistryEvent::Remove(id)).await;
        return;
    }
    info!(host = %id, port, "host session ready");

    let capacity = task.config.frame_queue_capacity;
    let (host_shutdown_tx, host_shutdown_rx) = watch::channel(false);
    let (host_frame_tx, host_frame_rx) = mpsc::channel(capacity);
    let (host_err_tx, host_err_rx) = mpsc::channel(1);
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (client_reg_tx, client_reg_rx) = mpsc::channel(capacity);
    let (client_err_tx, client_err_rx) = mpsc::channel(capacity);

    let reader = tokio::spawn(run_reader(
        read_half,
        task.deadline,
        task.config.read_buffer_size,
        host_frame_tx,
        host_err_tx,
        host_shutdown_rx.clone(),
    ));
    let accepter = tokio::spawn(accept_clients(ClientAccept {
        host: id,
        listener: client_listener,
        config: task.config,
        registry: client_reg_tx,
        data: data_tx,
        errors: client_err_tx,
        shutdown: host_shutdown_rx,
    }));

    let mut actor = HostActor {
        id,
        write_half,
        clients: HashMap::new(),
        display_name: port.to_string(),
        use_protocol,
        quit: task.quit,
    };
    actor
        .run(host_frame_rx, data_rx, client_reg_rx, client_err_rx, host_err_rx, task.shutdown)
        .await;

    // Teardown in dependency order: deregister from the supervisor, close
    // every client connection, close the client listener, close the host
    // socket. This runs on every exit path out of the event loop.
    let _ = task.registry.send(RegistryEvent::Remove(id)).await;
    let _ = host_shutdown_tx.send(true);
    actor.clients.clear();
    let _ = accepter.await;
    let _ = reader.await;
    drop(actor);
    info!(host = %id, "host session ended");
}

/// Scan the configured range ascending and bind the first free port.
async fn allocate_client_port(min: u16, max: u16) -> Result<(TcpListener, u16), RelayError> {
    for port in min..=max {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!(port, error = %e, "client port unavailable"),
        }
    }
    Err(RelayError::CannotListenForClient { min, max })
}

// ============================================================================
// Client accept loop
// ============================================================================

struct ClientAccept {
    host: HostId,
    listener: TcpListener,
    config: Config,
    registry: mpsc::Sender<RegistryEvent<ClientId, ClientEntry>>,
    data: mpsc::Sender<DataPack>,
    errors: mpsc::Sender<(ClientId, io::Error)>,
    shutdown: watch::Receiver<bool>,
}

/// Accept clients for one host and spawn a session task per connection.
/// Client ids are stamped here, sequentially from 1, so the registry's
/// single writer never has to hand an id back.
async fn accept_clients(accept: ClientAccept) {
    let mut shutdown = accept.shutdown.clone();
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            result = accept.listener.accept() => match result {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let id = ClientId(next_id);
                    let deadline = Instant::now() + accept.config.connection_timeout();
                    debug!(host = %accept.host, client = %id, %peer, "client connected");
                    tokio::spawn(run_client(ClientTask {
                        id,
                        host: accept.host,
                        stream,
                        deadline,
                        read_buffer_size: accept.config.read_buffer_size,
                        frame_queue_capacity: accept.config.frame_queue_capacity,
                        registry: accept.registry.clone(),
                        data: accept.data.clone(),
                        errors: accept.errors.clone(),
                        shutdown: accept.shutdown.clone(),
                    }));
                }
                Err(e) if is_transient_accept(&e) => {
                    warn!(host = %accept.host, error = %e, "transient client accept failure, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    debug!(host = %accept.host, error = %e, "client listener closed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

// ============================================================================
// Host actor (owns the client registry and the host write half)
// ============================================================================

struct HostActor {
    id: HostId,
    write_half: OwnedWriteHalf,
    clients: HashMap<ClientId, ClientEntry>,
    display_name: String,
    use_protocol: bool,
    quit: mpsc::Sender<QuitCode>,
}

impl HostActor {
    async fn run(
        &mut self,
        mut host_frames: mpsc::Receiver<Vec<u8>>,
        mut client_data: mpsc::Receiver<DataPack>,
        mut client_registry: mpsc::Receiver<RegistryEvent<ClientId, ClientEntry>>,
        mut client_errors: mpsc::Receiver<(ClientId, io::Error)>,
        mut host_errors: mpsc::Receiver<io::Error>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = host_frames.recv() => match frame {
                    Some(frame) => self.handle_host_frame(frame).await,
                    None => {
                        // The host reader is done; its terminal error, if
                        // any, was queued before the frame channel closed.
                        if let Ok(e) = host_errors.try_recv() {
                            let err = RelayError::CannotReceiveDataFromHost(e);
                            info!(host = %self.id, error = %err, "host read ended");
                        }
                        break;
                    }
                },
                pack = client_data.recv() => {
                    if let Some(pack) = pack {
                        self.forward_to_host(pack).await;
                    }
                }
                event = client_registry.recv() => {
                    if let Some(event) = event {
                        self.apply_registry_event(event);
                    }
                }
                report = client_errors.recv() => {
                    if let Some((client, err)) = report {
                        self.report_client_error(client, err).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Dispatch one frame read from the host socket. A quit request goes up
    /// to the supervisor; every other payload — recognized commands after
    /// their side effect, unknown commands, plain data — fans out verbatim
    /// to every registered client.
    async fn handle_host_frame(&mut self, frame: Vec<u8>) {
        match sbrp::parse(&frame) {
            Some(ControlCommand::Quit) => {
                info!(host = %self.id, name = %self.display_name, "host requested relay shutdown");
                // A full buffer means a quit is already on its way up.
                let _ = self.quit.try_send(QuitCode::Ok);
            }
            Some(ControlCommand::Rename(name)) => {
                if name.is_empty() {
                    let err = RelayError::BadlyFormattedSbrpMsg("RENAME_CON requires a name".into());
                    if let Err(e) = sbrp::send_error(
                        Some(&mut self.write_half),
                        err.quit_code(),
                        self.use_protocol,
                        &err.to_string(),
                    )
                    .await
                    {
                        warn!(host = %self.id, error = %e, "error response write failed");
                    }
                    return;
                }
                info!(host = %self.id, from = %self.display_name, to = %name, "host session renamed");
                self.display_name = name;
                self.broadcast(&frame).await;
            }
            Some(ControlCommand::SetProtocolMode(on)) => {
                info!(host = %self.id, protocol = on, "protocol framing switched");
                self.use_protocol = on;
                self.broadcast(&frame).await;
            }
            Some(ControlCommand::ListConns) => {
                // Response format not finalized; the listing is logged and
                // the frame fans out like any other payload.
                let listing: Vec<String> = self
                    .clients
                    .values()
                    .map(|c| format!("{} {}", c.id, c.display_name))
                    .collect();
                info!(host = %self.id, clients = ?listing, "connection listing requested");
                self.broadcast(&frame).await;
            }
            Some(ControlCommand::Unknown) | None => {
                self.broadcast(&frame).await;
            }
        }
    }

    /// Write one client frame to the host socket, unmodified. The source id
    /// exists only for logging.
    async fn forward_to_host(&mut self, pack: DataPack) {
        debug!(host = %self.id, client = %pack.source, len = pack.data.len(), "client frame to host");
        if let Err(e) = self.write_half.write_all(&pack.data).await {
            let err = RelayError::WritingToHost(e);
            warn!(host = %self.id, client = %pack.source, error = %err, "dropping client frame");
        }
    }

    fn apply_registry_event(&mut self, event: RegistryEvent<ClientId, ClientEntry>) {
        match event {
            RegistryEvent::Add(entry) => {
                info!(host = %self.id, client = %entry.id, name = %entry.display_name, "client registered");
                self.clients.insert(entry.id, entry);
            }
            RegistryEvent::Remove(id) => {
                if self.clients.remove(&id).is_some() {
                    info!(host = %self.id, client = %id, "client deregistered");
                }
            }
        }
    }

    /// A client-side failure is reported to the host but never ends the
    /// host loop. The client removes itself through its own Remove message.
    async fn report_client_error(&mut self, client: ClientId, err: io::Error) {
        let err = RelayError::ClientClosure(err);
        warn!(host = %self.id, client = %client, error = %err, "client session failed");
        if let Err(e) = sbrp::send_error(
            Some(&mut self.write_half),
            err.quit_code(),
            self.use_protocol,
            &format!("client {client}: {err}"),
        )
        .await
        {
            warn!(host = %self.id, error = %e, "error response write failed");
        }
    }

    /// Write a frame to every client in the current registry snapshot.
    /// Individual write failures are logged and delivery continues; the
    /// aggregate result is diagnostic only. A failing client stays
    /// registered until its own read loop terminates.
    async fn broadcast(&mut self, frame: &[u8]) -> bool {
        let mut complete = true;
        for entry in self.clients.values_mut() {
            if let Err(e) = entry.writer.write_all(frame).await {
                warn!(host = %self.id, client = %entry.id, error = %e, "broadcast write failed");
                complete = false;
            }
        }
        if !complete {
            debug!(host = %self.id, "broadcast delivered with failures");
        }
        complete
    }
}
