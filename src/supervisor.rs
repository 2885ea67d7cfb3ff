//! Relay supervisor.
//!
//! Process-wide lifecycle: the supervisor binds the fixed host port, spawns
//! a host session task per accepted connection, and owns the master host
//! registry. It is the only task that mutates that registry — hosts announce
//! themselves and depart through Add/Remove messages. Receiving any quit
//! code ends the event loop and runs teardown: every registered host is
//! signalled to close, their deregistrations are drained, and the host
//! listener is dropped last so no new host is half-admitted while the rest
//! are being torn down.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{QuitCode, RelayError};
use crate::host::{run_host, HostTask};
use crate::session::{HostEntry, HostId, RegistryEvent};

/// Grace period for hosts to deregister during teardown.
const TEARDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before retrying a transient accept failure.
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handle to a running relay.
pub struct RelayHandle {
    quit: mpsc::Sender<QuitCode>,
    supervisor: JoinHandle<QuitCode>,
}

impl RelayHandle {
    /// Wait for the relay to finish on its own — a host-requested
    /// `QUIT_RELAY` or a fatal condition — and return the final code.
    pub async fn wait(&mut self) -> QuitCode {
        match (&mut self.supervisor).await {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "supervisor task failed");
                QuitCode::Ok
            }
        }
    }

    /// Ask the relay to shut down, wait for teardown, return the final code.
    pub async fn stop(mut self) -> QuitCode {
        let _ = self.quit.send(QuitCode::Ok).await;
        self.wait().await
    }
}

/// Bind the host listener and start the relay.
///
/// Returns the control handle and the actual bound address (pass port 0 to
/// let the OS pick, as tests do). Fails with
/// [`RelayError::CannotListenForHost`] when the configured port is
/// unavailable — fatal, the caller surfaces it and exits.
pub async fn start(config: Config) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let listener = TcpListener::bind(("0.0.0.0", config.host_port))
        .await
        .map_err(|source| RelayError::CannotListenForHost {
            port: config.host_port,
            source,
        })?;
    let addr = listener
        .local_addr()
        .map_err(|source| RelayError::CannotListenForHost {
            port: config.host_port,
            source,
        })?;
    info!(%addr, "relay listening for hosts");

    let (quit_tx, quit_rx) = mpsc::channel(1);
    let (registry_tx, registry_rx) = mpsc::channel(config.frame_queue_capacity);
    let (host_shutdown_tx, host_shutdown_rx) = watch::channel(false);
    let (accept_shutdown_tx, accept_shutdown_rx) = watch::channel(false);

    let accept = tokio::spawn(accept_hosts(HostAccept {
        listener,
        config,
        registry: registry_tx,
        quit: quit_tx.clone(),
        host_shutdown: host_shutdown_rx,
        accept_shutdown: accept_shutdown_rx,
    }));

    let actor = SupervisorActor {
        hosts: HashMap::new(),
        host_shutdown: host_shutdown_tx,
        accept_shutdown: accept_shutdown_tx,
        accept,
    };
    let supervisor = tokio::spawn(actor.run(registry_rx, quit_rx));

    Ok((
        RelayHandle {
            quit: quit_tx,
            supervisor,
        },
        addr,
    ))
}

// ============================================================================
// Host accept loop
// ============================================================================

struct HostAccept {
    listener: TcpListener,
    config: Config,
    registry: mpsc::Sender<RegistryEvent<HostId, HostEntry>>,
    quit: mpsc::Sender<QuitCode>,
    host_shutdown: watch::Receiver<bool>,
    accept_shutdown: watch::Receiver<bool>,
}

/// Accept hosts and spawn a session task per connection. Host ids are
/// stamped here from the accept ordinal and the process start time, and the
/// fixed read deadline is set once at accept.
async fn accept_hosts(mut accept: HostAccept) {
    let start_epoch_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut ordinal: u32 = 0;
    loop {
        tokio::select! {
            result = accept.listener.accept() => match result {
                Ok((stream, peer)) => {
                    ordinal = ordinal.wrapping_add(1);
                    let id = HostId::compose(ordinal, start_epoch_secs);
                    let deadline = Instant::now() + accept.config.connection_timeout();
                    info!(host = %id, %peer, "host connected");
                    tokio::spawn(run_host(HostTask {
                        id,
                        stream,
                        deadline,
                        config: accept.config.clone(),
                        registry: accept.registry.clone(),
                        quit: accept.quit.clone(),
                        shutdown: accept.host_shutdown.clone(),
                    }));
                }
                Err(e) if is_transient_accept(&e) => {
                    warn!(error = %e, "transient host accept failure, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    // The closed-network condition: the loop's normal end.
                    debug!(error = %e, "host listener closed");
                    break;
                }
            },
            _ = accept.accept_shutdown.changed() => break,
        }
    }
}

/// Accept errors worth retrying. Anything else is treated as the
/// closed-network condition that ends an accept loop.
pub(crate) fn is_transient_accept(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

// ============================================================================
// Supervisor actor (owns the host registry)
// ============================================================================

struct SupervisorActor {
    hosts: HashMap<HostId, HostEntry>,
    host_shutdown: watch::Sender<bool>,
    accept_shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

impl SupervisorActor {
    async fn run(
        mut self,
        mut registry: mpsc::Receiver<RegistryEvent<HostId, HostEntry>>,
        mut quit: mpsc::Receiver<QuitCode>,
    ) -> QuitCode {
        let code = loop {
            tokio::select! {
                event = registry.recv() => match event {
                    Some(event) => self.apply_registry_event(event),
                    None => break QuitCode::Ok,
                },
                code = quit.recv() => break code.unwrap_or(QuitCode::Ok),
            }
        };
        info!(code = code.wire_name(), "relay shutting down");
        self.teardown(registry).await;
        code
    }

    fn apply_registry_event(&mut self, event: RegistryEvent<HostId, HostEntry>) {
        match event {
            RegistryEvent::Add(entry) => {
                info!(
                    host = %entry.id,
                    port = entry.assigned_port,
                    name = %entry.display_name,
                    "host registered"
                );
                self.hosts.insert(entry.id, entry);
            }
            RegistryEvent::Remove(id) => {
                if self.hosts.remove(&id).is_some() {
                    info!(host = %id, "host deregistered");
                }
            }
        }
    }

    /// Close every host still in the registry, then the host listener.
    async fn teardown(mut self, mut registry: mpsc::Receiver<RegistryEvent<HostId, HostEntry>>) {
        let _ = self.host_shutdown.send(true);
        let drained = tokio::time::timeout(TEARDOWN_DRAIN_TIMEOUT, async {
            while !self.hosts.is_empty() {
                match registry.recv().await {
                    Some(event) => self.apply_registry_event(event),
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.hosts.len(),
                "hosts did not deregister before the drain timeout"
            );
        }
        // The accept loop's exit drops the host listener.
        let _ = self.accept_shutdown.send(true);
        let _ = (&mut self.accept).await;
        debug!("relay teardown complete");
    }
}
