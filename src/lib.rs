//! # sockrelay — TCP fan-out relay
//!
//! A host process connects to the relay's well-known port and is allocated a
//! dedicated, dynamically-chosen listening port. Any number of clients then
//! connect to that port and exchange data with the host without the host
//! managing sockets itself. A small text control protocol (SBRP) carried
//! inline in the host's data stream lets the host rename its session, list
//! connections, switch protocol framing, or request relay shutdown.
//!
//! ## Architecture
//!
//! The codebase uses the **actor pattern** for all shared state:
//! - The supervisor owns the master host registry; each host session task
//!   owns its own client registry.
//! - Registries are mutated only inside their owning task's event loop, in
//!   response to Add/Remove messages — there are no locks anywhere.
//! - One task per accept loop and per connection; data and lifecycle events
//!   flow upward over `mpsc` channels, shutdown flows downward over `watch`
//!   signals.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `supervisor` | Host registry, top-level event loop, graceful shutdown |
//! | `host` | Per-host session: port allocation, fan-out/fan-in event loop |
//! | `client` | Per-client session: register, forward, report, deregister |
//! | `reader` | Deadline-bounded read loop producing frames and one error |
//! | `sbrp` | SBRP 1.0 codec: control commands and outbound responses |
//! | `session` | Ids, descriptors, data frames, registry events |
//! | `config` | JSON configuration with coded-default fallback |
//! | `error` | Named failure kinds and quit codes |

mod client;
pub mod config;
pub mod error;
mod host;
mod reader;
pub mod sbrp;
mod session;
mod supervisor;

pub use config::Config;
pub use error::{QuitCode, RelayError};
pub use supervisor::{start, RelayHandle};
