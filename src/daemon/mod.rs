//! Daemon module - background process that keeps the index published.
//!
//! The daemon parses the repository index, copies it into a content-addressed
//! shared segment and keeps that segment current as refresh and poke events
//! arrive. Clients map the segment themselves; the control channel only
//! carries freshness requests.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  SIGHUP / SIGUSR1 / SIGTERM   ┌───────────────────────┐
//! │   signals    │ ────────────────────────────▶ │                       │
//! └──────────────┘                               │   mpsc event queue    │
//! ┌──────────────┐  JSON line per connection     │                       │
//! │ control sock │ ────────────────────────────▶ │                       │
//! └──────────────┘ ◀──── oneshot reply ───────── └───────────┬───────────┘
//!                                                            │ one at a time
//!                                                            ▼
//!                                                ┌───────────────────────┐
//!                                                │      Controller       │
//!                                                │  store → publish →    │
//!                                                │  verify → registry    │
//!                                                └───────────┬───────────┘
//!                                                            │
//!                                                            ▼
//!                                        <namespace>index-<hash> (shared memory)
//! ```

pub mod client;
pub mod controller;
pub mod pidfile;
pub mod protocol;
pub mod server;

pub use client::{daemon_identity, is_daemon_running, poke, read_index, request, send_request};
pub use controller::{Controller, DaemonEvent, DaemonState, Flow, Phase, PokeAck, RefreshOutcome};
pub use pidfile::{Addressing, DaemonIdentity, PidFile};
pub use protocol::{Request, Response};
pub use server::{event_loop, pid_path, run_daemon, socket_path, ExitReason};
