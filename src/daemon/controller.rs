//! Daemon controller - the single owner of daemon state.
//!
//! Every handler here is synchronous and runs to completion; the event loop
//! in [`super::server`] calls [`Controller::handle`] once per event, so no
//! two handlers ever interleave.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::pidfile::process_exists;
use super::protocol::Response;
use crate::config::IdleTimeout;
use crate::error::Result;
use crate::index::{IndexSnapshot, IndexStore, ObjectId};
use crate::publish::{publish_roles, OwnedSegment, Publisher, SegmentRegistry};
use crate::shm::Role;
use crate::verify::verify_segment;
use crate::watcher::{ChangeNotifier, WatchCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Running,
    Stopping,
}

/// Owned by the event loop and nothing else.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonState {
    pub pid: u32,
    pub phase: Phase,
    pub idle_timeout: IdleTimeout,
    pub verify: bool,
    pub detach: bool,
    pub started_at: DateTime<Utc>,
    pub last_cursor: Option<WatchCursor>,
    pub refreshes: u64,
    pub last_error: Option<String>,
}

impl DaemonState {
    pub fn new(idle_timeout: IdleTimeout, verify: bool, detach: bool) -> Self {
        Self {
            pid: std::process::id(),
            phase: Phase::Starting,
            idle_timeout,
            verify,
            detach,
            started_at: Utc::now(),
            last_cursor: None,
            refreshes: 0,
            last_error: None,
        }
    }
}

/// Work posted to the loop by signal handlers and the control socket.
#[derive(Debug)]
pub enum DaemonEvent {
    Refresh {
        reply: Option<oneshot::Sender<Response>>,
    },
    Poke {
        requester: Option<u32>,
        reply: Option<oneshot::Sender<Response>>,
    },
    Status {
        reply: oneshot::Sender<Response>,
    },
    Ping {
        reply: oneshot::Sender<Response>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<Response>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// What one refresh cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub hash: ObjectId,
    pub entries: usize,
    /// Segments created this cycle; zero when every role was already current
    pub published: usize,
}

/// Names of the live segments handed back to a poking client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PokeAck {
    pub index: Option<String>,
    pub base: Option<String>,
    pub sidecar: Option<String>,
    pub refreshed: bool,
}

impl From<PokeAck> for Response {
    fn from(ack: PokeAck) -> Self {
        Response::Fresh {
            index: ack.index,
            base: ack.base,
            sidecar: ack.sidecar,
        }
    }
}

#[derive(Debug, Serialize)]
struct SegmentInfo {
    role: String,
    name: String,
    bytes: usize,
}

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    state: &'a DaemonState,
    namespace: &'a str,
    watching: bool,
    segments: Vec<SegmentInfo>,
}

pub struct Controller {
    store: Box<dyn IndexStore>,
    publisher: Publisher,
    registry: SegmentRegistry,
    notifier: Option<Box<dyn ChangeNotifier>>,
    state: DaemonState,
}

impl Controller {
    pub fn new(
        store: Box<dyn IndexStore>,
        publisher: Publisher,
        notifier: Option<Box<dyn ChangeNotifier>>,
        state: DaemonState,
    ) -> Self {
        Self {
            store,
            publisher,
            registry: SegmentRegistry::new(),
            notifier,
            state,
        }
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn registry(&self) -> &SegmentRegistry {
        &self.registry
    }

    /// Enter `Running` and publish the current index once.
    pub fn start(&mut self) {
        self.state.phase = Phase::Running;
        info!(pid = self.state.pid, idle = %self.state.idle_timeout, "index helper running");
        self.refresh_logged();
    }

    pub fn handle(&mut self, event: DaemonEvent) -> Flow {
        match event {
            DaemonEvent::Refresh { reply } => {
                let response = match self.refresh() {
                    Ok(outcome) => Response::ok(outcome),
                    Err(e) => {
                        warn!(error = %e, "refresh abandoned");
                        Response::error(e.to_string())
                    }
                };
                send(reply, response);
                Flow::Continue
            }
            DaemonEvent::Poke { requester, reply } => {
                let ack = self.poke(requester);
                send(reply, ack.into());
                Flow::Continue
            }
            DaemonEvent::Status { reply } => {
                let _ = reply.send(self.status());
                Flow::Continue
            }
            DaemonEvent::Ping { reply } => {
                let _ = reply.send(Response::Pong);
                Flow::Continue
            }
            DaemonEvent::Shutdown { reply } => {
                info!("shutdown requested");
                self.state.phase = Phase::Stopping;
                send(reply, Response::Goodbye);
                Flow::Stop
            }
        }
    }

    /// Read, publish every role, verify, then install. Any failure drops the
    /// segments created this cycle and leaves the registry as it was.
    pub fn refresh(&mut self) -> Result<RefreshOutcome> {
        let cursor = self.notifier.as_ref().map(|n| n.cursor());
        let result = self.publish_current();
        match &result {
            Ok(outcome) => {
                self.state.refreshes += 1;
                self.state.last_cursor = cursor;
                self.state.last_error = None;
                debug!(hash = %outcome.hash, published = outcome.published, "refresh complete");
            }
            Err(e) => self.state.last_error = Some(e.to_string()),
        }
        result
    }

    fn publish_current(&mut self) -> Result<RefreshOutcome> {
        let snapshot = self.store.read_snapshot()?;

        let mut pending: Vec<(OwnedSegment, &IndexSnapshot)> = Vec::new();
        for (role, source) in publish_roles(&snapshot) {
            if let Some(segment) = self.publisher.publish(role, source, &self.registry)? {
                pending.push((segment, source));
            }
        }
        if self.state.verify {
            for (segment, source) in &pending {
                verify_segment(segment.name(), source)?;
            }
        }

        let published = pending.len();
        for (segment, _) in pending {
            self.registry.install(segment);
        }
        if snapshot.split_base().is_none() && self.registry.release(Role::Base) {
            debug!("index no longer split, base released");
        }

        Ok(RefreshOutcome {
            hash: snapshot.hash(),
            entries: snapshot.len(),
            published,
        })
    }

    fn refresh_logged(&mut self) {
        if let Err(e) = self.refresh() {
            warn!(error = %e, "refresh abandoned");
        }
    }

    /// Refresh unless the notifier says nothing could have changed, then
    /// report the live segment names.
    pub fn poke(&mut self, requester: Option<u32>) -> PokeAck {
        let stale = match (&self.notifier, &self.state.last_cursor) {
            (Some(notifier), Some(last)) => notifier.has_changed_since(last),
            _ => true,
        };
        if stale {
            self.refresh_logged();
        } else {
            debug!("index unchanged since last refresh");
        }

        let pruned = self.registry.release_where(|role| match role {
            Role::WatchSidecar(pid) => !process_exists(pid),
            _ => false,
        });
        if pruned > 0 {
            debug!(pruned, "released sidecars of exited clients");
        }

        let sidecar = match requester {
            Some(pid) => self.publish_sidecar(pid),
            None => None,
        };

        PokeAck {
            index: self.live_name(Role::Main),
            base: self.live_name(Role::Base),
            sidecar,
            refreshed: stale,
        }
    }

    fn publish_sidecar(&mut self, pid: u32) -> Option<String> {
        let cursor = self.state.last_cursor?;
        let role = Role::WatchSidecar(pid);
        let hash = cursor.hash();
        if self.registry.current_hash(role) != Some(hash) {
            let published = self
                .publisher
                .stage_bytes(role, &hash, &cursor.to_bytes())
                .map(|unsealed| unsealed.seal());
            match published {
                Ok(segment) => self.registry.install(segment),
                Err(e) => {
                    warn!(role = %role, error = %e, "sidecar publish failed");
                    return None;
                }
            }
        }
        self.live_name(role)
    }

    fn live_name(&self, role: Role) -> Option<String> {
        self.registry.get(role).map(|s| s.name().to_string())
    }

    pub fn status(&self) -> Response {
        let segments = self
            .registry
            .iter()
            .map(|s| SegmentInfo {
                role: s.role().to_string(),
                name: s.name().to_string(),
                bytes: s.len(),
            })
            .collect();
        Response::ok(StatusReport {
            state: &self.state,
            namespace: self.publisher.namespace(),
            watching: self.notifier.is_some(),
            segments,
        })
    }

    /// Unlink every live segment. Returns how many were released.
    pub fn teardown(&mut self) -> usize {
        self.state.phase = Phase::Stopping;
        let released = self.registry.release_all();
        info!(released, "segments released");
        released
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.teardown();
        }
    }
}

fn send(reply: Option<oneshot::Sender<Response>>, response: Response) {
    if let Some(reply) = reply {
        // the requester may have given up waiting
        let _ = reply.send(response);
    }
}
