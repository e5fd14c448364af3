//! Daemon server - startup, the event loop and its asynchronous front ends.
//!
//! Signal handlers and control-socket connections never touch daemon state;
//! they post a [`DaemonEvent`] and, for socket clients, wait on a oneshot for
//! the loop's reply.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::controller::{Controller, DaemonEvent, DaemonState, Flow};
use super::pidfile::{Addressing, DaemonIdentity, PidFile, PID_FILE_NAME};
use super::protocol::{Request, Response};
use crate::config::HelperConfig;
use crate::error::Result;
use crate::index::FileIndexStore;
use crate::publish::Publisher;
use crate::shm;
use crate::watcher::{ChangeNotifier, IndexWatcher};

pub const SOCKET_FILE_NAME: &str = "index-helper.sock";

/// Time a queued shutdown reply gets to reach its connection after teardown.
const REPLY_DRAIN: Duration = Duration::from_millis(100);

/// Control socket path inside the repository metadata directory
pub fn socket_path(git_dir: &Path) -> PathBuf {
    git_dir.join(SOCKET_FILE_NAME)
}

/// PID file path
pub fn pid_path(git_dir: &Path) -> PathBuf {
    git_dir.join(PID_FILE_NAME)
}

/// Why the event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Idle,
    Shutdown,
    Disconnected,
}

/// Run the daemon for `git_dir` until idle timeout or shutdown.
///
/// Fails before entering the loop when shared memory is unavailable or
/// another daemon holds the PID file.
pub fn run_daemon(git_dir: &Path, config: &HelperConfig) -> Result<()> {
    config.validate()?;
    shm::probe(&config.namespace)?;

    let planned = if cfg!(unix) {
        if config.watch {
            Addressing::Watch
        } else {
            Addressing::Socket
        }
    } else {
        Addressing::Signal
    };
    let mut pid_file = PidFile::acquire(pid_path(git_dir), DaemonIdentity::current(planned))?;
    info!(git_dir = %git_dir.display(), "PID file acquired");

    if config.detach {
        if let Err(e) = detach() {
            release_pid_file(pid_file);
            return Err(e);
        }
        if let Err(e) = pid_file.rewrite(DaemonIdentity::current(planned)) {
            release_pid_file(pid_file);
            return Err(e);
        }
    }

    let result = serve(git_dir, config, &mut pid_file);
    release_pid_file(pid_file);
    info!("index helper stopped");
    result
}

fn release_pid_file(pid_file: PidFile) {
    if let Err(e) = pid_file.release() {
        warn!(error = %e, "failed to remove PID file");
    }
}

fn serve(git_dir: &Path, config: &HelperConfig, pid_file: &mut PidFile) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve_async(git_dir, config, pid_file))
}

async fn serve_async(git_dir: &Path, config: &HelperConfig, pid_file: &mut PidFile) -> Result<()> {
    let (events, queue) = mpsc::unbounded_channel();
    spawn_signal_listeners(&events)?;

    let socket = match bind_control_socket(&socket_path(git_dir), events.clone()) {
        Ok(path) => path,
        Err(e) => {
            warn!(error = %e, "control socket unavailable, signals only");
            None
        }
    };

    let notifier: Option<Box<dyn ChangeNotifier>> = if config.watch {
        match IndexWatcher::start(git_dir) {
            Ok(watcher) => Some(Box::new(watcher)),
            Err(e) => {
                warn!(error = %e, "index watcher failed to start");
                None
            }
        }
    } else {
        None
    };

    let addressing = match (&socket, &notifier) {
        (None, _) => Addressing::Signal,
        (Some(_), Some(_)) => Addressing::Watch,
        (Some(_), None) => Addressing::Socket,
    };
    if addressing != pid_file.identity().addressing {
        if let Err(e) = pid_file.rewrite(DaemonIdentity::current(addressing)) {
            warn!(error = %e, "failed to update PID file addressing");
        }
    }

    let mut controller = Controller::new(
        Box::new(FileIndexStore::new(git_dir)),
        Publisher::new(config.namespace.clone()),
        notifier,
        DaemonState::new(config.exit_after, config.strict, config.detach),
    );

    let reason = event_loop(&mut controller, queue).await;
    info!(?reason, "leaving event loop");

    controller.teardown();
    if let Some(path) = socket {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(error = %e, socket = %path.display(), "failed to remove control socket");
        }
    }
    // only a shutdown request can leave a reply in flight
    if reason == ExitReason::Shutdown {
        tokio::time::sleep(REPLY_DRAIN).await;
    }
    drop(events);
    Ok(())
}

/// Handle events one at a time until shutdown, idle timeout, or every sender
/// is gone. The controller publishes once before the first wait.
pub async fn event_loop(
    controller: &mut Controller,
    mut events: mpsc::UnboundedReceiver<DaemonEvent>,
) -> ExitReason {
    controller.start();
    loop {
        let next = match controller.state().idle_timeout.duration() {
            Some(idle) => match tokio::time::timeout(idle, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    info!(idle = %controller.state().idle_timeout, "idle timeout reached");
                    return ExitReason::Idle;
                }
            },
            None => events.recv().await,
        };
        match next {
            Some(event) => {
                if controller.handle(event) == Flow::Stop {
                    return ExitReason::Shutdown;
                }
            }
            None => return ExitReason::Disconnected,
        }
    }
}

#[cfg(unix)]
fn spawn_signal_listeners(events: &mpsc::UnboundedSender<DaemonEvent>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let routes: [(SignalKind, &'static str, fn() -> DaemonEvent); 4] = [
        (SignalKind::hangup(), "SIGHUP", || DaemonEvent::Refresh { reply: None }),
        (SignalKind::user_defined1(), "SIGUSR1", || DaemonEvent::Poke {
            requester: None,
            reply: None,
        }),
        (SignalKind::interrupt(), "SIGINT", || DaemonEvent::Shutdown { reply: None }),
        (SignalKind::terminate(), "SIGTERM", || DaemonEvent::Shutdown { reply: None }),
    ];

    for (kind, label, make) in routes {
        let mut stream = signal(kind)?;
        let events = events.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!(signal = label, "signal received");
                if events.send(make()).is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_listeners(events: &mpsc::UnboundedSender<DaemonEvent>) -> Result<()> {
    let events = events.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(DaemonEvent::Shutdown { reply: None });
        }
    });
    Ok(())
}

#[cfg(unix)]
fn bind_control_socket(
    path: &Path,
    events: mpsc::UnboundedSender<DaemonEvent>,
) -> Result<Option<PathBuf>> {
    use tokio::net::UnixListener;

    // we hold the PID file, so any existing socket is stale
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(socket = %path.display(), "control socket listening");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let events = events.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, events).await {
                            debug!(error = %e, "client handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            }
        }
    });
    Ok(Some(path.to_path_buf()))
}

#[cfg(not(unix))]
fn bind_control_socket(
    _path: &Path,
    _events: mpsc::UnboundedSender<DaemonEvent>,
) -> Result<Option<PathBuf>> {
    Ok(None)
}

/// Handle a single client connection: one request line, one response line.
#[cfg(unix)]
async fn handle_client(
    stream: tokio::net::UnixStream,
    events: mpsc::UnboundedSender<DaemonEvent>,
) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => {
            debug!(?request, "received request");
            dispatch(request, &events).await
        }
        Err(e) => Response::error(format!("bad request: {}", e)),
    };

    let mut out = serde_json::to_string(&response)?;
    out.push('\n');
    write_half.write_all(out.as_bytes()).await?;
    Ok(())
}

/// Post `request` to the loop and wait for its reply.
async fn dispatch(request: Request, events: &mpsc::UnboundedSender<DaemonEvent>) -> Response {
    let (reply, answer) = oneshot::channel();
    let event = match request {
        Request::Poke { pid } => DaemonEvent::Poke {
            requester: pid,
            reply: Some(reply),
        },
        Request::Refresh => DaemonEvent::Refresh { reply: Some(reply) },
        Request::Status => DaemonEvent::Status { reply },
        Request::Ping => DaemonEvent::Ping { reply },
        Request::Shutdown => DaemonEvent::Shutdown { reply: Some(reply) },
    };
    if events.send(event).is_err() {
        return Response::error("daemon is shutting down");
    }
    answer
        .await
        .unwrap_or_else(|_| Response::error("daemon is shutting down"))
}

/// Fork into the background. The parent exits immediately without running
/// any cleanup; the child continues as a session leader with stdio on
/// `/dev/null`.
#[cfg(unix)]
fn detach() -> Result<()> {
    // no runtime or watcher threads exist yet, so forking is safe here
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error().into()),
        0 => {
            if unsafe { libc::setsid() } == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
            redirect_stdio()?;
            Ok(())
        }
        _ => unsafe { libc::_exit(0) },
    }
}

#[cfg(unix)]
fn redirect_stdio() -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in 0..=2 {
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn detach() -> Result<()> {
    warn!("detaching is not supported on this platform, staying in the foreground");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::IdleTimeout;
    use crate::index::{IndexEntry, IndexSnapshot, ObjectId};
    use crate::shm::Role;
    use tempfile::TempDir;

    fn write_index(git_dir: &Path, names: &[&str]) -> IndexSnapshot {
        let entries = names
            .iter()
            .map(|n| IndexEntry::new(*n, 0o100644, ObjectId::digest(n.as_bytes())))
            .collect();
        let snap = IndexSnapshot::from_entries(2, entries, vec![]);
        std::fs::write(git_dir.join("index"), snap.as_bytes()).unwrap();
        snap
    }

    fn controller(git_dir: &Path, tag: &str, idle: IdleTimeout) -> Controller {
        Controller::new(
            Box::new(FileIndexStore::new(git_dir)),
            Publisher::new(format!("ihsrv{}-{}-", std::process::id(), tag)),
            None,
            DaemonState::new(idle, true, false),
        )
    }

    #[test]
    fn test_paths() {
        let dir = Path::new("/repo/.git");
        assert_eq!(socket_path(dir), dir.join("index-helper.sock"));
        assert_eq!(pid_path(dir), dir.join("index-helper.pid"));
    }

    #[tokio::test]
    async fn test_idle_timeout_exits_loop() {
        let tmp = TempDir::new().unwrap();
        write_index(tmp.path(), &["a"]);
        let mut ctl = controller(tmp.path(), "a", IdleTimeout::from_duration(Duration::from_millis(50)));
        let (_events, queue) = mpsc::unbounded_channel();

        let reason = event_loop(&mut ctl, queue).await;
        assert_eq!(reason, ExitReason::Idle);
        assert_eq!(ctl.registry().len(), 1);
        ctl.teardown();
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_handled_in_order() {
        let tmp = TempDir::new().unwrap();
        let first = write_index(tmp.path(), &["a"]);
        let mut ctl = controller(tmp.path(), "b", IdleTimeout::UNBOUNDED);
        let (events, queue) = mpsc::unbounded_channel();

        let (status_tx, status_rx) = oneshot::channel();
        let (bye_tx, bye_rx) = oneshot::channel();
        events.send(DaemonEvent::Status { reply: status_tx }).unwrap();
        events.send(DaemonEvent::Shutdown { reply: Some(bye_tx) }).unwrap();

        let reason = event_loop(&mut ctl, queue).await;
        assert_eq!(reason, ExitReason::Shutdown);
        assert!(matches!(status_rx.await.unwrap(), Response::Ok { .. }));
        assert_eq!(bye_rx.await.unwrap(), Response::Goodbye);
        assert_eq!(ctl.registry().current_hash(Role::Main), Some(first.hash()));
    }

    #[tokio::test]
    async fn test_refresh_event_replies_with_outcome() {
        let tmp = TempDir::new().unwrap();
        write_index(tmp.path(), &["a"]);
        let mut ctl = controller(tmp.path(), "c", IdleTimeout::UNBOUNDED);
        let (events, queue) = mpsc::unbounded_channel();

        let second = write_index(tmp.path(), &["a", "b"]);
        let (reply, answer) = oneshot::channel();
        events.send(DaemonEvent::Refresh { reply: Some(reply) }).unwrap();
        drop(events);

        assert_eq!(event_loop(&mut ctl, queue).await, ExitReason::Disconnected);
        assert!(matches!(answer.await.unwrap(), Response::Ok { .. }));
        assert_eq!(ctl.registry().current_hash(Role::Main), Some(second.hash()));
    }

    #[tokio::test]
    async fn test_dispatch_after_loop_gone() {
        let (events, queue) = mpsc::unbounded_channel();
        drop(queue);
        let response = dispatch(Request::Ping, &events).await;
        assert!(matches!(response, Response::Error { .. }));
    }
}
