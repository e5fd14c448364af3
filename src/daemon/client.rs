//! Client side of the control channel.
//!
//! Clients ask for freshness and then read segments themselves. The wait for
//! an acknowledgement is always bounded; on timeout the caller falls back to
//! the durable index file.

use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::pidfile::{process_exists, read_identity, DaemonIdentity};
use super::protocol::{Request, Response};
use super::server::pid_path;
use crate::config::HelperConfig;
use crate::error::{IndexHelperError, Result};
use crate::publish::{load_index, LoadedIndex};

/// Identity of the live daemon for `git_dir`, if there is one.
pub fn daemon_identity(git_dir: &Path) -> Option<DaemonIdentity> {
    read_identity(&pid_path(git_dir))
        .ok()
        .flatten()
        .filter(|id| process_exists(id.pid))
}

/// Check if daemon is running by checking PID file and process.
pub fn is_daemon_running(git_dir: &Path) -> bool {
    daemon_identity(git_dir).is_some()
}

/// Send a request to the daemon and wait at most `timeout` for the reply.
#[cfg(unix)]
pub fn send_request(git_dir: &Path, request: &Request, timeout: Duration) -> Result<Response> {
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(super::server::socket_path(git_dir))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let request_json = serde_json::to_string(request)?;
    writeln!(stream, "{}", request_json)?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    if reader.read_line(&mut response_line)? == 0 {
        return Err(IndexHelperError::Protocol(
            "daemon closed the connection without replying".to_string(),
        ));
    }
    Ok(serde_json::from_str(&response_line)?)
}

#[cfg(not(unix))]
pub fn send_request(_git_dir: &Path, _request: &Request, _timeout: Duration) -> Result<Response> {
    Err(IndexHelperError::Unsupported)
}

/// Deliver `request` over the socket, or as a signal when the daemon only
/// listens for signals.
pub fn request(git_dir: &Path, request: &Request, timeout: Duration) -> Result<Response> {
    let identity = daemon_identity(git_dir)
        .ok_or_else(|| IndexHelperError::Protocol("no index helper running".to_string()))?;
    if identity.addressing.has_socket() {
        send_request(git_dir, request, timeout)
    } else {
        signal(identity, request)
    }
}

#[cfg(unix)]
fn signal(identity: DaemonIdentity, request: &Request) -> Result<Response> {
    let (signo, label) = match request {
        Request::Refresh => (libc::SIGHUP, "SIGHUP"),
        Request::Poke { .. } => (libc::SIGUSR1, "SIGUSR1"),
        Request::Shutdown => (libc::SIGTERM, "SIGTERM"),
        Request::Status | Request::Ping => {
            return Err(IndexHelperError::Protocol(
                "daemon has no control socket".to_string(),
            ))
        }
    };
    let pid = i32::try_from(identity.pid)
        .map_err(|_| IndexHelperError::Protocol(format!("bad PID {}", identity.pid)))?;
    if unsafe { libc::kill(pid, signo) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    debug!(pid, signal = label, "signalled daemon");
    Ok(Response::ok(serde_json::json!({ "signalled": label, "pid": identity.pid })))
}

#[cfg(not(unix))]
fn signal(_identity: DaemonIdentity, _request: &Request) -> Result<Response> {
    Err(IndexHelperError::Unsupported)
}

/// Ask the daemon to make the published index fresh, waiting at most
/// `timeout` for the acknowledgement.
pub fn poke(git_dir: &Path, timeout: Duration) -> Result<Response> {
    let request = Request::Poke {
        pid: Some(std::process::id()),
    };
    self::request(git_dir, &request, timeout)
}

/// Load the index the way a short-lived client should: poke a running
/// daemon within the configured bound, then read the shared copy, falling
/// back to the durable file.
pub fn read_index(git_dir: &Path, config: &HelperConfig) -> Result<LoadedIndex> {
    if is_daemon_running(git_dir) {
        match poke(git_dir, config.poke_timeout()) {
            Ok(Response::Fresh { index, .. }) => debug!(?index, "daemon acknowledged poke"),
            Ok(other) => debug!(?other, "unexpected poke reply"),
            Err(e) => debug!(error = %e, "poke failed, continuing without it"),
        }
    }
    load_index(git_dir, &config.namespace, config.shared_checksum)
}
