//! Single-instance lock via PID file.
//!
//! Contents are `<tag><pid>`: no tag for plain signal addressing, `S` for the
//! control socket, `W` for the control socket with a watch-integrated daemon.

use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{IndexHelperError, Result};

pub const PID_FILE_NAME: &str = "index-helper.pid";

/// How clients should reach the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Addressing {
    Signal,
    Socket,
    Watch,
}

impl Addressing {
    fn tag(self) -> Option<char> {
        match self {
            Addressing::Signal => None,
            Addressing::Socket => Some('S'),
            Addressing::Watch => Some('W'),
        }
    }

    /// Whether the control socket is available.
    pub fn has_socket(self) -> bool {
        self != Addressing::Signal
    }
}

/// What the PID file records about the running daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DaemonIdentity {
    pub pid: u32,
    pub addressing: Addressing,
}

impl DaemonIdentity {
    pub fn current(addressing: Addressing) -> Self {
        Self {
            pid: std::process::id(),
            addressing,
        }
    }
}

impl fmt::Display for DaemonIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tag) = self.addressing.tag() {
            write!(f, "{}", tag)?;
        }
        write!(f, "{}", self.pid)
    }
}

impl FromStr for DaemonIdentity {
    type Err = IndexHelperError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addressing, digits) = match s.chars().next() {
            Some('S') => (Addressing::Socket, &s[1..]),
            Some('W') => (Addressing::Watch, &s[1..]),
            _ => (Addressing::Signal, s),
        };
        let pid = digits
            .parse::<u32>()
            .map_err(|_| IndexHelperError::Protocol(format!("malformed PID file contents {:?}", s)))?;
        Ok(Self { pid, addressing })
    }
}

/// Held PID file. Not removed on drop: a forked parent must leave it alone.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    identity: DaemonIdentity,
}

impl PidFile {
    /// Take `path` unless it names a live process. Stale or unreadable files
    /// are replaced. Starters serialize on a sibling lock file, so the
    /// liveness check and the write happen as one step and no starter ever
    /// removes a file another one just wrote.
    pub fn acquire(path: impl Into<PathBuf>, identity: DaemonIdentity) -> Result<Self> {
        let path = path.into();
        let _lock = StartLock::claim(&path)?;

        match read_identity(&path)? {
            Some(existing) if process_exists(existing.pid) => {
                return Err(IndexHelperError::DaemonRunning(existing.pid));
            }
            Some(existing) => info!(pid = existing.pid, "replacing stale PID file"),
            None if path.exists() => info!(path = %path.display(), "replacing unreadable PID file"),
            None => {}
        }

        write_identity(&path, &identity)?;
        debug!(path = %path.display(), "PID file created");
        Ok(Self { path, identity })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> DaemonIdentity {
        self.identity
    }

    /// Record a new identity, e.g. after detaching changed the PID.
    pub fn rewrite(&mut self, identity: DaemonIdentity) -> Result<()> {
        write_identity(&self.path, &identity)?;
        self.identity = identity;
        debug!(identity = %identity, "PID file rewritten");
        Ok(())
    }

    /// Remove the file if it still names us. Returns whether it was removed.
    pub fn release(self) -> Result<bool> {
        match read_identity(&self.path)? {
            Some(current) if current.pid == self.identity.pid => {
                std::fs::remove_file(&self.path)?;
                debug!(path = %self.path.display(), "PID file removed");
                Ok(true)
            }
            Some(current) => {
                warn!(pid = current.pid, "PID file now names another daemon, leaving it");
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

/// Replace `path` atomically so readers never see a partial identity.
fn write_identity(path: &Path, identity: &DaemonIdentity) -> Result<()> {
    let tmp = path.with_extension(format!("pid.{}.tmp", std::process::id()));
    std::fs::write(&tmp, format!("{}\n", identity))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Exclusive claim on `<pid file>.lock`, held while a starter decides.
struct StartLock {
    #[cfg_attr(unix, allow(dead_code))]
    path: PathBuf,
    _file: File,
}

impl StartLock {
    /// Blocks until no other starter holds the lock. The lock file itself
    /// stays in place; unlinking it would let two starters lock different
    /// inodes.
    #[cfg(unix)]
    fn claim(pid_path: &Path) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let path = pid_path.with_extension("pid.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
        Ok(Self { path, _file: file })
    }

    /// Without `flock`, the lock is the exclusive existence of the file.
    #[cfg(not(unix))]
    fn claim(pid_path: &Path) -> Result<Self> {
        use std::time::{Duration, Instant};

        let path = pid_path.with_extension("pid.lock");
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok(Self { path, _file: file }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(IndexHelperError::DaemonRunning(0));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(not(unix))]
impl Drop for StartLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Identity recorded at `path`; `None` if the file is missing or malformed.
pub fn read_identity(path: &Path) -> Result<Option<DaemonIdentity>> {
    let mut contents = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut contents)?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    Ok(contents.parse().ok())
}

/// Check if a process with the given PID exists
pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 only checks for existence; EPERM means it exists but isn't ours
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
