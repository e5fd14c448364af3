//! End-to-end tests driving the real `index-helper` binary.

#![cfg(target_os = "linux")]

use index_helper::daemon::pidfile::read_identity;
use index_helper::index::{IndexEntry, IndexSnapshot, ObjectId};
use index_helper::shm::{self, Role, SegmentName};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);
/// With `--exit-after 1s`, the daemon is gone this long after its last event.
const IDLE_BOUND: Duration = Duration::from_millis(1100);

struct Repo {
    dir: TempDir,
    namespace: String,
}

impl Repo {
    fn new(tag: &str, names: &[&str]) -> (Self, IndexSnapshot) {
        let repo = Repo {
            dir: TempDir::new().unwrap(),
            namespace: format!("ihe2e{}-{}-", std::process::id(), tag),
        };
        let snap = repo.write_index(names);
        (repo, snap)
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write_index(&self, names: &[&str]) -> IndexSnapshot {
        let entries = names
            .iter()
            .map(|n| IndexEntry::new(*n, 0o100644, ObjectId::digest(n.as_bytes())))
            .collect();
        let snap = IndexSnapshot::from_entries(2, entries, vec![]);
        std::fs::write(self.path().join("index"), snap.as_bytes()).unwrap();
        snap
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_index-helper"));
        cmd.arg("--git-dir")
            .arg(self.path())
            .arg("--namespace")
            .arg(&self.namespace);
        cmd
    }

    fn spawn_daemon(&self, extra: &[&str]) -> Child {
        self.command()
            .arg("daemon")
            .args(extra)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command().args(args).output().unwrap()
    }

    fn main_segment(&self, snap: &IndexSnapshot) -> SegmentName {
        SegmentName::new(&self.namespace, Role::Main, &snap.hash()).unwrap()
    }

    fn pid_file(&self) -> std::path::PathBuf {
        self.path().join("index-helper.pid")
    }

    fn socket(&self) -> std::path::PathBuf {
        self.path().join("index-helper.sock")
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

fn wait_exit(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("daemon did not exit in time");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Wait for exit, failing if it takes longer than `bound` from `since`.
fn wait_exit_within(child: &mut Child, since: Instant, bound: Duration) -> ExitStatus {
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            let elapsed = since.elapsed();
            assert!(elapsed <= bound, "daemon exited after {:?}", elapsed);
            return status;
        }
        if since.elapsed() > bound {
            let _ = child.kill();
            panic!("daemon still running {:?} after its last event", since.elapsed());
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn segment_exists(name: &SegmentName) -> bool {
    shm::open_readonly(name.as_str()).is_ok()
}

#[test]
fn test_refresh_then_read_from_another_process() {
    let (repo, snap) = Repo::new("a", &["README", "src/lib.rs", "src/main.rs"]);
    let mut daemon = repo.spawn_daemon(&["--exit-after", "1s", "--strict"]);
    assert!(wait_until(|| repo.socket().exists() && repo.pid_file().exists()));

    let out = repo.run(&["refresh"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let segment = repo.main_segment(&snap);
    assert!(segment_exists(&segment));

    let out = repo.run(&["read", "--json"]);
    // the read's poke is the daemon's last event
    let last_event = Instant::now();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["source"], "shared_memory");
    assert_eq!(report["hash"], snap.hash().to_hex());
    let entries = report["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    for (json, entry) in entries.iter().zip(snap.entries()) {
        assert_eq!(json["name"], entry.name_lossy().as_ref());
        assert_eq!(json["mode"], "100644");
        assert_eq!(json["oid"], entry.oid.to_hex());
    }

    let status = wait_exit_within(&mut daemon, last_event, IDLE_BOUND);
    assert_eq!(status.code(), Some(0));
    assert!(!segment_exists(&segment));
    assert!(!repo.pid_file().exists());
    assert!(!repo.socket().exists());
}

#[test]
fn test_idle_exit_leaves_nothing_behind() {
    let (repo, snap) = Repo::new("b", &["only"]);
    let mut daemon = repo.spawn_daemon(&["--exit-after", "1s"]);
    let segment = repo.main_segment(&snap);
    // the idle timer starts after the initial publish
    assert!(wait_until(|| segment_exists(&segment)));
    let published = Instant::now();

    let status = wait_exit_within(&mut daemon, published, IDLE_BOUND);
    assert_eq!(status.code(), Some(0));
    assert!(!segment_exists(&segment));
    assert!(!repo.pid_file().exists());
}

#[test]
fn test_detach_hands_pid_file_to_child() {
    let (repo, snap) = Repo::new("g", &["a", "b"]);
    let mut parent = repo.spawn_daemon(&["--detach", "--exit-after", "1s"]);
    let parent_pid = parent.id();

    let started = Instant::now();
    let status = wait_exit(&mut parent);
    assert_eq!(status.code(), Some(0));
    assert!(started.elapsed() < Duration::from_secs(1));

    let mut child_pid = None;
    assert!(wait_until(|| {
        child_pid = read_identity(&repo.pid_file())
            .ok()
            .flatten()
            .map(|identity| identity.pid)
            .filter(|pid| *pid != parent_pid);
        child_pid.is_some()
    }));
    let child_pid = child_pid.unwrap();
    assert!(pid_alive(child_pid));

    let segment = repo.main_segment(&snap);
    assert!(wait_until(|| segment_exists(&segment)));

    assert!(wait_until(|| !repo.pid_file().exists()));
    assert!(!segment_exists(&segment));
    assert!(!repo.socket().exists());
}

#[test]
fn test_second_daemon_refused() {
    let (repo, _) = Repo::new("c", &["a"]);
    let mut first = repo.spawn_daemon(&["--exit-after", "30s"]);
    assert!(wait_until(|| repo.socket().exists()));

    let second = repo
        .command()
        .args(["daemon", "--exit-after", "30s"])
        .output()
        .unwrap();
    assert!(!second.status.success());
    assert!(String::from_utf8_lossy(&second.stderr).contains("already running"));

    let out = repo.run(&["stop"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(wait_exit(&mut first).code(), Some(0));
    assert!(!repo.pid_file().exists());
}

#[test]
fn test_sighup_republishes_new_index() {
    let (repo, first) = Repo::new("d", &["one"]);
    let mut daemon = repo.spawn_daemon(&["--exit-after", "30s", "--no-watch"]);
    let first_segment = repo.main_segment(&first);
    assert!(wait_until(|| segment_exists(&first_segment)));

    let second = repo.write_index(&["one", "two"]);
    let pid = daemon.id() as i32;
    assert_eq!(unsafe { libc::kill(pid, libc::SIGHUP) }, 0);

    let second_segment = repo.main_segment(&second);
    assert!(wait_until(|| segment_exists(&second_segment)));
    assert!(!segment_exists(&first_segment));

    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);
    assert_eq!(wait_exit(&mut daemon).code(), Some(0));
    assert!(!segment_exists(&second_segment));
}

#[test]
fn test_status_reports_live_segment() {
    let (repo, snap) = Repo::new("e", &["x", "y"]);
    let mut daemon = repo.spawn_daemon(&["--exit-after", "30s"]);
    assert!(wait_until(|| segment_exists(&repo.main_segment(&snap))));

    let out = repo.run(&["status"]);
    assert!(out.status.success());
    let status: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["status"], "ok");
    assert_eq!(status["data"]["state"]["phase"], "running");
    assert_eq!(
        status["data"]["segments"][0]["name"],
        repo.main_segment(&snap).as_str()
    );

    let out = repo.run(&["poke"]);
    assert!(out.status.success());
    let fresh: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(fresh["status"], "fresh");
    assert_eq!(fresh["index"], repo.main_segment(&snap).as_str());

    repo.run(&["stop"]);
    assert_eq!(wait_exit(&mut daemon).code(), Some(0));
}

#[test]
fn test_read_without_daemon_uses_disk() {
    let (repo, _) = Repo::new("f", &["a", "b"]);
    let out = repo.run(&["read", "--json"]);
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["source"], "disk");
    assert_eq!(report["entries"].as_array().unwrap().len(), 2);
}
