//! End-to-end tests driving the roadvault binary.
//!
//! No test needs root: the "device" is a plain file under a fake device
//! directory and the mount table is a file that already lists the mount
//! point, so the run takes the pre-mounted path and never calls mount(8).

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use roadvault::lock::RunLock;
use tempfile::TempDir;

const DEVICE_UUID: &str = "5E2A-91C0";

fn roadvault_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_roadvault"))
}

struct Env {
    temp: TempDir,
}

impl Env {
    fn new() -> Self {
        let env = Self {
            temp: TempDir::new().unwrap(),
        };
        fs::create_dir_all(env.devices()).unwrap();
        fs::create_dir_all(env.workspace().join("data")).unwrap();
        fs::write(env.mount_table(), "").unwrap();
        fs::write(
            env.config_path(),
            format!(
                "lock_path = {:?}\ndevice_dir = {:?}\nmount_table = {:?}\nsyslog = false\nnotify_timeout_secs = 5\n",
                env.lock_path(),
                env.devices(),
                env.mount_table()
            ),
        )
        .unwrap();
        env
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn workspace(&self) -> PathBuf {
        self.root().join("ws")
    }

    fn devices(&self) -> PathBuf {
        self.root().join("by-uuid")
    }

    fn lock_path(&self) -> PathBuf {
        self.root().join("roadvault.lock")
    }

    fn mount_table(&self) -> PathBuf {
        self.root().join("mounts")
    }

    fn config_path(&self) -> PathBuf {
        self.root().join("roadvault.toml")
    }

    fn mount_point(&self) -> PathBuf {
        self.workspace().join("archive").join("road_test")
    }

    fn add_device(&self) {
        fs::write(self.devices().join(DEVICE_UUID), b"").unwrap();
    }

    /// Pretend the device is already mounted on the mount point.
    fn premount(&self) {
        fs::create_dir_all(self.mount_point()).unwrap();
        let target = fs::canonicalize(self.mount_point()).unwrap();
        fs::write(
            self.mount_table(),
            format!("/dev/sdx1 {} exfat rw 0 0\n", target.display()),
        )
        .unwrap();
    }

    fn add_category(&self, name: &str, files: &[(&str, &str)]) {
        let dir = self.workspace().join("data").join(name);
        for (rel, content) in files {
            let path = dir.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(roadvault_bin());
        for var in [
            "ROADVAULT_WORKSPACE",
            "ROADVAULT_DEVICE_UUID",
            "ROADVAULT_WEBHOOK_URL",
            "ROADVAULT_ARCHIVE_BASE",
            "RUST_LOG",
        ] {
            cmd.env_remove(var);
        }
        cmd.env("ROADVAULT_CONFIG", self.config_path());
        cmd
    }

    fn run(&self, webhook_url: &str) -> Output {
        self.command()
            .env("ROADVAULT_WORKSPACE", self.workspace())
            .env("ROADVAULT_DEVICE_UUID", DEVICE_UUID)
            .env("ROADVAULT_WEBHOOK_URL", webhook_url)
            .output()
            .expect("Failed to run roadvault")
    }

    fn snapshots(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(self.mount_point()) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs
    }
}

/// Accept one webhook POST, answer 200 and hand back the JSON body.
fn webhook_receiver() -> (String, mpsc::Receiver<serde_json::Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        let mut stream = stream;
        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
        if let Ok(json) = serde_json::from_slice(&body) {
            let _ = tx.send(json);
        }
    });
    (url, rx)
}

/// Accept one connection and hold it open without answering.
fn stalled_webhook() -> (String, mpsc::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            let _ = tx.send(stream);
        }
    });
    (url, rx)
}

fn describe(output: &Output) -> String {
    format!(
        "status: {:?}\nstdout: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn test_missing_environment_exits_2_without_lock() {
    let env = Env::new();
    let output = env
        .command()
        .env("ROADVAULT_DEVICE_UUID", DEVICE_UUID)
        .env("ROADVAULT_WEBHOOK_URL", "https://hooks.example.com/x")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ROADVAULT_WORKSPACE"), "{}", describe(&output));
    assert!(!env.lock_path().exists());
}

#[test]
fn test_bad_config_file_exits_2() {
    let env = Env::new();
    fs::write(env.config_path(), "mount_timeout_secs = \"soon\"\n").unwrap();
    let output = env.run("https://hooks.example.com/x");

    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ERROR:"));
}

#[test]
fn test_held_lock_exits_3_and_touches_nothing() {
    let env = Env::new();
    env.add_device();
    let _held = RunLock::acquire(&env.lock_path()).unwrap();

    let output = env.run("https://hooks.example.com/x");

    assert_eq!(output.status.code(), Some(3), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("already in progress"));
    assert!(!env.mount_point().exists());
}

#[test]
fn test_missing_device_exits_4_and_releases_lock() {
    let env = Env::new();
    let output = env.run("https://hooks.example.com/x");

    assert_eq!(output.status.code(), Some(4), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains(DEVICE_UUID));
    assert!(!env.lock_path().exists());
}

#[test]
fn test_premounted_run_archives_and_notifies() {
    let env = Env::new();
    env.add_device();
    env.premount();
    env.add_category("log", &[("run.log", "lidar ok\n"), ("nested/can.log", "frames\n")]);
    env.add_category("core", &[("core.123", "dump")]);
    let (url, rx) = webhook_receiver();

    let output = env.run(&url);

    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(!env.lock_path().exists());

    let snapshots = env.snapshots();
    assert_eq!(snapshots.len(), 1);
    let snapshot = &snapshots[0];
    let name = snapshot.file_name().unwrap().to_string_lossy().into_owned();
    assert_eq!(name.len(), "2026-01-01_10-00-00".len(), "unexpected snapshot name {name}");
    assert_eq!(
        fs::read_to_string(snapshot.join("log/nested/can.log")).unwrap(),
        "frames\n"
    );
    assert_eq!(fs::read_to_string(snapshot.join("core/core.123")).unwrap(), "dump");
    assert!(!snapshot.join("bag").exists());

    let archive_log = fs::read_to_string(snapshot.join("archive.log")).unwrap();
    assert!(archive_log.contains("Skipping bag"), "{archive_log}");

    let body = rx
        .recv_timeout(std::time::Duration::from_secs(10))
        .expect("webhook was not called");
    assert_eq!(body["msg_type"], "text");
    let text = body["content"]["text"].as_str().unwrap();
    assert!(text.starts_with("Archive Status: success\nStart Time: "), "{text}");
    assert!(text.contains("\nEnd Time: "), "{text}");
}

#[test]
fn test_unreachable_webhook_keeps_success() {
    let env = Env::new();
    env.add_device();
    env.premount();
    env.add_category("bag", &[("drive.bag", "bag")]);
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let output = env.run(&format!("http://127.0.0.1:{port}/hook"));

    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert_eq!(env.snapshots().len(), 1);
    assert!(!env.lock_path().exists());
}

#[test]
fn test_sigterm_during_run_exits_130_and_releases_lock() {
    let env = Env::new();
    env.add_device();
    env.premount();
    env.add_category("log", &[("run.log", "lidar ok\n")]);
    let (url, rx) = stalled_webhook();

    let child = env
        .command()
        .env("ROADVAULT_WORKSPACE", env.workspace())
        .env("ROADVAULT_DEVICE_UUID", DEVICE_UUID)
        .env("ROADVAULT_WEBHOOK_URL", &url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn roadvault");

    // The run is parked in the notify step, holding the lock.
    let _held_open = rx
        .recv_timeout(Duration::from_secs(20))
        .expect("webhook was not called");
    assert!(env.lock_path().exists());

    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(130), "{}", describe(&output));
    assert!(!env.lock_path().exists(), "{}", describe(&output));
    assert_eq!(env.snapshots().len(), 1);
}

#[test]
fn test_config_json_reports_settings() {
    let env = Env::new();
    let output = env.command().args(["config", "--json"]).output().unwrap();

    assert!(output.status.success(), "{}", describe(&output));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["settings"]["syslog"], false);
    assert_eq!(json["settings"]["empty_archive"], "success");
    assert_eq!(
        json["lock"]["path"].as_str().unwrap(),
        env.lock_path().to_string_lossy()
    );
    assert_eq!(json["lock"]["held"], false);
}
