#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use folder_integrity_monitor::core::errors::{FimError, Result};
use folder_integrity_monitor::integrity::checker::{CheckerOptions, FolderIntegrityChecker};
use folder_integrity_monitor::integrity::checksum::{ChecksumProvider, Sha512Checksums};
use folder_integrity_monitor::platform::attributes::NoopAttributes;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Some(path) = option_env!("CARGO_BIN_EXE_fim") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "fim.exe" } else { "fim" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve fim binary path for integration test"),
    }
}

/// Run the `fim` binary and keep a transcript under the temp dir.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("fim-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env_remove("FIM_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute fim command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let transcript = format!(
        "case={case_name}\nbin={}\nargs={args:?}\nstatus={}\n----- stdout -----\n{stdout}\n----- stderr -----\n{stderr}\n",
        bin_path.display(),
        output.status
    );
    fs::write(&log_path, transcript).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Write `contents` at `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&path, contents).expect("write fixture file");
    path
}

/// Checksum provider that counts calls and fails for chosen file names.
#[derive(Default)]
pub struct ScriptedProvider {
    calls: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, file_name: &str) {
        self.failing.lock().insert(file_name.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChecksumProvider for ScriptedProvider {
    fn checksum(&self, path: &Path) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.failing.lock().contains(&name) {
            return Err(FimError::io(
                path,
                io::Error::new(io::ErrorKind::PermissionDenied, "scripted failure"),
            ));
        }
        Sha512Checksums.checksum(path)
    }
}

/// Options without sealing and with a save window long enough that only
/// explicit saves and close write the database.
pub fn quiet_options(provider: Arc<dyn ChecksumProvider>) -> CheckerOptions {
    CheckerOptions::default()
        .with_provider(provider)
        .with_attributes(Arc::new(NoopAttributes))
        .with_save_debounce(Duration::from_secs(3600))
}

pub fn enabled_checker(root: &Path, options: CheckerOptions) -> FolderIntegrityChecker {
    let checker = FolderIntegrityChecker::new(root, options).expect("create checker");
    checker.enable();
    checker
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
