#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Parse the last stdout line as JSON (commands emit one line in JSON mode).
    pub fn json(&self) -> serde_json::Value {
        let line = self.stdout.lines().last().unwrap_or_default();
        serde_json::from_str(line).unwrap_or_else(|e| {
            panic!(
                "stdout is not JSON ({e}); see {}\n{}",
                self.log_path.display(),
                self.stdout
            )
        })
    }
}

/// Isolated environment for CLI runs: its own HOME, database, and audit log.
pub struct CliEnv {
    pub dir: tempfile::TempDir,
    vars: Vec<(String, String)>,
}

impl CliEnv {
    pub fn sandbox(sandbox_id: &str) -> Self {
        let mut env = Self::production();
        env.set("TSIM_MODE", "sandbox");
        env.set("TSIM_SANDBOX_ID", sandbox_id);
        env
    }

    pub fn production() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path().to_path_buf();
        let mut env = Self {
            dir,
            vars: Vec::new(),
        };
        env.set("HOME", &root.to_string_lossy());
        env.set("TSIM_SQLITE_DB", &root.join("sim.sqlite3").to_string_lossy());
        env.set("TSIM_AUDIT_JSONL", &root.join("audit.jsonl").to_string_lossy());
        env.set("TSIM_ACTOR", "itest");
        env.set("TSIM_MODE", "production");
        env
    }

    /// Same database and HOME, different environment variables.
    pub fn sharing_with(other: &Self, mode: &str, sandbox_id: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut vars: Vec<(String, String)> = other
            .vars
            .iter()
            .filter(|(k, _)| k != "TSIM_MODE" && k != "TSIM_SANDBOX_ID")
            .cloned()
            .collect();
        vars.push(("TSIM_MODE".to_string(), mode.to_string()));
        if let Some(id) = sandbox_id {
            vars.push(("TSIM_SANDBOX_ID".to_string(), id.to_string()));
        }
        Self { dir, vars }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.retain(|(k, _)| k != key);
        self.vars.push((key.to_string(), value.to_string()));
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).expect("write fixture");
        path
    }

    pub fn audit_path(&self) -> PathBuf {
        self.vars
            .iter()
            .find(|(k, _)| k == "TSIM_AUDIT_JSONL")
            .map(|(_, v)| PathBuf::from(v))
            .expect("audit path configured")
    }

    pub fn run(&self, case_name: &str, args: &[&str]) -> CmdResult {
        run_cli_case(case_name, args, &self.vars)
    }
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
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_tsim") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "tsim.exe" } else { "tsim" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve tsim binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str], vars: &[(String, String)]) -> CmdResult {
    let root = std::env::temp_dir().join("tsim-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env_remove("TSIM_OUTPUT_FORMAT")
        .envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute tsim command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Count JSONL lines whose `action` field equals `action`.
pub fn count_audit_actions(path: &Path, action: &str) -> usize {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter(|v| v["action"] == action)
        .count()
}
