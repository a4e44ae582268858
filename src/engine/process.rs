//! Engine backend running an external engine executable
//!
//! Manages the lifecycle of the engine child process:
//! - Writing the document to `<datDir>/config.json`
//! - Starting `<exe> run -c <config>` and checking it survives startup
//! - Graceful shutdown (SIGTERM, then kill)
//! - Checking a document with `<exe> run -test -c <config>`

use super::envelope::{CallResponse, StartRequest};
use super::EngineBackend;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Time the process must stay alive after spawn to count as started
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Time allowed for a graceful exit before the process is killed
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Environment variable the engine reads its geo data location from
const ASSET_LOCATION_ENV: &str = "XRAY_LOCATION_ASSET";

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process not started
    Stopped,
    /// Process is running
    Running,
    /// Process exited during startup
    Failed,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// Configuration for the process backend
#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    /// Path to the engine executable
    pub executable: PathBuf,
    /// Time the process must survive after spawn
    pub startup_grace: Duration,
    /// Time allowed for a graceful exit
    pub shutdown_timeout: Duration,
}

impl Default for ProcessEngineConfig {
    fn default() -> Self {
        ProcessEngineConfig {
            executable: PathBuf::from("xray"),
            startup_grace: STARTUP_GRACE,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

/// Engine child process manager
pub struct ProcessEngine {
    config: ProcessEngineConfig,
    state: Mutex<ProcessState>,
    child: Mutex<Option<Child>>,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        ProcessEngine {
            config,
            state: Mutex::new(ProcessState::Stopped),
            child: Mutex::new(None),
        }
    }

    /// Create with default timings
    pub fn with_executable(executable: PathBuf) -> Self {
        Self::new(ProcessEngineConfig {
            executable,
            ..Default::default()
        })
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    fn set_state(&self, new_state: ProcessState) {
        let mut state = self.state.lock();
        if *state != new_state {
            debug!("Engine process state: {} -> {}", *state, new_state);
            *state = new_state;
        }
    }

    fn spawn(&self, request: &StartRequest) -> Result<(), String> {
        let data_dir = Path::new(&request.dat_dir);
        std::fs::create_dir_all(data_dir)
            .map_err(|e| format!("cannot create data directory: {}", e))?;

        let config_path = data_dir.join("config.json");
        std::fs::write(&config_path, &request.config_json)
            .map_err(|e| format!("cannot write engine config: {}", e))?;

        let mut cmd = Command::new(&self.config.executable);
        cmd.arg("run")
            .arg("-c")
            .arg(&config_path)
            .env(ASSET_LOCATION_ENV, data_dir)
            .current_dir(data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        info!(
            "Starting engine: {:?} run -c {:?}",
            self.config.executable, config_path
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn engine: {}", e);
            format!("failed to spawn engine: {}", e)
        })?;
        info!("Engine started with PID: {}", child.id());

        // Wait a moment for the process to initialize
        std::thread::sleep(self.config.startup_grace);

        match child.try_wait() {
            Ok(None) => {
                *self.child.lock() = Some(child);
                Ok(())
            }
            Ok(Some(status)) => Err(format!("engine exited during startup ({})", status)),
            Err(e) => Err(format!("cannot check engine process: {}", e)),
        }
    }

    /// Run the engine's config test on a document written next to the live one
    fn check(&self, request: &StartRequest) -> Result<(), String> {
        let data_dir = Path::new(&request.dat_dir);
        std::fs::create_dir_all(data_dir)
            .map_err(|e| format!("cannot create data directory: {}", e))?;

        let config_path = data_dir.join("config.test.json");
        std::fs::write(&config_path, &request.config_json)
            .map_err(|e| format!("cannot write engine config: {}", e))?;

        debug!(
            "Testing engine config: {:?} run -test -c {:?}",
            self.config.executable, config_path
        );
        let output = Command::new(&self.config.executable)
            .arg("run")
            .arg("-test")
            .arg("-c")
            .arg(&config_path)
            .env(ASSET_LOCATION_ENV, data_dir)
            .current_dir(data_dir)
            .stdin(Stdio::null())
            .output();
        let _ = std::fs::remove_file(&config_path);

        let output = output.map_err(|e| format!("failed to run engine: {}", e))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reason = stderr
            .lines()
            .chain(stdout.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(String::from)
            .unwrap_or_else(|| format!("config test exited with {}", output.status));
        Err(reason)
    }

    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("Engine exited with status: {}", status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => break,
                Err(e) => {
                    warn!("Error waiting for engine: {}", e);
                    break;
                }
            }
        }

        warn!("Engine didn't exit gracefully, forcing kill");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl EngineBackend for ProcessEngine {
    fn run_from_json(&self, request: &str) -> String {
        let request = match StartRequest::decode(request) {
            Ok(request) => request,
            Err(e) => return CallResponse::fail(e.to_string()).encode(),
        };

        if self.state() == ProcessState::Running {
            // A previous engine is replaced
            if let Some(mut child) = self.child.lock().take() {
                self.terminate(&mut child);
            }
        }

        match self.spawn(&request) {
            Ok(()) => {
                self.set_state(ProcessState::Running);
                CallResponse::ok(None).encode()
            }
            Err(reason) => {
                self.set_state(ProcessState::Failed);
                CallResponse::fail(reason).encode()
            }
        }
    }

    fn stop(&self) -> String {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            info!("Stopping engine...");
            self.terminate(&mut child);
        }
        self.set_state(ProcessState::Stopped);
        CallResponse::ok(None).encode()
    }

    fn version(&self) -> String {
        let output = Command::new(&self.config.executable)
            .arg("version")
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let first = stdout.lines().next().unwrap_or_default().trim().to_string();
                CallResponse::ok(Some(first)).encode()
            }
            Ok(output) => CallResponse::fail(format!("version exited with {}", output.status)).encode(),
            Err(e) => CallResponse::fail(format!("failed to run engine: {}", e)).encode(),
        }
    }

    fn test_config(&self, request: &str) -> String {
        let request = match StartRequest::decode(request) {
            Ok(request) => request,
            Err(e) => return CallResponse::fail(e.to_string()).encode(),
        };
        match self.check(&request) {
            Ok(()) => CallResponse::ok(None).encode(),
            Err(reason) => {
                warn!("Engine rejected config: {}", reason);
                CallResponse::fail(reason).encode()
            }
        }
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.get_mut().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path) -> String {
        StartRequest {
            dat_dir: dir.to_string_lossy().into_owned(),
            mph_cache_path: None,
            config_json: "{}".to_string(),
        }
        .encode()
        .unwrap()
    }

    fn fast(executable: &str) -> ProcessEngine {
        ProcessEngine::new(ProcessEngineConfig {
            executable: PathBuf::from(executable),
            startup_grace: Duration::from_millis(300),
            shutdown_timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn test_process_state_display() {
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_missing_executable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fast("/nonexistent/engine-binary");

        let response = CallResponse::decode(&engine.run_from_json(&request(dir.path()))).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("spawn"));
        assert_eq!(engine.state(), ProcessState::Failed);
        // The document is written before the spawn
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn test_bad_request_fails() {
        let engine = fast("/nonexistent/engine-binary");
        let response = CallResponse::decode(&engine.run_from_json("%%%")).unwrap();
        assert!(!response.success);
    }

    #[cfg(unix)]
    #[test]
    fn test_immediate_exit_fails() {
        // `sh run -c ...` looks for a script named `run` and exits at once
        let dir = tempfile::tempdir().unwrap();
        let engine = fast("/bin/sh");

        let response = CallResponse::decode(&engine.run_from_json(&request(dir.path()))).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("exited during startup"));
    }

    #[test]
    fn test_config_check_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = fast("/nonexistent/engine-binary");

        let response = CallResponse::decode(&engine.test_config(&request(dir.path()))).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("failed to run engine"));
        assert!(!dir.path().join("config.test.json").exists());
        assert_eq!(engine.state(), ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn test_config_check_exit_status() {
        let dir = tempfile::tempdir().unwrap();

        let accepted = CallResponse::decode(&fast("/bin/true").test_config(&request(dir.path()))).unwrap();
        assert!(accepted.success);

        let rejected = CallResponse::decode(&fast("/bin/false").test_config(&request(dir.path()))).unwrap();
        assert!(!rejected.success);
        assert!(rejected.error.unwrap().contains("config test exited"));
    }

    #[test]
    fn test_stop_without_process_succeeds() {
        let engine = fast("/nonexistent/engine-binary");
        let response = CallResponse::decode(&engine.stop()).unwrap();
        assert!(response.success);
        assert_eq!(engine.state(), ProcessState::Stopped);
    }
}
