//! Sandboxed executor.
//!
//! Turns a generated source fragment into exported geometry files without
//! trusting its content:
//! - every execution runs in a freshly spawned worker process
//! - the worker runs in its own process group; the whole group is killed
//!   when the worker exits or exceeds the wall-clock limit
//! - output files are named `<unit_id>.<ext>` inside a caller-chosen directory
//! - the driver script is removed on success and kept for post-mortem on failure

pub mod protocol;
pub mod runtime;

pub use protocol::WorkerReport;
pub use runtime::{CadQueryRuntime, ShellRuntime, WorkerRuntime};

use crate::cad_config::{ExecutorSection, RuntimeKind};
use crate::errors::ExecutorError;
use cadforge_common::{ExportFormat, ExportedFile, FormatFailure, UnitOutcome};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

static UNIT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,127}$").unwrap());

// Diagnostics kept on a result; the tail is what matters for tracebacks.
const DIAGNOSTIC_LIMIT: usize = 8 * 1024;

/// Everything one worker run produced.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub unit_id: String,
    pub outcome: UnitOutcome,
    pub files: Vec<ExportedFile>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Driver script left on disk because the run failed.
    pub driver_path: Option<PathBuf>,
    pub worker_pid: Option<u32>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Error text for the unit record; `None` on a clean success.
    pub fn error_text(&self) -> Option<String> {
        match &self.outcome {
            UnitOutcome::Success => None,
            UnitOutcome::PartialExport { failed } => Some(
                failed
                    .iter()
                    .map(|f| format!("{}: {}", f.format, f.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            other => {
                let mut text = other.summary();
                let stderr = self.stderr.trim();
                if !stderr.is_empty() && !matches!(other, UnitOutcome::RuntimeFault { .. }) {
                    text.push('\n');
                    text.push_str(stderr);
                }
                if let Some(driver) = &self.driver_path {
                    text.push_str(&format!("\ndriver retained at {}", driver.display()));
                }
                Some(text)
            }
        }
    }
}

/// Runs generated code in isolated worker processes.
#[derive(Clone)]
pub struct SandboxedExecutor {
    runtime: Arc<dyn WorkerRuntime>,
    timeout: Duration,
    binding: String,
}

impl SandboxedExecutor {
    pub fn new(runtime: Arc<dyn WorkerRuntime>, timeout: Duration, binding: &str) -> Self {
        Self {
            runtime,
            timeout,
            binding: binding.to_string(),
        }
    }

    pub fn from_config(section: &ExecutorSection) -> Self {
        let runtime: Arc<dyn WorkerRuntime> = match section.runtime {
            RuntimeKind::Cadquery => Arc::new(CadQueryRuntime::new(section.interpreter.clone())),
            RuntimeKind::Shell => {
                // The python default makes no sense for the shell runtime.
                let shell = if section.interpreter == "python3" {
                    "sh".to_string()
                } else {
                    section.interpreter.clone()
                };
                Arc::new(ShellRuntime::new(shell))
            }
        };
        Self::new(
            runtime,
            Duration::from_secs(section.timeout_secs),
            &section.result_binding,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runtime.name()
    }

    /// Execute `code` and export the bound result to every requested format.
    ///
    /// Returns `Err` only for infrastructure problems (bad unit id, unwritable
    /// output directory, interpreter missing). Everything the generated code
    /// can cause is reported through `ExecutionResult::outcome`.
    pub async fn execute(
        &self,
        code: &str,
        unit_id: &str,
        formats: &[ExportFormat],
        output_dir: &Path,
    ) -> Result<ExecutionResult, ExecutorError> {
        if !UNIT_ID_RE.is_match(unit_id) {
            return Err(ExecutorError::InvalidUnitId(unit_id.to_string()));
        }
        let mut formats = formats.to_vec();
        formats.sort();
        formats.dedup();
        if formats.is_empty() {
            return Err(ExecutorError::NoFormats);
        }

        let output_dir = std::fs::create_dir_all(output_dir)
            .and_then(|_| output_dir.canonicalize())
            .map_err(|source| ExecutorError::OutputDir {
                path: output_dir.to_path_buf(),
                source,
            })?;
        let output_dir = output_dir.as_path();

        let source_path = output_dir.join(format!(
            "{}_source.{}",
            unit_id,
            self.runtime.source_extension()
        ));
        let driver_path = output_dir.join(format!(
            "{}_driver.{}",
            unit_id,
            self.runtime.driver_extension()
        ));
        write_file(&source_path, code)?;
        write_file(&driver_path, &self.runtime.render_driver(&self.binding))?;

        let format_list = formats
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",");

        tracing::debug!(
            unit_id,
            runtime = self.runtime.name(),
            formats = %format_list,
            timeout_secs = self.timeout.as_secs(),
            "Spawning worker"
        );

        let started = Instant::now();
        let mut command = Command::new(self.runtime.program());
        command
            .arg(&driver_path)
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CADFORGE_SOURCE", &source_path)
            .env("CADFORGE_OUTPUT_DIR", output_dir)
            .env("CADFORGE_UNIT_ID", unit_id)
            .env("CADFORGE_FORMATS", &format_list)
            .env("CADFORGE_RESULT_BINDING", &self.binding)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.runtime.program().to_string(),
                source,
            })?;
        let worker_pid = child.id();

        let stdout_task = child.stdout.take().map(spawn_reader);
        let stderr_task = child.stderr.take().map(spawn_reader);

        let (exit_code, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => {
                let code = status.map_err(ExecutorError::Wait)?.code();
                kill_worker_group(worker_pid, unit_id);
                (code, false)
            }
            Err(_) => {
                kill_worker_group(worker_pid, unit_id);
                // kill() waits for the process to be reaped.
                if let Err(e) = child.kill().await {
                    tracing::warn!(unit_id, error = %e, "Failed to kill timed-out worker");
                }
                (None, true)
            }
        };
        let duration = started.elapsed();

        let stdout = collect_output(stdout_task, timed_out).await;
        let stderr = collect_output(stderr_task, timed_out).await;

        let (outcome, files) = if timed_out {
            (
                UnitOutcome::Timeout {
                    limit_secs: self.timeout.as_secs(),
                },
                Vec::new(),
            )
        } else {
            self.classify(exit_code, &stdout, &stderr, &formats, unit_id, output_dir)
        };

        let retained = if outcome.is_success() {
            for path in [&driver_path, &source_path] {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::debug!(path = %path.display(), error = %e, "Could not remove worker file");
                }
            }
            None
        } else {
            Some(driver_path)
        };

        tracing::info!(
            unit_id,
            outcome = outcome.kind_str(),
            files = files.len(),
            duration_ms = duration.as_millis() as u64,
            "Worker finished"
        );

        Ok(ExecutionResult {
            unit_id: unit_id.to_string(),
            outcome,
            files,
            stdout: tail(&stdout),
            stderr: tail(&stderr),
            exit_code,
            driver_path: retained,
            worker_pid,
            duration,
        })
    }

    fn classify(
        &self,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
        formats: &[ExportFormat],
        unit_id: &str,
        output_dir: &Path,
    ) -> (UnitOutcome, Vec<ExportedFile>) {
        let report = WorkerReport::parse(stdout);

        if report.result_missing && exit_code == Some(protocol::MISSING_RESULT_EXIT) {
            return (
                UnitOutcome::MissingResult {
                    binding: self.binding.clone(),
                },
                Vec::new(),
            );
        }

        if exit_code != Some(0) || !report.result_ok {
            let code = exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let detail = last_lines(stderr, 20);
            let message = if detail.is_empty() {
                format!("worker exited with {} without reporting a result", code)
            } else {
                format!("worker exited with {}: {}", code, detail)
            };
            return (UnitOutcome::RuntimeFault { message }, Vec::new());
        }

        let mut files = Vec::new();
        let mut failed = Vec::new();
        for &format in formats {
            let expected = output_dir.join(format!("{}.{}", unit_id, format.extension()));
            match report.exported_path(format) {
                Some(path) if path.file_name() == expected.file_name() && path.is_file() => {
                    match crate::util::file_digest(path) {
                        Ok((sha256, bytes)) => files.push(ExportedFile {
                            format,
                            path: path.clone(),
                            bytes,
                            sha256,
                        }),
                        Err(e) => failed.push(FormatFailure {
                            format,
                            message: format!("exported file unreadable: {}", e),
                        }),
                    }
                }
                Some(path) => failed.push(FormatFailure {
                    format,
                    message: format!("reported file {} does not exist", path.display()),
                }),
                None => failed.push(FormatFailure {
                    format,
                    message: report
                        .failure_for(format)
                        .map(|f| f.message.clone())
                        .unwrap_or_else(|| "not reported by worker".to_string()),
                }),
            }
        }

        if files.is_empty() {
            let reasons = failed
                .iter()
                .map(|f| format!("{}: {}", f.format, f.message))
                .collect::<Vec<_>>()
                .join("; ");
            return (
                UnitOutcome::RuntimeFault {
                    message: format!("no format exported ({})", reasons),
                },
                Vec::new(),
            );
        }
        if failed.is_empty() {
            (UnitOutcome::Success, files)
        } else {
            (UnitOutcome::PartialExport { failed }, files)
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), ExecutorError> {
    std::fs::write(path, content).map_err(|source| ExecutorError::ScriptWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// SIGKILL everything left in the worker's process group.
///
/// The group id is the worker's pid and stays reserved while any member is
/// alive, so signalling it after the worker was reaped is safe.
#[cfg(unix)]
fn kill_worker_group(worker_pid: Option<u32>, unit_id: &str) {
    let Some(pgid) = worker_pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(unit_id, pgid, error = %err, "Failed to kill worker process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_worker_group(_worker_pid: Option<u32>, _unit_id: &str) {}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect_output(task: Option<JoinHandle<String>>, timed_out: bool) -> String {
    let Some(task) = task else {
        return String::new();
    };
    if !timed_out {
        return task.await.unwrap_or_default();
    }
    // A killed worker's own children may still hold the pipe open.
    let abort = task.abort_handle();
    match tokio::time::timeout(Duration::from_millis(500), task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

fn tail(text: &str) -> String {
    if text.len() <= DIAGNOSTIC_LIMIT {
        return text.to_string();
    }
    let mut start = text.len() - DIAGNOSTIC_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell_executor(timeout_secs: u64) -> SandboxedExecutor {
        SandboxedExecutor::new(
            Arc::new(ShellRuntime::default()),
            Duration::from_secs(timeout_secs),
            "result",
        )
    }

    const BOTH: [ExportFormat; 2] = [ExportFormat::Step, ExportFormat::Stl];

    #[tokio::test]
    async fn exports_every_requested_format() {
        let dir = tempdir().unwrap();
        let exec = shell_executor(10);
        let result = exec
            .execute("result='sphere r=20'", "u_ok", &BOTH, dir.path())
            .await
            .unwrap();

        assert_eq!(result.outcome, UnitOutcome::Success);
        assert_eq!(result.files.len(), 2);
        let step = dir.path().join("u_ok.step");
        assert!(step.is_file());
        assert_eq!(std::fs::read_to_string(&step).unwrap(), "sphere r=20\n");
        assert!(result.files.iter().all(|f| f.bytes == 12 && f.sha256.len() == 64));
        assert!(result.error_text().is_none());
    }

    #[tokio::test]
    async fn driver_removed_on_success() {
        let dir = tempdir().unwrap();
        let result = shell_executor(10)
            .execute("result=1", "u_clean", &BOTH, dir.path())
            .await
            .unwrap();
        assert!(result.driver_path.is_none());
        assert!(!dir.path().join("u_clean_driver.sh").exists());
        assert!(!dir.path().join("u_clean_source.sh").exists());
    }

    #[tokio::test]
    async fn missing_binding_is_missing_result() {
        let dir = tempdir().unwrap();
        let result = shell_executor(10)
            .execute("shape='cube'", "u_missing", &BOTH, dir.path())
            .await
            .unwrap();

        assert_eq!(
            result.outcome,
            UnitOutcome::MissingResult {
                binding: "result".to_string()
            }
        );
        assert!(result.files.is_empty());
        assert!(!dir.path().join("u_missing.step").exists());
    }

    #[tokio::test]
    async fn failing_code_is_runtime_fault_and_driver_retained() {
        let dir = tempdir().unwrap();
        let result = shell_executor(10)
            .execute("echo boom >&2\nfalse\nresult=1", "u_fault", &BOTH, dir.path())
            .await
            .unwrap();

        match &result.outcome {
            UnitOutcome::RuntimeFault { message } => assert!(message.contains("boom")),
            other => panic!("Expected RuntimeFault, got {:?}", other),
        }
        let driver = result.driver_path.clone().unwrap();
        assert!(driver.exists());
        assert!(result.error_text().unwrap().contains("driver retained"));
    }

    #[tokio::test]
    async fn infinite_loop_times_out_and_worker_is_gone() {
        let dir = tempdir().unwrap();
        let started = Instant::now();
        let result = shell_executor(1)
            .execute("while :; do :; done", "u_loop", &BOTH, dir.path())
            .await
            .unwrap();

        assert_eq!(result.outcome, UnitOutcome::Timeout { limit_secs: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.driver_path.is_some());

        let pid = result.worker_pid.unwrap();
        let alive = std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stderr(Stdio::null())
            .status()
            .unwrap()
            .success();
        assert!(!alive, "worker {} still running", pid);
    }

    /// Running, i.e. present and not a zombie waiting for its new parent.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|state| state.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    fn spawned_pid(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("spawned.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    #[cfg(target_os = "linux")]
    async fn assert_gone(pid: u32) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while is_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!is_running(pid), "process {} outlived the worker", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_processes_started_by_the_code() {
        let dir = tempdir().unwrap();
        let code = "sleep 30 &\necho $! > spawned.pid\nwhile :; do :; done\n";
        let started = Instant::now();
        let result = shell_executor(1)
            .execute(code, "u_spawner", &BOTH, dir.path())
            .await
            .unwrap();

        assert_eq!(result.outcome, UnitOutcome::Timeout { limit_secs: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_gone(spawned_pid(dir.path())).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn background_processes_do_not_outlive_a_finished_worker() {
        let dir = tempdir().unwrap();
        let code = "sleep 30 &\necho $! > spawned.pid\nresult=plate\n";
        let started = Instant::now();
        let result = shell_executor(10)
            .execute(code, "u_background", &BOTH, dir.path())
            .await
            .unwrap();

        assert!(result.is_success(), "{:?}", result.outcome);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_gone(spawned_pid(dir.path())).await;
    }

    #[tokio::test]
    async fn failed_format_is_partial_export() {
        let dir = tempdir().unwrap();
        // A directory where the stl file should go makes that export fail.
        std::fs::create_dir_all(dir.path().join("u_partial.stl")).unwrap();
        let result = shell_executor(10)
            .execute("result=plate", "u_partial", &BOTH, dir.path())
            .await
            .unwrap();

        match &result.outcome {
            UnitOutcome::PartialExport { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].format, ExportFormat::Stl);
            }
            other => panic!("Expected PartialExport, got {:?}", other),
        }
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].format, ExportFormat::Step);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn packaging_is_deterministic() {
        let dir = tempdir().unwrap();
        let exec = shell_executor(10);
        let code = "result='sphere radius=20'";
        let first = exec.execute(code, "u_a1", &BOTH, dir.path()).await.unwrap();
        let second = exec.execute(code, "u_a2", &BOTH, dir.path()).await.unwrap();

        assert_eq!(first.outcome, second.outcome);
        for format in BOTH {
            let a = first.files.iter().find(|f| f.format == format).unwrap();
            let b = second.files.iter().find(|f| f.format == format).unwrap();
            assert_eq!(a.sha256, b.sha256);
            assert_eq!(a.bytes, b.bytes);
            assert_ne!(a.path, b.path);
        }
    }

    #[tokio::test]
    async fn concurrent_units_do_not_collide() {
        let dir = tempdir().unwrap();
        let exec = shell_executor(10);
        let (a, b) = tokio::join!(
            exec.execute("result=left", "u_left", &BOTH, dir.path()),
            exec.execute("result=right", "u_right", &BOTH, dir.path()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.is_success() && b.is_success());
        assert_ne!(a.files[0].sha256, b.files[0].sha256);
    }

    #[tokio::test]
    async fn rejects_unsafe_unit_ids() {
        let dir = tempdir().unwrap();
        let exec = shell_executor(10);
        for bad in ["", "../escape", "a b", "x/y"] {
            let err = exec.execute("result=1", bad, &BOTH, dir.path()).await;
            assert!(matches!(err, Err(ExecutorError::InvalidUnitId(_))), "{}", bad);
        }
    }

    #[tokio::test]
    async fn rejects_empty_format_list() {
        let dir = tempdir().unwrap();
        let err = shell_executor(10)
            .execute("result=1", "u_none", &[], dir.path())
            .await;
        assert!(matches!(err, Err(ExecutorError::NoFormats)));
    }

    #[tokio::test]
    async fn missing_interpreter_is_spawn_error() {
        let dir = tempdir().unwrap();
        let exec = SandboxedExecutor::new(
            Arc::new(ShellRuntime::new("/nonexistent/cadforge-shell")),
            Duration::from_secs(5),
            "result",
        );
        let err = exec.execute("result=1", "u_spawn", &BOTH, dir.path()).await;
        assert!(matches!(err, Err(ExecutorError::Spawn { .. })));
    }

    #[test]
    fn tail_keeps_end_of_long_output() {
        let long = "x".repeat(DIAGNOSTIC_LIMIT + 10) + "END";
        let kept = tail(&long);
        assert_eq!(kept.len(), DIAGNOSTIC_LIMIT);
        assert!(kept.ends_with("END"));
    }
}
