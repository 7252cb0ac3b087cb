use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{error, info};

use super::{BuildConfig, BuildWarnings, RunConfig, TaskHandler};
use crate::config::JobRunnerConfig;
use crate::error::{ExecutionError, ProvisioningError};
use crate::jobs::run_manager::RunManager;
use crate::shared::tasks::{PYTHON_JOB_FILE_NAME, VENV_DIR_NAME, subtype_libs};

/// File descriptor the job's support library writes structured requests to.
const MESSAGE_FD: i32 = 3;

/// Runs Python tasks inside per-task virtualenvs. Each run is one interpreter
/// process wired with stdin, stdout, stderr and a dedicated message stream.
pub struct PythonHandler {
    config: JobRunnerConfig,
    // run id -> pid of the live job process
    running: Arc<Mutex<HashMap<i64, u32>>>,
}

impl PythonHandler {
    pub fn new(config: JobRunnerConfig) -> Self {
        Self {
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// One shell command chain that creates the virtualenv and installs the
    /// subtype's libraries plus the local support package.
    fn venv_init_script(&self, subtype: &str, dest_dir: &Path) -> String {
        let venv_dir = dest_dir.join(VENV_DIR_NAME);
        let activate = venv_dir.join("bin").join("activate");
        let packages = subtype_libs(subtype);

        let mut chain = vec![
            format!("{} {}", self.config.venv_cmd, venv_dir.display()),
            format!(". {}", activate.display()),
        ];
        if !packages.is_empty() {
            chain.push(format!("pip install {}", packages.join(" ")));
        }
        if let Some(dist) = &self.config.support_package_dir {
            chain.push(format!(
                "pip install --no-index --find-links={} {}",
                dist.display(),
                self.config.support_package
            ));
        }
        chain.push("deactivate".to_string());
        chain.join(" && ")
    }
}

/// Task archives arrive as tar, optionally gzipped.
fn extract_code(code: &[u8], dest_dir: &Path) -> std::io::Result<()> {
    if code.starts_with(&[0x1f, 0x8b]) {
        tar::Archive::new(GzDecoder::new(code)).unpack(dest_dir)
    } else {
        tar::Archive::new(code).unpack(dest_dir)
    }
}

fn provisioning_error(message: String) -> ProvisioningError {
    ProvisioningError {
        warnings: Vec::new(),
        errors: vec![message],
    }
}

/// Fold a stream-level error into the run's error log and surface it as an
/// output event. Stream trouble never terminates the run by itself.
async fn report_stream_error(error_log: &Mutex<String>, manager: &Arc<RunManager>, err: &std::io::Error) {
    let message = err.to_string();
    error!("Job stream error: {message}");
    error_log.lock().await.push_str(&message);
    manager.on_output(&message).await;
}

#[async_trait]
impl TaskHandler for PythonHandler {
    async fn init(&self, config: BuildConfig) -> Result<BuildWarnings, ProvisioningError> {
        let BuildConfig {
            subtype,
            code_archive,
            dest_dir,
        } = config;

        let prepare = async {
            if tokio::fs::try_exists(&dest_dir).await? {
                tokio::fs::remove_dir_all(&dest_dir).await?;
            }
            tokio::fs::create_dir_all(&dest_dir).await?;
            let unpack_dir = dest_dir.clone();
            tokio::task::spawn_blocking(move || extract_code(&code_archive, &unpack_dir))
                .await
                .map_err(std::io::Error::other)??;
            Ok::<(), std::io::Error>(())
        };
        if let Err(err) = prepare.await {
            error!("Task build preparation failed: {err}");
            return Err(provisioning_error(err.to_string()));
        }

        let script = self.venv_init_script(&subtype, &dest_dir);
        let output = Command::new("bash")
            .arg("-c")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| provisioning_error(err.to_string()))?;

        if output.status.success() {
            Ok(Vec::new())
        } else {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stderr),
                String::from_utf8_lossy(&output.stdout)
            );
            Err(provisioning_error(format!(
                "Environment build ended with {} and the following output (stderr, stdout):\n{combined}",
                output.status
            )))
        }
    }

    async fn run(
        &self,
        config: RunConfig,
        manager: Arc<RunManager>,
    ) -> Result<(), ExecutionError> {
        let RunConfig {
            run_id,
            task_dir,
            input_data,
            ..
        } = config;

        let python = task_dir.join(VENV_DIR_NAME).join("bin").join("python");
        let input_line = serde_json::to_string(&input_data)
            .map_err(|err| ExecutionError::Failed(format!("input data serialization failed: {err}")))?;

        // The message stream is a socketpair whose child end becomes fd 3.
        let (child_end, parent_end) =
            std::os::unix::net::UnixStream::pair().map_err(ExecutionError::Spawn)?;
        let message_fd = child_end.as_raw_fd();

        let mut cmd = Command::new(&python);
        cmd.arg(PYTHON_JOB_FILE_NAME)
            .current_dir(&task_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // dup2 clears CLOEXEC, so the stream survives the exec; when the fd
        // already sits at 3 the flag has to be dropped by hand
        let wire_message_fd = move || {
            if message_fd == MESSAGE_FD {
                let flags = unsafe { libc::fcntl(MESSAGE_FD, libc::F_GETFD) };
                if flags == -1
                    || unsafe { libc::fcntl(MESSAGE_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) }
                        == -1
                {
                    return Err(std::io::Error::last_os_error());
                }
            } else if unsafe { libc::dup2(message_fd, MESSAGE_FD) } == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        };
        unsafe {
            cmd.pre_exec(wire_message_fd);
        }

        let mut child = cmd.spawn().map_err(ExecutionError::Spawn)?;
        drop(child_end);

        parent_end
            .set_nonblocking(true)
            .map_err(ExecutionError::Spawn)?;
        let message_stream =
            tokio::net::UnixStream::from_std(parent_end).map_err(ExecutionError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Failed("job stdin not captured".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Failed("job stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Failed("job stderr not captured".to_string()))?;

        if let Some(pid) = child.id() {
            self.running.lock().await.insert(run_id, pid);
        }

        let stdin: Arc<Mutex<ChildStdin>> = Arc::new(Mutex::new(stdin));
        let error_log = Arc::new(Mutex::new(String::new()));

        // the input payload goes out immediately, one JSON line
        {
            let mut stdin = stdin.lock().await;
            let write = async {
                stdin.write_all(input_line.as_bytes()).await?;
                stdin.write_all(b"\n").await
            };
            if let Err(err) = write.await {
                report_stream_error(&error_log, &manager, &err).await;
            }
        }

        // stdout streams live to the run manager
        {
            let manager = manager.clone();
            let error_log = error_log.clone();
            tokio::spawn(async move {
                let mut chunk = vec![0u8; 8192];
                loop {
                    match stdout.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            manager
                                .on_output(&String::from_utf8_lossy(&chunk[..n]))
                                .await;
                        }
                        Err(err) => {
                            report_stream_error(&error_log, &manager, &err).await;
                            break;
                        }
                    }
                }
            });
        }

        // stderr only accumulates; it surfaces if the run ends badly
        {
            let manager = manager.clone();
            let error_log = error_log.clone();
            tokio::spawn(async move {
                let mut chunk = vec![0u8; 8192];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            error_log
                                .lock()
                                .await
                                .push_str(&String::from_utf8_lossy(&chunk[..n]));
                        }
                        Err(err) => {
                            report_stream_error(&error_log, &manager, &err).await;
                            break;
                        }
                    }
                }
            });
        }

        // message stream: every request line gets exactly one reply line on
        // stdin, errors included, or the job would block forever
        {
            let manager = manager.clone();
            let error_log = error_log.clone();
            let stdin = stdin.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(message_stream).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let reply = manager.on_request(&line).await;
                            let mut framed = reply.to_string();
                            framed.push('\n');
                            let mut stdin = stdin.lock().await;
                            if let Err(err) = stdin.write_all(framed.as_bytes()).await {
                                report_stream_error(&error_log, &manager, &err).await;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            report_stream_error(&error_log, &manager, &err).await;
                            break;
                        }
                    }
                }
            });
        }

        // exit waiter: the only place the run's terminal outcome is decided
        {
            let running = self.running.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                running.lock().await.remove(&run_id);
                let log = error_log.lock().await.clone();
                match status {
                    Ok(status) if status.success() => manager.on_success(None).await,
                    Ok(status) => {
                        manager
                            .on_fail(format!(
                                "Run failed with {status}\n\nError log:\n{log}"
                            ))
                            .await;
                    }
                    Err(err) => {
                        manager
                            .on_fail(format!("{err}\n\nError log:\n{log}"))
                            .await;
                    }
                }
            });
        }

        Ok(())
    }

    async fn stop(&self, run_id: i64) {
        let running = self.running.lock().await;
        if let Some(&pid) = running.get(&run_id) {
            info!("Interrupting job process for run {run_id} (pid {pid})");
            // cooperative only: the job may catch SIGINT and clean up
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }
    }
}
