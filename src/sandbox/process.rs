//! Low-level preview subprocess plumbing: port allocation, environment
//! scrubbing, dev-server spawn in its own process group, readiness detection,
//! and group termination.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SandboxSettings;
use crate::errors::SandboxError;

/// Output markers that mean the dev server is accepting requests.
const READY_SENTINELS: &[&str] = &["Ready in", "✓ Ready", "Local:"];

/// How long after the graceful signal before the process group is killed.
const KILL_ESCALATION: Duration = Duration::from_secs(5);

/// Tail of stderr preserved on install failure.
const STDERR_TAIL_CHARS: usize = 800;

/// Ask the OS for a free TCP port by binding to an ephemeral one.
pub(crate) fn alloc_port() -> Result<u16, SandboxError> {
    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(SandboxError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(SandboxError::PortAllocation)?
        .port();
    drop(listener);
    Ok(port)
}

/// Remove loader-injection hints inherited from this process and pin PATH to
/// known binary directories. The parent's runtime may have injected module
/// loaders whose paths do not exist from the child's point of view.
pub(crate) fn scrub_env(cmd: &mut Command) {
    for (name, _) in std::env::vars() {
        if name.ends_with("_OPTIONS") {
            cmd.env_remove(&name);
        }
    }

    let mut path = String::from("/usr/local/bin:/usr/bin:/bin");
    if let Ok(home) = std::env::var("HOME") {
        path.push(':');
        path.push_str(&format!("{home}/.local/bin"));
    }
    cmd.env("PATH", path);
}

/// Copy the configured workspace template over a workspace that has no build
/// manifest. Fails when no template is configured.
pub(crate) async fn ensure_manifest(
    settings: &SandboxSettings,
    workspace_dir: &Path,
) -> Result<(), SandboxError> {
    if workspace_dir.join(&settings.manifest_file).is_file() {
        return Ok(());
    }
    let Some(template_dir) = settings.template_dir.clone() else {
        return Err(SandboxError::NoManifest);
    };

    let workspace = workspace_dir.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree(&template_dir, &workspace))
        .await
        .map_err(|e| SandboxError::Other(anyhow::anyhow!("template copy panicked: {e}")))?
        .context("Failed to copy workspace template")?;
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Run the dependency install when the dependency directory is absent.
pub(crate) async fn ensure_dependencies(
    settings: &SandboxSettings,
    workspace_dir: &Path,
) -> Result<(), SandboxError> {
    if workspace_dir.join(&settings.deps_dir).is_dir() {
        return Ok(());
    }

    let (program, args) = settings
        .install_cmd
        .split_first()
        .ok_or_else(|| SandboxError::Other(anyhow::anyhow!("empty install command")))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workspace_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    scrub_env(&mut cmd);

    let output = cmd
        .output()
        .await
        .map_err(|e| SandboxError::Other(anyhow::anyhow!("failed to run install: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut tail_start = stderr.len().saturating_sub(STDERR_TAIL_CHARS);
        while !stderr.is_char_boundary(tail_start) {
            tail_start += 1;
        }
        return Err(SandboxError::InstallFailed {
            exit_code: output.status.code().unwrap_or(-1),
            stderr_tail: stderr[tail_start..].trim().to_string(),
        });
    }
    Ok(())
}

/// A freshly spawned dev server, not yet ready.
pub(crate) struct SpawnedServer {
    pub child: Child,
    pub pid: Option<u32>,
    pub pgid: Option<i32>,
    pub lines: mpsc::UnboundedReceiver<String>,
}

/// Spawn the dev server detached in its own process group with the preview
/// port in `PORT`, both output streams piped into a single line channel.
pub(crate) fn spawn_server(
    settings: &SandboxSettings,
    workspace_dir: &Path,
    port: u16,
) -> Result<SpawnedServer, SandboxError> {
    let (program, args) = settings
        .serve_cmd
        .split_first()
        .ok_or_else(|| SandboxError::Other(anyhow::anyhow!("empty serve command")))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workspace_dir)
        .env("PORT", port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    scrub_env(&mut cmd);

    #[cfg(unix)]
    {
        // New session so the whole worker tree can be signalled at once.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(SandboxError::SpawnFailed)?;
    let pid = child.id();
    let pgid = pid.map(|p| p as i32);

    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, tx);
    }

    Ok(SpawnedServer {
        child,
        pid,
        pgid,
        lines: rx,
    })
}

/// Drain a child stream line by line. Keeps reading until EOF even after the
/// receiver goes away, so the pipe buffer never fills and stalls the server.
fn spawn_line_reader<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx.send(line);
        }
    });
}

pub(crate) enum ReadyOutcome {
    Ready,
    Exited { exit_code: i32 },
    TimedOut,
}

/// Watch the spawned server until a ready sentinel appears on either stream,
/// the process exits, or the timeout lapses.
pub(crate) async fn await_ready(server: &mut SpawnedServer, timeout: Duration) -> ReadyOutcome {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = server.lines.recv() => {
                match line {
                    Some(line) => {
                        debug!(line = %line, "dev server output");
                        if READY_SENTINELS.iter().any(|s| line.contains(s)) {
                            return ReadyOutcome::Ready;
                        }
                    }
                    // Both streams closed; fall through to process exit.
                    None => {
                        let status = server.child.wait().await;
                        let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                        return ReadyOutcome::Exited { exit_code };
                    }
                }
            }
            status = server.child.wait() => {
                let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                return ReadyOutcome::Exited { exit_code };
            }
            _ = &mut deadline => {
                return ReadyOutcome::TimedOut;
            }
        }
    }
}

/// Signal the whole process group: graceful first, forced 5 s later if the
/// group is still alive. Errors are swallowed; the group may already be gone.
pub(crate) fn terminate_group(pgid: Option<i32>) {
    #[cfg(unix)]
    {
        let Some(pgid) = pgid else { return };
        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }
        tokio::spawn(async move {
            tokio::time::sleep(KILL_ESCALATION).await;
            unsafe {
                // Signal 0 probes for liveness without delivering anything.
                if libc::kill(-pgid, 0) == 0 {
                    warn!(pgid, "dev server group ignored SIGTERM, escalating");
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        warn!("process-group termination unsupported on this platform");
    }
}
