//! Host command execution, abstracted so network and image preparation code
//! can be driven against a fake in tests (teacher precedent:
//! `process_spawner::ProcessSpawner`, generalized here from
//! firecracker/jailer-only invocation to arbitrary host CLI tools: `ip`,
//! `iptables`, `tc`, `mkfs.ext4`, `mount`, `umount`, `fsck.ext4`, `tar`).

use std::path::Path;
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::process::Command;

/// The captured result of running a command to completion.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A live handle to a spawned, long-running process (the hypervisor
/// itself) — generalizes the teacher's `ProcessHandle` (attached-`Child`
/// variant only; this crate never runs Firecracker detached from a jailer,
/// so the pidfd variant has no counterpart here).
#[async_trait]
pub trait ProcessHandle: Send {
    fn send_sigkill(&mut self) -> Result<(), std::io::Error>;

    async fn wait(&mut self) -> Result<ExitStatus, std::io::Error>;

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, std::io::Error>;
}

#[async_trait]
impl ProcessHandle for tokio::process::Child {
    fn send_sigkill(&mut self) -> Result<(), std::io::Error> {
        self.start_kill()
    }

    async fn wait(&mut self) -> Result<ExitStatus, std::io::Error> {
        tokio::process::Child::wait(self).await
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, std::io::Error> {
        tokio::process::Child::try_wait(self)
    }
}

/// Runs a host binary to completion and captures its output. Every shell-out
/// this crate performs (bridge/TAP setup, NAT rules, filesystem tooling)
/// goes through this trait rather than `tokio::process::Command` directly.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error>;

    /// Spawn a long-running process and return a live handle to it, rather
    /// than waiting for completion. Used only for the hypervisor binary
    /// itself.
    async fn spawn(&self, program: &str, args: &[&str]) -> Result<Box<dyn ProcessHandle>, std::io::Error>;

    /// Convenience for callers that only care whether the command succeeded.
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(std::io::Error::other(format!(
                "{program} {} exited with {:?}: {}",
                args.join(" "),
                output.status_code,
                output.stderr_str()
            )));
        }
        Ok(output)
    }
}

/// The production [`CommandRunner`]: spawns a real child process via Tokio
/// and waits for it to exit, buffering its pipes.
#[derive(Debug, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error> {
        let output = Command::new(program).args(args).output().await?;
        Ok(CommandOutput {
            status_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<Box<dyn ProcessHandle>, std::io::Error> {
        let child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        Ok(Box::new(child))
    }
}

/// Resolve `binary` against `PATH` if `configured` is absent (spec §9 Open
/// Question: firecracker binary resolution), mirroring the teacher's
/// `VmmInstallation::verify` existence check but using `which` for the
/// search itself.
pub fn resolve_binary(configured: Option<&Path>, binary: &str) -> Result<std::path::PathBuf, std::io::Error> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    which::which(binary).map_err(|err| std::io::Error::other(format!("could not resolve `{binary}` on PATH: {err}")))
}
