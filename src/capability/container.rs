//! The container runtime capability: the subset of `docker`/`podman`
//! functionality the image preparer needs to turn an OCI image reference
//! into a plain filesystem tree it can copy into an ext4 rootfs.

use std::path::Path;

use async_trait::async_trait;

use crate::capability::command::{CommandRunner, TokioCommandRunner};
use crate::config::ContainerRuntimeKind;

/// Pulls and exports OCI images via the host container runtime CLI. Kept
/// separate from [`CommandRunner`] (rather than having `ImagePreparer` shell
/// out directly) so the pull/export sequence — which is multiple commands
/// with a shared temporary container id — can be faked as a unit in tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Ensure `image` is present in the local image store, pulling it if
    /// necessary.
    async fn pull(&self, image: &str) -> Result<(), std::io::Error>;

    /// Export `image`'s filesystem as a tarball at `dest`. Implemented as
    /// `create` (without starting) followed by `export`, matching `docker
    /// create` + `docker export` / `podman create` + `podman export`.
    async fn export_filesystem(&self, image: &str, dest: &Path) -> Result<(), std::io::Error>;
}

/// The production [`ContainerRuntime`]: shells out to the configured
/// `docker` or `podman` binary via a [`CommandRunner`].
pub struct ShellContainerRuntime<R: CommandRunner = TokioCommandRunner> {
    binary: &'static str,
    runner: R,
}

impl ShellContainerRuntime<TokioCommandRunner> {
    pub fn new(kind: ContainerRuntimeKind) -> Self {
        Self::with_runner(kind, TokioCommandRunner)
    }
}

impl<R: CommandRunner> ShellContainerRuntime<R> {
    pub fn with_runner(kind: ContainerRuntimeKind, runner: R) -> Self {
        let binary = match kind {
            ContainerRuntimeKind::Docker => "docker",
            ContainerRuntimeKind::Podman => "podman",
        };
        Self { binary, runner }
    }
}

#[async_trait]
impl<R: CommandRunner> ContainerRuntime for ShellContainerRuntime<R> {
    async fn pull(&self, image: &str) -> Result<(), std::io::Error> {
        self.runner.run_checked(self.binary, &["pull", image]).await?;
        Ok(())
    }

    async fn export_filesystem(&self, image: &str, dest: &Path) -> Result<(), std::io::Error> {
        let create_output = self
            .runner
            .run_checked(self.binary, &["create", image, "true"])
            .await?;
        let container_id = create_output.stdout_str().trim().to_owned();

        let dest_str = dest.to_string_lossy();
        let result = self
            .runner
            .run_checked(self.binary, &["export", "-o", dest_str.as_ref(), &container_id])
            .await;

        // Always attempt to remove the scratch container, regardless of
        // whether export succeeded, so a failed preparation doesn't leak
        // containers on every retry.
        let _ = self.runner.run(self.binary, &["rm", "-f", &container_id]).await;

        result?;
        Ok(())
    }
}
