//! Supervisor side of a launch: namespace selection and duplication.

use std::os::fd::{BorrowedFd, RawFd};
use std::path::PathBuf;

use nestbox_common::config::NestboxConfig;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::ContainerLaunchSpec;
use nestbox_core::namespace::{HostKernel, KernelFeatures, NamespaceFlagSet, clone_process};
use nix::unistd::Pid;

use crate::child::{self, ChildContext};
use crate::provider::{
    CgroupProvider, Executor, ExecveExecutor, NoSecurityLabel, SecurityProvider,
    UnifiedCgroupIsolation,
};

/// Per-launch inputs that are not part of the container definition.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    /// Interfaces already moved into the container, renamed to `eth0`... in
    /// this order.
    pub interfaces: Vec<String>,
    /// Descriptors init receives as 3, 4, ...
    pub pass_fds: Vec<RawFd>,
    /// Child end of the pair used for the first handshake round.
    pub monitor: BorrowedFd<'a>,
    /// Child end of the pair used for the second handshake round.
    pub handshake: BorrowedFd<'a>,
    /// Terminal paths; the first is the console.
    pub tty_paths: Vec<PathBuf>,
}

/// Launches containers with a fixed set of collaborators.
pub struct Launcher {
    config: NestboxConfig,
    security: Box<dyn SecurityProvider>,
    cgroups: Box<dyn CgroupProvider>,
    executor: Box<dyn Executor>,
    kernel: Box<dyn KernelFeatures>,
}

impl Launcher {
    /// Creates a launcher with the default collaborators and a probing
    /// kernel query.
    #[must_use]
    pub fn new(config: NestboxConfig) -> Self {
        Self {
            config,
            security: Box::new(NoSecurityLabel),
            cgroups: Box::new(UnifiedCgroupIsolation::default()),
            executor: Box::new(ExecveExecutor),
            kernel: Box::new(HostKernel),
        }
    }

    /// Replaces the security-label provider.
    #[must_use]
    pub fn with_security(mut self, security: Box<dyn SecurityProvider>) -> Self {
        self.security = security;
        self
    }

    /// Replaces the cgroup provider.
    #[must_use]
    pub fn with_cgroups(mut self, cgroups: Box<dyn CgroupProvider>) -> Self {
        self.cgroups = cgroups;
        self
    }

    /// Replaces the executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Box<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the kernel feature query.
    #[must_use]
    pub fn with_kernel(mut self, kernel: Box<dyn KernelFeatures>) -> Self {
        self.kernel = kernel;
        self
    }

    /// The configuration this launcher runs with.
    #[must_use]
    pub const fn config(&self) -> &NestboxConfig {
        &self.config
    }

    /// Namespaces a launch of `spec` would request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `spec` needs a user namespace the
    /// kernel cannot provide.
    pub fn namespace_flags(&self, spec: &ContainerLaunchSpec) -> Result<NamespaceFlagSet> {
        NamespaceFlagSet::compute(spec, self.kernel.as_ref())
    }

    /// Starts the container process and returns its pid.
    ///
    /// The child blocks on `request.monitor` until the supervisor sends the
    /// first continue token, and answers on `request.handshake` once it is
    /// fully isolated.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before anything is created if the
    /// namespaces cannot be provided, or a syscall error if `clone(2)`
    /// fails.
    pub fn launch(&self, spec: &ContainerLaunchSpec, request: &LaunchRequest<'_>) -> Result<Pid> {
        let namespaces = self.namespace_flags(spec)?;

        let ctx = ChildContext {
            spec,
            config: &self.config,
            request,
            security: self.security.as_ref(),
            cgroups: self.cgroups.as_ref(),
            executor: self.executor.as_ref(),
        };
        let pid = clone_process(
            Box::new(|| child::run(&ctx)),
            self.config.stack_size,
            namespaces.flags(),
        )
        .map_err(|e| NestboxError::syscall("failed to run clone container", e))?;

        tracing::info!(name = %spec.name, %pid, flags = ?namespaces.flags(), "container process created");
        Ok(pid)
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
