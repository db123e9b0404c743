//! Entry point of the duplicated process.
//!
//! Runs in fresh namespaces and walks a fixed, linear sequence of steps.
//! The first failing step aborts: its error goes to the inherited stderr
//! and the process exits non-zero. On success the process becomes the
//! container's init and never returns here.

use std::convert::Infallible;
use std::fmt;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nestbox_common::config::NestboxConfig;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::layout::StateLayout;
use nestbox_common::types::{ContainerLaunchSpec, Feature, FilesystemKind};
use nestbox_core::capability::{CapabilityDropSet, drop_capabilities};
use nestbox_core::fd::{FdTable, ProcessFds, finalize_descriptors};
use nestbox_core::filesystem::SystemMounter;
use nestbox_core::filesystem::block::SuperblockProbe;
use nestbox_core::handshake::{send_continue, wait_for_continue};
use nestbox_core::namespace::probe::probe_reboot_support;
use nestbox_core::namespace::user::apply_identity;
use nestbox_core::network::{SystemInterfaces, rename_and_enable};

use crate::init::InitCommand;
use crate::launch::LaunchRequest;
use crate::provider::{CgroupProvider, Executor, SecurityProvider};
use crate::rootfs::RootPivotController;

/// Devpts prefix of console paths handed in by the supervisor.
const PTS_PREFIX: &str = "/dev/pts/";

/// Console used when the container has no tty at all.
const NULL_CONSOLE: &str = "/dev/null";

/// Steps of the child sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStep {
    /// Waiting for the supervisor's go-ahead.
    WaitHandshake,
    /// Checking whether `reboot(2)` is namespaced.
    ProbeRebootSupport,
    /// Building the init command line and environment.
    BuildInitCommand,
    /// Becoming root in the user namespace.
    ApplyIdentity,
    /// Opening the console tty.
    OpenConsole,
    /// Resolving filesystem sources to real paths.
    ResolveSymlinks,
    /// Pivoting and mounting the container tree.
    PivotRoot,
    /// Checking the init program exists in the new root.
    VerifyInit,
    /// Renaming delegated interfaces.
    RenameInterfaces,
    /// Dropping capabilities.
    DropCapabilities,
    /// Telling the supervisor setup is done.
    SendHandshake,
    /// Applying the security label.
    ApplySecurityLabel,
    /// Closing the handshake descriptors.
    CloseControlDescriptors,
    /// Setting up stdio and pass-through descriptors.
    FinalizeDescriptors,
    /// Replacing the process image.
    Exec,
}

impl fmt::Display for ChildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WaitHandshake => "wait for handshake",
            Self::ProbeRebootSupport => "probe reboot support",
            Self::BuildInitCommand => "build init command",
            Self::ApplyIdentity => "apply identity",
            Self::OpenConsole => "open console",
            Self::ResolveSymlinks => "resolve filesystem symlinks",
            Self::PivotRoot => "pivot root",
            Self::VerifyInit => "verify init",
            Self::RenameInterfaces => "rename interfaces",
            Self::DropCapabilities => "drop capabilities",
            Self::SendHandshake => "send handshake",
            Self::ApplySecurityLabel => "apply security label",
            Self::CloseControlDescriptors => "close control descriptors",
            Self::FinalizeDescriptors => "finalize descriptors",
            Self::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Everything the child needs, borrowed from the launching call.
pub(crate) struct ChildContext<'a> {
    pub spec: &'a ContainerLaunchSpec,
    pub config: &'a NestboxConfig,
    pub request: &'a LaunchRequest<'a>,
    pub security: &'a dyn SecurityProvider,
    pub cgroups: &'a dyn CgroupProvider,
    pub executor: &'a dyn Executor,
}

/// Runs the child sequence and turns a failure into an exit status.
pub(crate) fn run(ctx: &ChildContext<'_>) -> isize {
    let mut step = ChildStep::WaitHandshake;
    let Err(err) = child_main(ctx, &mut step);
    tracing::error!(%step, error = %err, "container setup failed");
    report(&err);
    1
}

/// Logging may not reach anyone from inside the new namespaces, so the
/// error also goes straight to the inherited stderr.
#[allow(clippy::print_stderr)]
fn report(err: &NestboxError) {
    eprintln!("{err}");
}

fn child_main(ctx: &ChildContext<'_>, step: &mut ChildStep) -> Result<Infallible> {
    let request = ctx.request;

    *step = ChildStep::WaitHandshake;
    wait_for_continue(request.monitor)?;
    tracing::debug!("received container continue message");

    *step = ChildStep::ProbeRebootSupport;
    let reboot = probe_reboot_support()?;

    *step = ChildStep::BuildInitCommand;
    let command = InitCommand::build(ctx.spec, &request.tty_paths)?;
    tracing::debug!(argv = ?command.argv(), "init command");

    *step = ChildStep::ApplyIdentity;
    apply_identity(&ctx.spec.idmap)?;

    *step = ChildStep::OpenConsole;
    let layout = StateLayout::new(resolve(&ctx.config.state_dir)?, ctx.spec.name.clone());
    let console = console_path(&layout, &request.tty_paths);
    tracing::debug!(path = %console.display(), "container tty path");
    let tty = open_console(&console)?;

    *step = ChildStep::ResolveSymlinks;
    let mut spec = ctx.spec.clone();
    resolve_filesystem_symlinks(&mut spec)?;

    *step = ChildStep::PivotRoot;
    let mount_options = ctx.security.compute_mount_options(&spec)?;
    RootPivotController::new(&SystemMounter, &SuperblockProbe, ctx.cgroups, &layout)
        .with_meminfo(ctx.config.meminfo_virtualization)
        .run(&spec, &mount_options, &request.tty_paths)?;

    *step = ChildStep::VerifyInit;
    verify_init(&spec.init.path)?;

    *step = ChildStep::RenameInterfaces;
    rename_and_enable(
        &SystemInterfaces,
        spec.has_feature(Feature::PrivateNetwork),
        &request.interfaces,
    )?;

    *step = ChildStep::DropCapabilities;
    drop_capabilities(&CapabilityDropSet::new(reboot.is_available()))?;

    *step = ChildStep::SendHandshake;
    send_continue(request.handshake)?;

    *step = ChildStep::ApplySecurityLabel;
    ctx.security.apply_process_label(&spec)?;

    *step = ChildStep::CloseControlDescriptors;
    let mut fds = ProcessFds;
    for fd in [request.handshake, request.monitor] {
        let _ = fds.close(fd.as_raw_fd());
    }

    *step = ChildStep::FinalizeDescriptors;
    finalize_descriptors(&mut fds, tty, request.pass_fds.clone())?;

    *step = ChildStep::Exec;
    ctx.executor.exec(&command)
}

fn resolve(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| NestboxError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Where the console is reachable before the pivot.
///
/// A `/dev/pts/N` console lives in the container's private devpts instance,
/// staged as `<name>.devpts`.
pub(crate) fn console_path(layout: &StateLayout, tty_paths: &[PathBuf]) -> PathBuf {
    let Some(first) = tty_paths.first() else {
        return PathBuf::from(NULL_CONSOLE);
    };
    match first.strip_prefix(PTS_PREFIX) {
        Ok(index) => layout.devpts().join(index),
        Err(_) => first.clone(),
    }
}

fn open_console(path: &Path) -> Result<OwnedFd> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map(OwnedFd::from)
        .map_err(|e| NestboxError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Replaces host-side filesystem sources by their resolved path.
///
/// Bind sources name paths inside the new root and are left alone, except
/// for a bind root which is a host path like any other root.
pub(crate) fn resolve_filesystem_symlinks(spec: &mut ContainerLaunchSpec) -> Result<()> {
    tracing::debug!("resolving symlinks");
    for fs in &mut spec.filesystems {
        if matches!(fs.kind, FilesystemKind::Bind) && !fs.is_root() {
            continue;
        }
        let Some(source) = &fs.source else {
            continue;
        };
        let resolved = resolve(source)?;
        tracing::debug!(from = %source.display(), to = %resolved.display(), "resolved");
        fs.source = Some(resolved);
    }
    Ok(())
}

fn verify_init(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(NestboxError::NotFound {
            kind: "init program",
            id: format!("{} (relative to container root)", path.display()),
        })
    }
}
