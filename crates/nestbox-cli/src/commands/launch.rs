//! `nestbox launch` — Start a container and supervise it until it exits.

use std::os::fd::{AsFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use nestbox_common::config::NestboxConfig;
use nestbox_common::layout::StateLayout;
use nestbox_common::types::ContainerLaunchSpec;
use nestbox_core::filesystem::SystemMounter;
use nestbox_runtime::{LaunchRequest, Launcher, send_continue, wait_for_continue, write_id_maps};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::stage::StagedDevices;

/// Arguments for the `launch` command.
#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Launch spec (JSON).
    #[arg(long)]
    pub spec: PathBuf,

    /// Interface already moved into the container; becomes eth0, eth1, ...
    #[arg(long = "interface")]
    pub interfaces: Vec<String>,

    /// Terminal exposed to the container; the first is the console.
    #[arg(long = "tty")]
    pub ttys: Vec<PathBuf>,

    /// Inherited descriptor handed to init as 3, 4, ...
    #[arg(long = "pass-fd")]
    pub pass_fds: Vec<RawFd>,
}

/// Executes the `launch` command.
///
/// Stages devices, launches the container, completes both handshake
/// rounds and returns the container's exit status.
///
/// # Errors
///
/// Returns an error if the spec cannot be loaded, staging or launch fails,
/// or the container dies before reporting ready.
pub fn execute(args: &LaunchArgs, config: NestboxConfig) -> anyhow::Result<ExitCode> {
    let spec = load_spec(&args.spec)?;
    let layout = StateLayout::new(config.state_dir.clone(), spec.name.clone());

    let mounter = SystemMounter;
    let staged = StagedDevices::stage(&mounter, &spec, &layout, Path::new("/dev"))
        .context("staging container devices")?;

    let result = supervise(args, config, &spec);
    staged.release();
    result
}

fn supervise(
    args: &LaunchArgs,
    config: NestboxConfig,
    spec: &ContainerLaunchSpec,
) -> anyhow::Result<ExitCode> {
    let (monitor, monitor_child) = UnixStream::pair().context("creating monitor channel")?;
    let (handshake, handshake_child) = UnixStream::pair().context("creating handshake channel")?;

    let launcher = Launcher::new(config);
    let pid = {
        let request = LaunchRequest {
            interfaces: args.interfaces.clone(),
            pass_fds: args.pass_fds.clone(),
            monitor: monitor_child.as_fd(),
            handshake: handshake_child.as_fd(),
            tty_paths: args.ttys.clone(),
        };
        launcher.launch(spec, &request)?
    };
    // Only the child keeps its ends, so its death ends our reads.
    drop(monitor_child);
    drop(handshake_child);

    release_child(spec, pid, monitor, handshake)?;
    tracing::info!(name = %spec.name, %pid, "container running");

    let status = waitpid(pid, None).context("waiting for container")?;
    tracing::info!(name = %spec.name, ?status, "container exited");
    Ok(exit_code(status))
}

/// Runs both handshake rounds with the child.
///
/// If any host-side step fails the child is killed and reaped before the
/// error is returned, whichever round it is blocked in.
fn release_child(
    spec: &ContainerLaunchSpec,
    pid: Pid,
    monitor: UnixStream,
    handshake: UnixStream,
) -> anyhow::Result<()> {
    let Err(e) = host_setup(spec, pid, &monitor, &handshake) else {
        return Ok(());
    };
    drop(monitor);
    drop(handshake);
    if let Err(errno) = kill(pid, Signal::SIGKILL) {
        tracing::debug!(%pid, %errno, "container already gone");
    }
    let status = waitpid(pid, None);
    tracing::error!(%pid, ?status, error = %e, "container failed during setup");
    Err(e)
}

/// Writes the id maps, releases the child and waits until it is isolated.
fn host_setup(
    spec: &ContainerLaunchSpec,
    pid: Pid,
    monitor: &UnixStream,
    handshake: &UnixStream,
) -> anyhow::Result<()> {
    if spec.idmap.is_active() {
        write_id_maps(pid, &spec.idmap)?;
    }
    send_continue(monitor.as_fd())?;
    wait_for_continue(handshake.as_fd()).context("container did not report ready")?;
    Ok(())
}

fn load_spec(path: &Path) -> anyhow::Result<ContainerLaunchSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading launch spec {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing launch spec {}", path.display()))
}

/// Shell convention: the exit status, or 128 + signal number.
fn exit_code(status: WaitStatus) -> ExitCode {
    let code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
