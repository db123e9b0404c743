//! `nestbox probe` — Report kernel support for optional container features.

use std::process::ExitCode;

use clap::Args;
use nestbox_core::namespace::NamespaceKind;
use nestbox_core::namespace::probe::probe_reboot_support;
use nestbox_runtime::probe_kernel_feature_support;
use serde::Serialize;

/// Arguments for the `probe` command.
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// What the running kernel supports.
#[derive(Debug, Serialize)]
struct ProbeReport {
    user_namespace: bool,
    network_namespace: bool,
    namespaced_reboot: bool,
}

/// Executes the `probe` command.
///
/// # Errors
///
/// Returns an error if the reboot probe cannot run.
#[allow(clippy::print_stdout)]
pub fn execute(args: &ProbeArgs) -> anyhow::Result<ExitCode> {
    let report = ProbeReport {
        user_namespace: probe_kernel_feature_support(NamespaceKind::User),
        network_namespace: probe_kernel_feature_support(NamespaceKind::Net),
        namespaced_reboot: probe_reboot_support()?.is_available(),
    };
    tracing::debug!(?report, "kernel probe finished");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{:<20} {}", "user namespace", yes_no(report.user_namespace));
        println!("{:<20} {}", "network namespace", yes_no(report.network_namespace));
        println!("{:<20} {}", "namespaced reboot", yes_no(report.namespaced_reboot));
    }
    Ok(ExitCode::SUCCESS)
}

const fn yes_no(supported: bool) -> &'static str {
    if supported { "yes" } else { "no" }
}
