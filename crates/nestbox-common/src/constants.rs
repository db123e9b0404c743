//! System-wide constants and default paths.

/// Default directory holding per-container staging mounts.
pub const DEFAULT_STATE_DIR: &str = "/run/nestbox";

/// Default stack size handed to the duplicated child.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Stack size for throwaway probe processes.
pub const PROBE_STACK_SIZE: usize = 64 * 1024;

/// Directory (relative to the new root) where the previous root is kept
/// until the pivot is complete.
pub const OLD_ROOT_DIR: &str = ".oldroot";

/// Absolute path of the preserved old root after the pivot.
pub const OLD_ROOT_PATH: &str = "/.oldroot";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// SELinux filesystem mount point.
pub const SELINUX_MOUNT: &str = "/sys/fs/selinux";

/// Kernel setting consulted by the reboot probe.
pub const CTRL_ALT_DEL_PATH: &str = "/proc/sys/kernel/ctrl-alt-del";

/// Live mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Value of the `container` environment variable seen by init.
pub const CONTAINER_ENV_VALUE: &str = "nestbox";

/// Application name used in CLI output.
pub const APP_NAME: &str = "nestbox";
