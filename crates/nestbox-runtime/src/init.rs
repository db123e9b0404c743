//! The command line and environment handed to the container's init.

use std::path::PathBuf;

use nestbox_common::constants::CONTAINER_ENV_VALUE;
use nestbox_common::error::{NestboxError, Result};
use nestbox_common::types::ContainerLaunchSpec;

/// Search path exported to init.
const INIT_PATH: &str = "/bin:/sbin";

/// A fully built init invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommand {
    /// Program path inside the new root.
    pub program: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// The complete environment, in export order. Nothing is inherited.
    pub env: Vec<(String, String)>,
}

impl InitCommand {
    /// Builds the init command for `spec`.
    ///
    /// `tty_paths[0]` is the console; the remaining ones are announced to
    /// init through `container_ttys` without their `/dev/` prefix.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a secondary tty path is not under
    /// `/dev/`.
    pub fn build(spec: &ContainerLaunchSpec, tty_paths: &[PathBuf]) -> Result<Self> {
        let ttys = tty_paths
            .iter()
            .skip(1)
            .map(|tty| {
                tty.strip_prefix("/dev")
                    .ok()
                    .filter(|rest| !rest.as_os_str().is_empty())
                    .map(|rest| rest.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        NestboxError::config(format!(
                            "expected a /dev path for '{}'",
                            tty.display()
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let uuid = spec.uuid.hyphenated().to_string();
        let mut env = vec![
            ("PATH".to_string(), INIT_PATH.to_string()),
            ("TERM".to_string(), "linux".to_string()),
            ("container".to_string(), CONTAINER_ENV_VALUE.to_string()),
            ("container_uuid".to_string(), uuid.clone()),
        ];
        if !ttys.is_empty() {
            env.push(("container_ttys".to_string(), ttys.join(" ")));
        }
        env.push(("NESTBOX_UUID".to_string(), uuid));
        env.push(("NESTBOX_NAME".to_string(), spec.name.clone()));
        if let Some(cmdline) = &spec.init.cmdline {
            env.push(("NESTBOX_CMDLINE".to_string(), cmdline.clone()));
        }

        Ok(Self {
            program: spec.init.path.clone(),
            args: spec.init.args.clone(),
            env,
        })
    }

    /// Program name followed by the arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// The environment as `KEY=value` strings.
    #[must_use]
    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Value of `key` in the environment.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
