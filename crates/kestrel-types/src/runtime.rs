use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostOs {
    Windows,
    Linux,
    Macos,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShellFamily {
    Powershell,
    Posix,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostRuntimeContext {
    pub os: HostOs,
    pub arch: String,
    pub shell_family: ShellFamily,
}

impl HostRuntimeContext {
    pub fn detect() -> Self {
        let os = if cfg!(windows) {
            HostOs::Windows
        } else if cfg!(target_os = "macos") {
            HostOs::Macos
        } else {
            HostOs::Linux
        };
        let shell_family = match os {
            HostOs::Windows => ShellFamily::Powershell,
            _ => ShellFamily::Posix,
        };
        Self {
            os,
            arch: std::env::consts::ARCH.to_string(),
            shell_family,
        }
    }

    /// Program and leading arguments used to run a one-line command string.
    pub fn shell_invocation(&self) -> (&'static str, &'static [&'static str]) {
        match self.shell_family {
            ShellFamily::Powershell => ("powershell", &["-NoProfile", "-Command"]),
            ShellFamily::Posix => ("sh", &["-c"]),
        }
    }
}
