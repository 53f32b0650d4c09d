use crate::RuntimeError;
use std::fmt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// A capability that the ambient environment can satisfy, such as an
/// installed command-line tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnvRequirement {
    Aws,
    Azure,
    Gcp,
    Kubectl,
    Helm,
    Terraform,
    Vault,
    Git,
    Docker,
    Jq,
    Unknown(String),
}

impl EnvRequirement {
    /// Map a capability name to its environment probe. Names are matched
    /// case-insensitively; `kubernetes` is an alias of `kubectl`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "aws" => Self::Aws,
            "azure" => Self::Azure,
            "gcp" => Self::Gcp,
            "kubectl" | "kubernetes" => Self::Kubectl,
            "helm" => Self::Helm,
            "terraform" => Self::Terraform,
            "vault" => Self::Vault,
            "git" => Self::Git,
            "docker" => Self::Docker,
            "jq" => Self::Jq,
            _ => Self::Unknown(name.to_owned()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
            Self::Kubectl => "kubectl",
            Self::Helm => "helm",
            Self::Terraform => "terraform",
            Self::Vault => "vault",
            Self::Git => "git",
            Self::Docker => "docker",
            Self::Jq => "jq",
            Self::Unknown(name) => name,
        }
    }

    /// Binary whose presence satisfies the requirement.
    pub fn binary(&self) -> Option<&'static str> {
        Some(match self {
            Self::Aws => "aws",
            Self::Azure => "az",
            Self::Gcp => "gcloud",
            Self::Kubectl => "kubectl",
            Self::Helm => "helm",
            Self::Terraform => "terraform",
            Self::Vault => "vault",
            Self::Git => "git",
            Self::Docker => "docker",
            Self::Jq => "jq",
            Self::Unknown(_) => return None,
        })
    }

    fn install_hint(&self) -> &'static str {
        match self {
            Self::Aws => "https://aws.amazon.com/cli/",
            Self::Azure => "https://learn.microsoft.com/cli/azure/install-azure-cli",
            Self::Gcp => "https://cloud.google.com/sdk/docs/install",
            Self::Kubectl => "https://kubernetes.io/docs/tasks/tools/",
            Self::Helm => "https://helm.sh/docs/intro/install/",
            Self::Terraform => "https://developer.hashicorp.com/terraform/install",
            Self::Vault => "https://developer.hashicorp.com/vault/install",
            Self::Git => "apt install git | dnf install git | pacman -S git",
            Self::Docker => "https://docs.docker.com/engine/install/",
            Self::Jq => "apt install jq | dnf install jq | pacman -S jq",
            Self::Unknown(_) => "",
        }
    }

    /// Whether the environment satisfies this requirement.
    ///
    /// Probes are bounded by `timeout`; a probe that does not finish in time
    /// counts as absent. An unknown requirement is an error, never `false`.
    pub fn probe(&self, timeout: Duration) -> Result<bool, RuntimeError> {
        match self.binary() {
            Some(bin) => Ok(command_exists_within(bin, timeout)),
            None => Err(RuntimeError::UnknownRequirement(self.name().to_owned())),
        }
    }

    pub fn missing(&self) -> MissingPrereq {
        MissingPrereq {
            name: self.name().to_owned(),
            binary: self.binary().unwrap_or_default(),
            install_hint: self.install_hint(),
        }
    }
}

impl fmt::Display for EnvRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn command_exists_within(name: &str, timeout: Duration) -> bool {
    let Ok(mut child) = Command::new("which")
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    else {
        return false;
    };
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
        }
    }
}

/// A missing environment requirement with actionable install instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrereq {
    pub name: String,
    pub binary: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: `{}` not found (install: {})",
            self.name, self.binary, self.install_hint
        )
    }
}

pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing environment requirements:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg
}
