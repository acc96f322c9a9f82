use serde::{Deserialize, Serialize};

/// Server lifecycle: active servers accept placements, draining servers
/// keep their VMs but take no new ones, dead servers are failover sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "server_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Draining,
    Drained,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "build_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Building,
    Successful,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "vm_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl VmStatus {
    /// Terminal states exempt the row from resource counting.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmStatus::Stopped | VmStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "deployment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Stopped | DeploymentStatus::Failed)
    }
}

macro_rules! impl_display_lowercase {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let s = match self {
                    $(Self::$variant => $text),+
                };
                f.write_str(s)
            }
        }

        impl std::str::FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant)),+,
                    other => anyhow::bail!("Unknown {} value: {}", stringify!($ty), other),
                }
            }
        }
    };
}

impl_display_lowercase!(ServerStatus {
    Active => "active",
    Draining => "draining",
    Drained => "drained",
    Dead => "dead",
});

impl_display_lowercase!(BuildStatus {
    Pending => "pending",
    Building => "building",
    Successful => "successful",
    Failed => "failed",
});

impl_display_lowercase!(VmStatus {
    Pending => "pending",
    Starting => "starting",
    Running => "running",
    Stopping => "stopping",
    Stopped => "stopped",
    Failed => "failed",
});

impl_display_lowercase!(DeploymentStatus {
    Pending => "pending",
    Building => "building",
    Starting => "starting",
    Running => "running",
    Stopping => "stopping",
    Stopped => "stopped",
    Failed => "failed",
});
