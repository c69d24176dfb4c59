//! Remote compute instance types

use serde::{Deserialize, Serialize};

/// A GPU instance provisioned through the cloud provider's control API
///
/// `ip` is only populated once the provider reports the instance active.
/// Every instance handed out by a successful launch must be terminated
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub ip: Option<String>,
    pub status: InstanceStatus,
    pub region: String,
    pub instance_type: String,
}

impl Instance {
    /// Address to use for the remote shell, if the instance is reachable
    pub fn address(&self) -> Option<&str> {
        self.ip.as_deref()
    }
}

/// Instance status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Booting,
    Active,
    Unhealthy,
    Terminated,
    Failed,
    Unknown,
}

impl InstanceStatus {
    /// Parses the provider's status string (case and whitespace insensitive)
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "booting" => InstanceStatus::Booting,
            "active" => InstanceStatus::Active,
            "unhealthy" => InstanceStatus::Unhealthy,
            "terminated" | "terminating" => InstanceStatus::Terminated,
            "error" | "failed" => InstanceStatus::Failed,
            _ => InstanceStatus::Unknown,
        }
    }

    /// Statuses from which the instance will never become active
    pub fn is_dead(&self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Booting => "booting",
            InstanceStatus::Active => "active",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}
