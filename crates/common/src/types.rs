//! Core types for vncdesk

use serde::{Deserialize, Serialize};

/// Default VNC port an endpoint listens on
pub const DEFAULT_VNC_PORT: u16 = 5900;

/// Endpoint liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Active,
    Inactive,
    Installing,
    Error,
}

impl Default for EndpointStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl EndpointStatus {
    pub const ALL: [EndpointStatus; 4] = [
        EndpointStatus::Active,
        EndpointStatus::Inactive,
        EndpointStatus::Installing,
        EndpointStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Installing => "installing",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EndpointStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "installing" => Ok(Self::Installing),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "Invalid status. Must be one of: active, inactive, installing, error (got {})",
                s
            )),
        }
    }
}

/// A registered (or pending) remote machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
    pub location: String,
    pub country: String,
    pub city: String,
    pub status: EndpointStatus,
    pub last_seen: Option<i64>,
    pub installation_key: String,
    pub created_at: i64,
    pub port: u16,
    pub secret: String,
}

impl Endpoint {
    /// Address usable for dialing, if one has been registered.
    pub fn dial_address(&self) -> Option<&str> {
        self.address.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }
}

fn default_country() -> String {
    "Russia".to_string()
}

fn default_city() -> String {
    "Moscow".to_string()
}

/// Creation request for an endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEndpoint {
    pub name: String,
    pub location: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_city")]
    pub city: String,
}

/// Single-use registration credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationKey {
    pub id: String,
    pub key: String,
    pub machine_name: String,
    pub created_at: i64,
    pub used: bool,
    pub used_at: Option<i64>,
    pub endpoint_id: Option<String>,
}

/// Append-only lifecycle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: String,
    pub endpoint_id: String,
    pub action: String,
    pub details: String,
    pub timestamp: i64,
    pub origin_address: Option<String>,
}

/// Registration callback payload sent by the installer script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRegistration {
    #[serde(default)]
    pub installation_key: String,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub status: Option<EndpointStatus>,
}
