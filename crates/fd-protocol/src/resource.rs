//! Payloads of the network, volume and engine-wide tasks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Drivers accepted by [`NetworkSpec::validate`].
pub const NETWORK_DRIVERS: [&str; 7] = [
    "bridge", "default", "host", "overlay", "macvlan", "ipvlan", "none",
];
pub const DEFAULT_NETWORK_DRIVER: &str = "bridge";
pub const DEFAULT_VOLUME_DRIVER: &str = "local";

// ── Networks ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamSpec>,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub attachable: bool,
    #[serde(default)]
    pub ingress: bool,
    #[serde(default)]
    pub enable_ipv6: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub config: Vec<IpamPool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamPool {
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub gateway: String,
}

impl NetworkSpec {
    /// Check the request and return the driver to create it with.
    pub fn validate(&self) -> Result<&str, String> {
        if self.name.trim().is_empty() {
            return Err("network name cannot be empty".to_string());
        }
        let driver = match self.driver.as_deref() {
            None | Some("") => DEFAULT_NETWORK_DRIVER,
            Some(d) if NETWORK_DRIVERS.contains(&d) => d,
            Some(d) => {
                return Err(format!(
                    "invalid network driver: {d}. Valid options are: {}",
                    NETWORK_DRIVERS.join(", ")
                ));
            }
        };
        if let Some(ipam) = &self.ipam {
            for pool in ipam.config.iter().filter(|p| !p.subnet.is_empty()) {
                pool.subnet
                    .parse::<ipnet::IpNet>()
                    .map_err(|e| format!("invalid subnet format {:?}: {e}", pool.subnet))?;
            }
        }
        Ok(driver)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCreated {
    pub id: String,
    #[serde(default)]
    pub warning: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    /// Some container on the host is attached to it.
    pub in_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkListResponse {
    pub items: Vec<NetworkSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworksPruned {
    pub networks_deleted: Vec<String>,
}

// ── Volumes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub driver_opts: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn validate(&self) -> Result<&str, String> {
        if self.name.trim().is_empty() {
            return Err("volume name cannot be empty".to_string());
        }
        Ok(self
            .driver
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_VOLUME_DRIVER))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCreated {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
    /// Some container on the host mounts it.
    pub in_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeListResponse {
    pub items: Vec<VolumeSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumesPruned {
    pub volumes_deleted: Vec<String>,
    pub space_reclaimed: u64,
}

// ── Engine ──────────────────────────────────────────────────────

/// One row of the disk usage table: images, containers, local volumes or build cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsageCategory {
    #[serde(rename = "type")]
    pub kind: String,
    pub total: usize,
    pub active: usize,
    /// Human readable, e.g. `1.5GB`.
    pub size: String,
    /// Human readable with share of `size`, e.g. `512.0MB (33.33%)`.
    pub reclaimable: String,
    pub reclaimable_percent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsageSummary {
    pub categories: Vec<DiskUsageCategory>,
}

/// Swarm-wide facts as seen from a manager node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmClusterInfo {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
    /// `Index: <n>`.
    pub version: String,
    /// `Disabled`, or the start of the trust root certificate.
    pub tls_info: String,
    pub root_rotation_in_progress: bool,
    pub default_addr_pool: Vec<String>,
    pub subnet_size: u32,
    pub data_path_port: u32,
    pub spec: String,
    pub node_count: usize,
    pub manager_count: usize,
    pub worker_count: usize,
}
