//! Networks, volumes and engine disk usage.

use std::collections::{BTreeMap, HashMap, HashSet};

use bollard::models::{
    BuildCache, ContainerSummary as EngineContainer, ImageSummary, Ipam, IpamConfig, Network,
    Volume,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions, PruneNetworksOptions};
use bollard::volume::{
    CreateVolumeOptions, ListVolumesOptions, PruneVolumesOptions, RemoveVolumeOptions,
};
use fd_protocol::{
    DiskUsageCategory, DiskUsageSummary, IpamSpec, NetworkCreated, NetworkSpec, NetworkSummary,
    NetworksPruned, VolumeCreated, VolumeSpec, VolumeSummary, VolumesPruned,
};
use tracing::info;

use crate::engine::{DockerEngine, display};
use crate::error::DockerError;

impl DockerEngine {
    pub async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkCreated, DockerError> {
        let driver = spec.validate().map_err(DockerError::Invalid)?;
        let options = CreateNetworkOptions::<String> {
            name: spec.name.clone(),
            driver: driver.to_string(),
            internal: spec.internal,
            attachable: spec.attachable,
            ingress: spec.ingress,
            enable_ipv6: spec.enable_ipv6,
            ipam: spec.ipam.as_ref().map(ipam).unwrap_or_default(),
            options: hash_map(&spec.options),
            labels: hash_map(&spec.labels),
            ..Default::default()
        };
        let created = self.client().create_network(options).await?;
        info!(network = %spec.name, driver, "Network created");
        Ok(NetworkCreated {
            id: created.id,
            warning: created.warning,
        })
    }

    /// All networks sorted by name, flagged when a container is attached.
    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>, DockerError> {
        let containers = self.raw_containers(true).await?;
        let networks = self
            .client()
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(network_summaries(networks, &containers))
    }

    pub async fn remove_network(&self, network_id: &str) -> Result<(), DockerError> {
        self.client().remove_network(network_id).await?;
        Ok(())
    }

    pub async fn prune_networks(&self) -> Result<NetworksPruned, DockerError> {
        let report = self
            .client()
            .prune_networks(None::<PruneNetworksOptions<String>>)
            .await?;
        Ok(NetworksPruned {
            networks_deleted: report.networks_deleted.unwrap_or_default(),
        })
    }

    pub async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeCreated, DockerError> {
        let driver = spec.validate().map_err(DockerError::Invalid)?;
        let options = CreateVolumeOptions::<String> {
            name: spec.name.clone(),
            driver: driver.to_string(),
            driver_opts: hash_map(&spec.driver_opts),
            labels: hash_map(&spec.labels),
        };
        let volume = self.client().create_volume(options).await?;
        info!(volume = %volume.name, driver = %volume.driver, "Volume created");
        Ok(VolumeCreated {
            name: volume.name,
            driver: volume.driver,
            mountpoint: volume.mountpoint,
        })
    }

    /// All volumes sorted by name, flagged when a container mounts them.
    pub async fn list_volumes(&self) -> Result<Vec<VolumeSummary>, DockerError> {
        let containers = self.raw_containers(true).await?;
        let volumes = self
            .client()
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?
            .volumes
            .unwrap_or_default();
        Ok(volume_summaries(volumes, &containers))
    }

    /// Remove a volume, even if it is still referenced.
    pub async fn remove_volume(&self, name: &str) -> Result<(), DockerError> {
        self.client()
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await?;
        Ok(())
    }

    pub async fn prune_volumes(&self, all: bool) -> Result<VolumesPruned, DockerError> {
        let filters = HashMap::from([("all".to_string(), vec![all.to_string()])]);
        let report = self
            .client()
            .prune_volumes(Some(PruneVolumesOptions { filters }))
            .await?;
        Ok(VolumesPruned {
            volumes_deleted: report.volumes_deleted.unwrap_or_default(),
            space_reclaimed: report.space_reclaimed.unwrap_or(0).max(0) as u64,
        })
    }

    pub async fn disk_usage(&self) -> Result<DiskUsageSummary, DockerError> {
        let usage = self.client().df(None::<bollard::query_parameters::DataUsageOptions>).await?;
        Ok(DiskUsageSummary {
            categories: vec![
                image_stats(&usage.images.unwrap_or_default()).category("Images"),
                container_stats(&usage.containers.unwrap_or_default()).category("Containers"),
                volume_stats(&usage.volumes.unwrap_or_default()).category("Local Volumes"),
                build_cache_stats(&usage.build_cache.unwrap_or_default()).category("Build Cache"),
            ],
        })
    }
}

fn hash_map(map: &BTreeMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn ipam(spec: &IpamSpec) -> Ipam {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    Ipam {
        driver: spec.driver.clone(),
        options: (!spec.options.is_empty()).then(|| hash_map(&spec.options)),
        config: Some(
            spec.config
                .iter()
                .map(|pool| IpamConfig {
                    subnet: non_empty(&pool.subnet),
                    gateway: non_empty(&pool.gateway),
                    ..Default::default()
                })
                .collect(),
        ),
    }
}

fn network_summaries(
    networks: Vec<Network>,
    containers: &[EngineContainer],
) -> Vec<NetworkSummary> {
    let attached: HashSet<String> = containers
        .iter()
        .filter_map(|c| c.network_settings.as_ref()?.networks.as_ref())
        .flat_map(|networks| networks.values())
        .filter_map(|endpoint| endpoint.network_id.clone())
        .collect();

    let mut items: Vec<NetworkSummary> = networks
        .into_iter()
        .map(|n| {
            let id = n.id.unwrap_or_default();
            NetworkSummary {
                in_use: attached.contains(&id),
                id,
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
                scope: n.scope.unwrap_or_default(),
            }
        })
        .collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

fn volume_summaries(volumes: Vec<Volume>, containers: &[EngineContainer]) -> Vec<VolumeSummary> {
    let mounted: HashSet<String> = containers
        .iter()
        .flat_map(|c| c.mounts.iter().flatten())
        .filter(|m| display(m.typ.as_ref()) == "volume")
        .filter_map(|m| m.name.clone())
        .collect();

    let mut items: Vec<VolumeSummary> = volumes
        .into_iter()
        .map(|v| VolumeSummary {
            in_use: mounted.contains(&v.name),
            name: v.name,
            driver: v.driver,
        })
        .collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

/// Counts and byte totals of one disk usage category.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ResourceStats {
    total: usize,
    active: usize,
    size: i64,
    reclaimable: i64,
}

impl ResourceStats {
    fn add(&mut self, size: i64, active: bool) {
        let size = size.max(0);
        self.total += 1;
        self.size += size;
        if active {
            self.active += 1;
        } else {
            self.reclaimable += size;
        }
    }

    fn category(self, kind: &str) -> DiskUsageCategory {
        let percent = percentage(self.reclaimable, self.size);
        DiskUsageCategory {
            kind: kind.to_string(),
            total: self.total,
            active: self.active,
            size: format_bytes(self.size),
            reclaimable: format!("{} ({percent:.2}%)", format_bytes(self.reclaimable)),
            reclaimable_percent: format!("{percent:.2}%"),
        }
    }
}

fn image_stats(images: &[ImageSummary]) -> ResourceStats {
    let mut stats = ResourceStats::default();
    for image in images {
        stats.add(image.size, image.containers != 0);
    }
    stats
}

fn container_stats(containers: &[EngineContainer]) -> ResourceStats {
    let mut stats = ResourceStats::default();
    for c in containers {
        let running = display(c.state.as_ref()) == "running";
        stats.add(c.size_rw.unwrap_or(0), running);
    }
    stats
}

/// Volumes are always counted as in use.
fn volume_stats(volumes: &[Volume]) -> ResourceStats {
    let mut stats = ResourceStats::default();
    for v in volumes {
        stats.add(v.usage_data.as_ref().map_or(0, |u| u.size), true);
    }
    stats
}

fn build_cache_stats(cache: &[BuildCache]) -> ResourceStats {
    let mut stats = ResourceStats::default();
    for record in cache {
        stats.add(record.size.unwrap_or(0), record.in_use.unwrap_or(false));
    }
    stats
}

fn percentage(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64 * 100.0
}

/// Binary-prefixed size with one decimal, e.g. `1.5KB`; plain bytes below 1024.
pub fn format_bytes(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    const PREFIXES: &[u8] = b"KMGTPE";
    if bytes < UNIT {
        return format!("{bytes}B");
    }
    let (mut div, mut exp) = (UNIT, 0);
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1}{}B", bytes as f64 / div as f64, PREFIXES[exp] as char)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerSummaryNetworkSettings, EndpointSettings, MountPoint, MountPointTypeEnum,
        VolumeUsageData,
    };
    use fd_protocol::IpamPool;

    fn attached_to(network_id: &str) -> EngineContainer {
        EngineContainer {
            network_settings: Some(ContainerSummaryNetworkSettings {
                networks: Some(HashMap::from([(
                    "backend".to_string(),
                    EndpointSettings {
                        network_id: Some(network_id.into()),
                        ..Default::default()
                    },
                )])),
            }),
            ..Default::default()
        }
    }

    fn network(id: &str, name: &str) -> Network {
        Network {
            id: Some(id.into()),
            name: Some(name.into()),
            driver: Some("bridge".into()),
            scope: Some("local".into()),
            ..Default::default()
        }
    }

    fn volume(name: &str, size: i64) -> Volume {
        Volume {
            name: name.into(),
            driver: "local".into(),
            usage_data: Some(VolumeUsageData { size, ref_count: 1 }),
            ..Default::default()
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(1023), "1023B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0GB");
    }

    #[test]
    fn test_networks_sorted_and_flagged() {
        let items = network_summaries(
            vec![network("n2", "frontend"), network("n1", "backend")],
            &[attached_to("n1"), EngineContainer::default()],
        );
        assert_eq!(items[0].name, "backend");
        assert!(items[0].in_use);
        assert_eq!(items[1].name, "frontend");
        assert!(!items[1].in_use);
    }

    #[test]
    fn test_only_volume_mounts_mark_volumes_in_use() {
        let container = EngineContainer {
            mounts: Some(vec![
                MountPoint {
                    typ: Some(MountPointTypeEnum::VOLUME),
                    name: Some("data".into()),
                    ..Default::default()
                },
                MountPoint {
                    typ: Some(MountPointTypeEnum::BIND),
                    name: Some("cache".into()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let items = volume_summaries(vec![volume("data", 0), volume("cache", 0)], &[container]);
        assert_eq!(items[0].name, "cache");
        assert!(!items[0].in_use);
        assert!(items[1].in_use);
    }

    #[test]
    fn test_image_usage_reclaims_unused_images() {
        let images = vec![
            ImageSummary {
                size: 3072,
                containers: 0,
                ..Default::default()
            },
            ImageSummary {
                size: 1024,
                containers: 2,
                ..Default::default()
            },
        ];
        let category = image_stats(&images).category("Images");
        assert_eq!(category.total, 2);
        assert_eq!(category.active, 1);
        assert_eq!(category.size, "4.0KB");
        assert_eq!(category.reclaimable, "3.0KB (75.00%)");
        assert_eq!(category.reclaimable_percent, "75.00%");
    }

    #[test]
    fn test_stopped_containers_are_reclaimable() {
        let containers = vec![
            EngineContainer {
                state: Some(bollard::models::ContainerSummaryStateEnum::RUNNING),
                size_rw: Some(100),
                ..Default::default()
            },
            EngineContainer {
                state: Some(bollard::models::ContainerSummaryStateEnum::EXITED),
                size_rw: Some(300),
                ..Default::default()
            },
        ];
        let stats = container_stats(&containers);
        assert_eq!((stats.active, stats.size, stats.reclaimable), (1, 400, 300));
    }

    #[test]
    fn test_volumes_count_as_active() {
        let stats = volume_stats(&[volume("a", 2048), volume("b", -1)]);
        assert_eq!((stats.total, stats.active, stats.size), (2, 2, 2048));
        assert_eq!(stats.category("Local Volumes").reclaimable, "0B (0.00%)");
    }

    #[test]
    fn test_empty_category_has_zero_percent() {
        let category = build_cache_stats(&[]).category("Build Cache");
        assert_eq!(category.size, "0B");
        assert_eq!(category.reclaimable_percent, "0.00%");
    }

    #[test]
    fn test_ipam_drops_empty_fields() {
        let spec = IpamSpec {
            config: vec![IpamPool {
                subnet: "10.10.0.0/24".into(),
                gateway: String::new(),
            }],
            ..Default::default()
        };
        let ipam = ipam(&spec);
        let config = ipam.config.unwrap();
        assert_eq!(config[0].subnet.as_deref(), Some("10.10.0.0/24"));
        assert_eq!(config[0].gateway, None);
        assert_eq!(ipam.options, None);
    }
}
