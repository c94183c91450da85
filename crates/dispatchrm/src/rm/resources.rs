//! Cluster inventory reported by the launcher's resource query job.

use serde::{Deserialize, Serialize};

use crate::common::config::RmConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HpcPartition {
    pub partition_name: String,
    pub is_default: bool,
    pub total_available_nodes: u32,
    pub total_allocated_nodes: u32,
    pub total_nodes: u32,
    pub total_available_gpu_slots: u32,
    pub total_gpu_slots: u32,
    pub total_available_cpu_slots: u32,
    pub total_cpu_slots: u32,
    pub accelerator: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HpcNode {
    pub node_name: String,
    pub partitions: Vec<String>,
    pub addresses: Vec<String>,
    pub draining: bool,
    pub allocated: bool,
    pub gpu_count: u32,
    pub gpu_in_use_count: u32,
    pub cpu_count: u32,
    pub cpu_in_use_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HpcResources {
    pub partitions: Vec<HpcPartition>,
    pub nodes: Vec<HpcNode>,
    #[serde(skip)]
    pub default_compute_pool_partition: String,
    #[serde(skip)]
    pub default_aux_pool_partition: String,
}

impl HpcResources {
    /// Parses the YAML inventory and resolves the default pools.
    pub fn parse(content: &[u8], config: &RmConfig) -> crate::Result<Self> {
        let mut resources: HpcResources = serde_yaml::from_slice(content)?;
        let (compute, aux) = select_default_pools(&resources.partitions, config);
        resources.default_compute_pool_partition = compute;
        resources.default_aux_pool_partition = aux;
        Ok(resources)
    }

    pub fn partition(&self, name: &str) -> Option<&HpcPartition> {
        self.partitions.iter().find(|p| p.partition_name == name)
    }

    pub fn default_pool(&self, aux: bool) -> &str {
        if aux {
            &self.default_aux_pool_partition
        } else {
            &self.default_compute_pool_partition
        }
    }

    pub fn log_summary(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        log::debug!("HPC partitions: {:?}", self.partitions);
        let nodes_with_gpu = self.nodes.iter().filter(|n| n.gpu_count > 0).count();
        let allocated = self.nodes.iter().filter(|n| n.allocated).count();
        let gpus: u32 = self.nodes.iter().map(|n| n.gpu_count).sum();
        let gpus_allocated: u32 = self.nodes.iter().map(|n| n.gpu_in_use_count).sum();
        let cpus: u32 = self.nodes.iter().map(|n| n.cpu_count).sum();
        let cpus_allocated: u32 = self.nodes.iter().map(|n| n.cpu_in_use_count).sum();
        log::debug!(
            "Node summary: nodes={} allocated={allocated} with_gpu={nodes_with_gpu} \
             gpus={gpus} gpus_allocated={gpus_allocated} cpus={cpus} cpus_allocated={cpus_allocated}",
            self.nodes.len()
        );
    }
}

/// Chooses the default compute and aux partitions. Returns `(compute, aux)`.
///
/// The partition marked as default by the workload manager becomes the aux pool, and also
/// the compute pool if it has GPUs. Otherwise the first non-default partition (with GPUs
/// for compute) is used. Explicitly configured pools always win.
pub fn select_default_pools(partitions: &[HpcPartition], config: &RmConfig) -> (String, String) {
    let mut default_compute: Option<&str> = None;
    let mut default_aux: Option<&str> = None;
    let mut fallback_compute: Option<&str> = None;
    let mut fallback_aux: Option<&str> = None;

    for partition in partitions {
        let name = partition.partition_name.as_str();
        if partition.is_default {
            default_aux = Some(name);
            if partition.total_gpu_slots > 0 {
                default_compute = Some(name);
            }
        } else {
            fallback_aux.get_or_insert(name);
            if partition.total_gpu_slots > 0 {
                fallback_compute.get_or_insert(name);
            }
        }
    }

    let aux = default_aux.or(fallback_aux).unwrap_or_default();
    let compute = default_compute.or(fallback_compute).unwrap_or(aux);

    let compute = config
        .default_compute_resource_pool
        .clone()
        .unwrap_or_else(|| compute.to_string());
    let aux = config
        .default_aux_resource_pool
        .clone()
        .unwrap_or_else(|| aux.to_string());
    (compute, aux)
}
