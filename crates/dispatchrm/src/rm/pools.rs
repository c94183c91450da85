//! Resource pools and agents derived from the cluster inventory.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::common::config::{RmConfig, SlotType, WlmType};
use crate::common::error::RmError;
use crate::rm::resources::{HpcNode, HpcResources};
use crate::{Map, Set};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourcePoolSummary {
    pub name: String,
    pub description: String,
    pub num_agents: u32,
    pub slot_type: SlotType,
    pub slots_available: u32,
    pub slots_used: u32,
    pub aux_container_capacity: u32,
    pub aux_containers_running: u32,
    pub default_compute_pool: bool,
    pub default_aux_pool: bool,
    pub preemptible: bool,
    pub slots_per_agent: u32,
    pub scheduler_type: WlmType,
    pub accelerator: String,
}

/// Outcome of looking up a pool by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolValidation {
    pub has_resource_pool: bool,
    /// Partition behind a configured virtual pool.
    pub providing_partition: Option<String>,
    /// Directive problems of the pool. They are reported, not enforced.
    pub validation_errors: Vec<String>,
}

impl PoolValidation {
    /// Converts the lookup into the partition a task in pool `name` should be submitted to.
    pub fn into_partition(self, name: &str) -> crate::Result<String> {
        match (self.has_resource_pool, self.providing_partition) {
            (false, Some(partition)) => Err(RmError::ProviderPartitionMissing {
                pool: name.to_string(),
                partition,
            }),
            (false, None) => Err(RmError::PoolNotFound(name.to_string())),
            (true, _) if !self.validation_errors.is_empty() => Err(RmError::ConfigError(format!(
                "resource pool {name}: {}",
                self.validation_errors[0]
            ))),
            (true, Some(partition)) => Ok(partition),
            (true, None) => Ok(name.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub id: String,
    pub slot_type: SlotType,
    pub in_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agent {
    pub id: String,
    pub resource_pools: Vec<String>,
    pub addresses: Vec<String>,
    pub enabled: bool,
    pub draining: bool,
    /// Keyed by `/agents/<node>/slots/<index>`.
    pub slots: BTreeMap<String, Slot>,
}

/// Slot type of tasks submitted to `partition`: configured value first, then CPU for
/// known partitions without GPUs, CUDA otherwise.
pub fn resolve_slot_type(resources: &HpcResources, config: &RmConfig, partition: &str) -> SlotType {
    if let Some(slot_type) = config.configured_slot_type(partition) {
        return slot_type;
    }
    match resources.partition(partition) {
        Some(p) if p.total_gpu_slots == 0 => SlotType::Cpu,
        _ => SlotType::Cuda,
    }
}

pub fn summarize_pools(resources: &HpcResources, config: &RmConfig) -> Vec<ResourcePoolSummary> {
    let mut pools: Vec<ResourcePoolSummary> = resources
        .partitions
        .iter()
        .map(|partition| {
            let name = &partition.partition_name;
            let slot_type = resolve_slot_type(resources, config, name);
            let (slots_available, slots_used) = if slot_type == SlotType::Cpu {
                (
                    partition.total_cpu_slots,
                    partition
                        .total_cpu_slots
                        .saturating_sub(partition.total_available_cpu_slots),
                )
            } else {
                (
                    partition.total_gpu_slots,
                    partition
                        .total_gpu_slots
                        .saturating_sub(partition.total_available_gpu_slots),
                )
            };
            let slots_per_agent = slots_available.checked_div(partition.total_nodes).unwrap_or(0);
            let description = config
                .overrides(name)
                .and_then(|o| o.description.clone())
                .unwrap_or_else(|| format!("{}-managed pool of resources", config.wlm));
            ResourcePoolSummary {
                name: name.clone(),
                description,
                num_agents: partition.total_nodes,
                slot_type,
                slots_available,
                slots_used,
                aux_container_capacity: partition.total_cpu_slots,
                aux_containers_running: partition
                    .total_cpu_slots
                    .saturating_sub(partition.total_available_cpu_slots),
                default_compute_pool: name == resources.default_pool(false),
                default_aux_pool: name == resources.default_pool(true),
                preemptible: true,
                slots_per_agent,
                scheduler_type: config.wlm,
                accelerator: partition.accelerator.clone(),
            }
        })
        .collect();
    let provided = provided_pools(&pools, resources, config);
    pools.extend(provided);
    pools
}

/// Virtual pools from the configuration, each a copy of its providing partition's pool.
fn provided_pools(
    base: &[ResourcePoolSummary],
    resources: &HpcResources,
    config: &RmConfig,
) -> Vec<ResourcePoolSummary> {
    config
        .resource_pools
        .iter()
        .filter_map(|pool| {
            let partition = pool.provider_partition.as_ref()?;
            let Some(base_pool) = base.iter().find(|p| &p.name == partition) else {
                log::error!(
                    "Resource pool {} specifies provider partition '{partition}' that does not exist",
                    pool.pool_name
                );
                return None;
            };
            let mut provided = base_pool.clone();
            provided.name = pool.pool_name.clone();
            if !pool.description.is_empty() {
                provided.description = pool.description.clone();
            }
            provided.default_compute_pool = pool.pool_name == resources.default_pool(false);
            provided.default_aux_pool = pool.pool_name == resources.default_pool(true);
            Some(provided)
        })
        .collect()
}

/// Looks `name` up among the partitions and then among the configured virtual pools.
pub fn validate_pool(resources: &HpcResources, config: &RmConfig, name: &str) -> PoolValidation {
    if resources.partition(name).is_some() {
        return PoolValidation {
            has_resource_pool: true,
            ..Default::default()
        };
    }
    let Some((pool, partition)) = config
        .resource_pools
        .iter()
        .filter(|p| p.pool_name == name)
        .find_map(|p| Some((p, p.provider_partition.as_ref()?)))
    else {
        return PoolValidation::default();
    };
    if resources.partition(partition).is_some() {
        PoolValidation {
            has_resource_pool: true,
            providing_partition: Some(partition.clone()),
            validation_errors: pool.directive_errors(),
        }
    } else {
        PoolValidation {
            has_resource_pool: false,
            providing_partition: Some(partition.clone()),
            validation_errors: Vec::new(),
        }
    }
}

/// Resolves the partition used for a task requesting `slots` from pool `name`.
/// An empty name selects the default aux pool for zero slots and the default
/// compute pool otherwise.
pub fn resolve_resource_pool(
    resources: &HpcResources,
    config: &RmConfig,
    name: &str,
    slots: u32,
) -> crate::Result<String> {
    let mut name = name.to_string();
    if name.is_empty() && slots == 0 {
        name = resources.default_pool(true).to_string();
    }
    if name.is_empty() {
        name = resources.default_pool(false).to_string();
    }
    validate_pool(resources, config, &name).into_partition(&name)
}

/// Maps each providing partition to the virtual pools it provides.
pub fn provided_pools_map(config: &RmConfig) -> Map<String, Vec<String>> {
    let mut map: Map<String, Vec<String>> = Map::new();
    for pool in &config.resource_pools {
        if let Some(partition) = &pool.provider_partition {
            map.entry(partition.clone())
                .or_default()
                .push(pool.pool_name.clone());
        }
    }
    map
}

fn node_slot_type(node: &HpcNode, config: &RmConfig) -> SlotType {
    node.partitions
        .iter()
        .find_map(|p| config.configured_slot_type(p))
        .unwrap_or(SlotType::Cuda)
}

pub fn node_to_agent(node: &HpcNode, config: &RmConfig, disabled: &Set<String>) -> Agent {
    let provided = provided_pools_map(config);
    let mut resource_pools = node.partitions.clone();
    for partition in &node.partitions {
        if let Some(pools) = provided.get(partition) {
            resource_pools.extend(pools.iter().cloned());
        }
    }

    let (count, in_use, slot_type) = if node.gpu_count == 0 {
        (node.cpu_count, node.cpu_in_use_count, SlotType::Cpu)
    } else {
        (node.gpu_count, node.gpu_in_use_count, node_slot_type(node, config))
    };
    let slots = (0..count)
        .map(|index| {
            (
                format!("/agents/{}/slots/{index}", node.node_name),
                Slot {
                    id: index.to_string(),
                    slot_type,
                    in_use: index < in_use,
                },
            )
        })
        .collect();

    Agent {
        id: node.node_name.clone(),
        resource_pools,
        addresses: node.addresses.clone(),
        enabled: !disabled.contains(&node.node_name),
        draining: node.draining,
        slots,
    }
}

pub fn agents(resources: &HpcResources, config: &RmConfig, disabled: &Set<String>) -> Vec<Agent> {
    resources
        .nodes
        .iter()
        .map(|node| node_to_agent(node, config, disabled))
        .collect()
}

pub fn find_agent(
    resources: &HpcResources,
    config: &RmConfig,
    disabled: &Set<String>,
    agent_id: &str,
) -> Option<Agent> {
    resources
        .nodes
        .iter()
        .find(|n| n.node_name == agent_id)
        .map(|node| node_to_agent(node, config, disabled))
}
