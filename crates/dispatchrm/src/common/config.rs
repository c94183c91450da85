use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::error::RmError;
use crate::launcher::directives::{validate_pbs_directives, validate_slurm_directives};

/// Workload manager running behind the launcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WlmType {
    #[default]
    Slurm,
    Pbs,
}

impl Display for WlmType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WlmType::Slurm => f.write_str("Slurm"),
            WlmType::Pbs => f.write_str("PBS"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotType {
    Cpu,
    Cuda,
    Rocm,
}

impl Display for SlotType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotType::Cpu => f.write_str("cpu"),
            SlotType::Cuda => f.write_str("cuda"),
            SlotType::Rocm => f.write_str("rocm"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionOverrides {
    pub description: Option<String>,
    pub slot_type: Option<SlotType>,
    pub rendezvous_network_interface: Option<String>,
    pub proxy_network_interface: Option<String>,
}

/// A configured resource pool. A pool with `provider_partition` set is a virtual pool
/// that presents an existing partition under a different name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcePoolConfig {
    pub pool_name: String,
    #[serde(default)]
    pub description: String,
    pub provider_partition: Option<String>,
    /// Extra `#SBATCH` options applied to tasks in this pool.
    #[serde(default)]
    pub slurm: Vec<String>,
    /// Extra `#PBS` options applied to tasks in this pool.
    #[serde(default)]
    pub pbs: Vec<String>,
}

impl ResourcePoolConfig {
    /// Problems found in the scheduler directives of this pool.
    pub fn directive_errors(&self) -> Vec<String> {
        validate_pbs_directives(&self.pbs)
            .into_iter()
            .chain(validate_slurm_directives(&self.slurm))
            .map(|e| e.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RmConfig {
    pub wlm: WlmType,
    /// Account used by the launcher when no task-specific user applies.
    pub user_name: String,
    pub master_host: String,
    pub master_port: u16,
    pub slot_type: Option<SlotType>,
    pub default_compute_resource_pool: Option<String>,
    pub default_aux_resource_pool: Option<String>,
    pub tres_supported: bool,
    pub gres_supported: bool,
    pub rendezvous_network_interface: Option<String>,
    pub proxy_network_interface: Option<String>,
    /// Keep launcher environments of finished dispatches for troubleshooting.
    pub keep_dispatch_environments: bool,
    pub partition_overrides: Map<String, PartitionOverrides>,
    pub resource_pools: Vec<ResourcePoolConfig>,
}

impl Default for RmConfig {
    fn default() -> Self {
        Self {
            wlm: WlmType::Slurm,
            user_name: "launcher".to_string(),
            master_host: "localhost".to_string(),
            master_port: 8080,
            slot_type: None,
            default_compute_resource_pool: None,
            default_aux_resource_pool: None,
            tres_supported: true,
            gres_supported: true,
            rendezvous_network_interface: None,
            proxy_network_interface: None,
            keep_dispatch_environments: false,
            partition_overrides: Default::default(),
            resource_pools: Vec::new(),
        }
    }
}

impl RmConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overrides for `partition`. Keys are matched case-insensitively.
    pub fn overrides(&self, partition: &str) -> Option<&PartitionOverrides> {
        self.partition_overrides.get(partition).or_else(|| {
            self.partition_overrides
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(partition))
                .map(|(_, overrides)| overrides)
        })
    }

    pub fn pool(&self, name: &str) -> Option<&ResourcePoolConfig> {
        self.resource_pools.iter().find(|p| p.pool_name == name)
    }

    /// Slot type configured for `partition`, falling back to the global setting.
    pub fn configured_slot_type(&self, partition: &str) -> Option<SlotType> {
        self.overrides(partition)
            .and_then(|o| o.slot_type)
            .or(self.slot_type)
    }

    pub fn rendezvous_interface(&self, partition: &str) -> Option<String> {
        self.overrides(partition)
            .and_then(|o| o.rendezvous_network_interface.clone())
            .or_else(|| self.rendezvous_network_interface.clone())
    }

    pub fn proxy_interface(&self, partition: &str) -> Option<String> {
        self.overrides(partition)
            .and_then(|o| o.proxy_network_interface.clone())
            .or_else(|| self.proxy_network_interface.clone())
    }

    /// Checks the configuration for problems that do not require the cluster inventory.
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.tres_supported && !self.gres_supported {
            problems.push(
                "tres_supported: true cannot be used when gres_supported: false is specified"
                    .to_string(),
            );
        }
        let mut seen = crate::Set::new();
        for pool in &self.resource_pools {
            if pool.pool_name.is_empty() {
                problems.push("resource pool with an empty name".to_string());
                continue;
            }
            if !seen.insert(pool.pool_name.as_str()) {
                problems.push(format!("duplicate resource pool '{}'", pool.pool_name));
            }
            for error in pool.directive_errors() {
                problems.push(format!("resource pool '{}': {error}", pool.pool_name));
            }
        }
        problems
    }

    pub fn check_or_fail(&self) -> crate::Result<()> {
        let problems = self.check();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RmError::ConfigError(problems.join("; ")))
        }
    }
}
