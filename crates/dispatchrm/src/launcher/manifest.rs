use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::config::{SlotType, WlmType};
use crate::launcher::directives::{validate_pbs_directives, validate_slurm_directives};
use crate::{AllocationId, Map};

/// Name of the launcher payload that carries task containers.
pub const TASK_PAYLOAD_NAME: &str = "dispatchrm-task";
/// Name of the launcher payload that reports the cluster inventory.
pub const RESOURCES_PAYLOAD_NAME: &str = "SlurmResources";
/// Log file written by the inventory payload.
pub const RESOURCES_LOG_FILE: &str = "slurm-resources-info";

/// Account of tasks that have no agent user.
pub const ROOT_USER: &str = "root";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("task '{0}' has no command")]
    MissingCommand(String),
    #[error("no partition is available for task '{0}'")]
    MissingPartition(String),
}

/// What the owner of an allocation wants to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    pub owner_username: String,
    /// Cluster account the task runs under. Tasks without one run as `root`,
    /// which is refused unless the launcher itself runs as `root`.
    pub agent_user: Option<String>,
    pub command: Vec<String>,
    pub environment: Map<String, String>,
    pub slurm: Vec<String>,
    pub pbs: Vec<String>,
}

impl TaskSpec {
    pub fn impersonated_user(&self) -> &str {
        self.agent_user.as_deref().unwrap_or(ROOT_USER)
    }
}

/// Parameters resolved by the resource manager before a manifest is built.
#[derive(Debug, Clone)]
pub struct ManifestParams<'a> {
    pub allocation_id: &'a AllocationId,
    pub master_host: &'a str,
    pub master_port: u16,
    pub slots: u32,
    pub slot_type: SlotType,
    pub partition: &'a str,
    pub tres_supported: bool,
    pub gres_supported: bool,
    pub wlm: WlmType,
    pub disabled_agents: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub payload_name: String,
    pub allocation_id: Option<AllocationId>,
    pub master_url: Option<String>,
    pub command: Vec<String>,
    pub environment: Map<String, String>,
    pub slots: u32,
    pub slot_type: SlotType,
    pub partition: Option<String>,
    pub tres_supported: bool,
    pub gres_supported: bool,
    pub directives: Vec<String>,
    pub excluded_nodes: Vec<String>,
}

/// A manifest built for a task, together with the launch context derived from it.
#[derive(Debug)]
pub struct BuiltManifest {
    pub manifest: Manifest,
    pub impersonated_user: String,
    pub payload_name: String,
    /// Problems that did not prevent the launch, shown to the task owner.
    pub warning: Option<String>,
}

impl Manifest {
    /// Manifest of the synchronous job that reports partitions and nodes of the cluster.
    pub fn resources_query() -> Self {
        Manifest {
            name: "Dispatcher resource query".to_string(),
            payload_name: RESOURCES_PAYLOAD_NAME.to_string(),
            allocation_id: None,
            master_url: None,
            command: Vec::new(),
            environment: Map::new(),
            slots: 0,
            slot_type: SlotType::Cpu,
            partition: None,
            tres_supported: false,
            gres_supported: false,
            directives: Vec::new(),
            excluded_nodes: Vec::new(),
        }
    }
}

pub fn build_task_manifest(
    spec: &TaskSpec,
    params: &ManifestParams,
) -> Result<BuiltManifest, ManifestError> {
    if spec.command.is_empty() {
        return Err(ManifestError::MissingCommand(spec.description.clone()));
    }
    if params.partition.is_empty() {
        return Err(ManifestError::MissingPartition(spec.description.clone()));
    }

    let user_directives = match params.wlm {
        WlmType::Slurm => &spec.slurm,
        WlmType::Pbs => &spec.pbs,
    };
    let errors = match params.wlm {
        WlmType::Slurm => validate_slurm_directives(user_directives),
        WlmType::Pbs => validate_pbs_directives(user_directives),
    };
    let directives: Vec<String> = user_directives
        .iter()
        .filter(|d| !errors.iter().any(|e| e.directive() == d.as_str()))
        .cloned()
        .collect();
    let warning = if errors.is_empty() {
        None
    } else {
        let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Some(format!(
            "Some {} options were ignored: {}",
            params.wlm,
            reasons.join("; ")
        ))
    };

    let mut environment = spec.environment.clone();
    environment.insert("DISPATCHRM_ALLOCATION_ID".to_string(), params.allocation_id.clone());
    environment.insert("DISPATCHRM_SLOT_TYPE".to_string(), params.slot_type.to_string());

    let manifest = Manifest {
        name: spec.description.clone(),
        payload_name: TASK_PAYLOAD_NAME.to_string(),
        allocation_id: Some(params.allocation_id.clone()),
        master_url: Some(format!("http://{}:{}", params.master_host, params.master_port)),
        command: spec.command.clone(),
        environment,
        slots: params.slots,
        slot_type: params.slot_type,
        partition: Some(params.partition.to_string()),
        tres_supported: params.tres_supported,
        gres_supported: params.gres_supported,
        directives,
        excluded_nodes: params.disabled_agents.to_vec(),
    };
    Ok(BuiltManifest {
        manifest,
        impersonated_user: spec.impersonated_user().to_string(),
        payload_name: TASK_PAYLOAD_NAME.to_string(),
        warning,
    })
}
