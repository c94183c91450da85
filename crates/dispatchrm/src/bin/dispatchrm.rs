use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, ColorChoice, Style, Table, print_stdout};

use dispatchrm::common::config::RmConfig;
use dispatchrm::common::setup::setup_logging;
use dispatchrm::rm::pools::{agents, summarize_pools};
use dispatchrm::rm::resources::HpcResources;
use dispatchrm::store::{DispatchStore, FileStore};
use dispatchrm::{DISPATCHRM_VERSION, Set};

#[derive(Parser)]
#[command(name = "dispatchrm", version = DISPATCHRM_VERSION)]
struct RootOptions {
    /// Enables debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Checks a resource manager configuration file
    CheckConfig(ConfigOpts),
    /// Shows the resource pools described by an inventory file
    Pools(InventoryOpts),
    /// Shows the agents (nodes) described by an inventory file
    Agents(AgentOpts),
    /// Lists dispatches kept in a store file
    Dispatches(StoreOpts),
}

#[derive(Parser)]
struct ConfigOpts {
    /// Path to the TOML configuration
    #[arg(long, env = "DISPATCHRM_CONFIG")]
    config: PathBuf,
}

#[derive(Parser)]
struct InventoryOpts {
    /// Path to the TOML configuration, the defaults are used when omitted
    #[arg(long, env = "DISPATCHRM_CONFIG")]
    config: Option<PathBuf>,

    /// Inventory produced by the launcher resource query (YAML)
    #[arg(long)]
    inventory: PathBuf,
}

#[derive(Parser)]
struct AgentOpts {
    #[clap(flatten)]
    inventory: InventoryOpts,

    /// Store file with the set of disabled agents
    #[arg(long)]
    store: Option<PathBuf>,
}

#[derive(Parser)]
struct StoreOpts {
    /// Path to the JSON store file
    #[arg(long)]
    store: PathBuf,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RmConfig> {
    match path {
        Some(path) => RmConfig::load(path)
            .with_context(|| format!("Cannot load configuration {}", path.display())),
        None => Ok(RmConfig::default()),
    }
}

fn load_inventory(opts: &InventoryOpts) -> anyhow::Result<(RmConfig, HpcResources)> {
    let config = load_config(opts.config.as_deref())?;
    let content = std::fs::read(&opts.inventory)
        .with_context(|| format!("Cannot read inventory {}", opts.inventory.display()))?;
    let resources = HpcResources::parse(&content, &config)?;
    Ok((config, resources))
}

fn print_table(rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
    let table = rows
        .table()
        .separator(
            Separator::builder()
                .title(Some(Default::default()))
                .column(Some(Default::default()))
                .build(),
        )
        .title(header)
        .color_choice(ColorChoice::Auto);
    if let Err(e) = print_stdout(table) {
        log::error!("Cannot print table to stdout: {e:?}");
    }
}

fn header(names: &[&str]) -> Vec<CellStruct> {
    names.iter().map(|name| name.cell().bold(true)).collect()
}

fn command_check_config(opts: ConfigOpts) -> anyhow::Result<()> {
    let config = load_config(Some(&opts.config))?;
    let problems = config.check();
    if problems.is_empty() {
        println!("Configuration is valid ({} resource pool(s))", config.resource_pools.len());
        return Ok(());
    }
    for problem in &problems {
        println!("{problem}");
    }
    anyhow::bail!("Found {} problem(s) in {}", problems.len(), opts.config.display())
}

fn command_pools(opts: InventoryOpts) -> anyhow::Result<()> {
    let (config, resources) = load_inventory(&opts)?;
    let rows = summarize_pools(&resources, &config)
        .into_iter()
        .map(|pool| {
            let default = match (pool.default_compute_pool, pool.default_aux_pool) {
                (true, true) => "compute, aux",
                (true, false) => "compute",
                (false, true) => "aux",
                (false, false) => "",
            };
            vec![
                pool.name.cell().bold(true),
                pool.description.cell(),
                pool.slot_type.to_string().cell(),
                pool.num_agents.cell().justify(Justify::Right),
                format!("{}/{}", pool.slots_used, pool.slots_available)
                    .cell()
                    .justify(Justify::Right),
                format!("{}/{}", pool.aux_containers_running, pool.aux_container_capacity)
                    .cell()
                    .justify(Justify::Right),
                default.cell(),
                pool.accelerator.cell(),
            ]
        })
        .collect();
    print_table(
        rows,
        header(&[
            "Name",
            "Description",
            "Slot type",
            "Agents",
            "Slots used",
            "Aux used",
            "Default",
            "Accelerator",
        ]),
    );
    Ok(())
}

async fn command_agents(opts: AgentOpts) -> anyhow::Result<()> {
    let (config, resources) = load_inventory(&opts.inventory)?;
    let disabled: Set<String> = match &opts.store {
        Some(path) => FileStore::open(path)?
            .disabled_agents()
            .await?
            .into_iter()
            .collect(),
        None => Set::new(),
    };
    let rows = agents(&resources, &config, &disabled)
        .into_iter()
        .map(|agent| {
            let used = agent.slots.values().filter(|slot| slot.in_use).count();
            vec![
                agent.id.cell().bold(true),
                agent.resource_pools.join(", ").cell(),
                format!("{used}/{}", agent.slots.len())
                    .cell()
                    .justify(Justify::Right),
                agent.enabled.cell(),
                agent.draining.cell(),
            ]
        })
        .collect();
    print_table(
        rows,
        header(&["Agent", "Resource pools", "Slots used", "Enabled", "Draining"]),
    );
    Ok(())
}

async fn command_dispatches(opts: StoreOpts) -> anyhow::Result<()> {
    let store = FileStore::open(&opts.store)?;
    let mut rows = Vec::new();
    for dispatch in store.list_all_dispatches().await? {
        let finished = match store.allocation_by_id(&dispatch.allocation_id).await? {
            Some(allocation) if allocation.is_active() => "active".to_string(),
            Some(allocation) => allocation
                .end_time
                .map(|time| time.to_rfc3339())
                .unwrap_or_default(),
            None => "unknown".to_string(),
        };
        rows.push(vec![
            dispatch.dispatch_id.cell().bold(true),
            dispatch.allocation_id.cell(),
            dispatch.resource_id.cell(),
            dispatch.impersonated_user.cell(),
            finished.cell(),
        ]);
    }
    print_table(
        rows,
        header(&["Dispatch", "Allocation", "Resources", "User", "Allocation state"]),
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> dispatchrm::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.verbose);

    let result = match opts.subcmd {
        SubCommand::CheckConfig(opts) => command_check_config(opts),
        SubCommand::Pools(opts) => command_pools(opts),
        SubCommand::Agents(opts) => command_agents(opts).await,
        SubCommand::Dispatches(opts) => command_dispatches(opts).await,
    };
    if let Err(e) = result {
        log::error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
