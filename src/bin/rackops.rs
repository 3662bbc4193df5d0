// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use rackops::{
    batch::{self, BatchSummary, BmcReply, PowerPlan},
    bmc::{BmcClient, BmcRequest, BootDevice},
    config::Settings,
    node::{NodeName, RackName, RackSelector},
    path::{default_connection_map_path, default_settings_path},
    power::{
        map::ConnectionMap,
        outlet::TargetState,
        startup::{MonitorState, NodeStartupStatus, StartupMonitor},
        NodePowerSequencer,
    },
    rack::{KubectlSource, RackEvaluator, RackReadiness, ReadinessPolicy},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use inquire::Confirm;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::Display,
    path::PathBuf,
    process::exit,
    sync::Mutex,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  rackops [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to settings file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Cluster context to query instead of the configured one.
    #[arg(long, global = true, value_name = "context")]
    pub context: Option<String>,

    /// Path to PDU connection map instead of the configured one.
    #[arg(short, long, global = true, value_name = "path")]
    pub map: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let settings = self.load_settings()?;
        match self.command {
            Command::Power(PowerCommand::Set(opts)) => {
                run_power_set(settings, self.map, opts).await
            }
            Command::Power(PowerCommand::Status(opts)) => {
                run_power_status(settings, self.map, opts).await
            }
            Command::Rack(RackCommand::Status(opts)) => run_rack_status(settings, opts).await,
            Command::Bmc(BmcCommand::Power(opts)) => run_bmc_power(settings, opts).await,
            Command::Bmc(BmcCommand::Bootdev(opts)) => run_bmc_bootdev(settings, opts).await,
            Command::Bmc(BmcCommand::Chassis(opts)) => run_bmc_chassis(settings, opts).await,
            Command::Bmc(BmcCommand::Users(opts)) => run_bmc_users(settings, opts).await,
            Command::Map(MapCommand::Show(opts)) => run_map_show(settings, self.map, opts),
            Command::Config => run_config(settings),
        }
    }

    fn load_settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => {
                let path = default_settings_path()?;
                if path.exists() {
                    Settings::load(path)?
                } else {
                    Settings::default()
                }
            }
        };

        if let Some(context) = &self.context {
            settings.cluster.context = Some(context.clone());
        }

        Ok(settings)
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Switch or inspect node power through PDU outlets.
    #[command(subcommand)]
    Power(PowerCommand),

    /// Judge rack readiness from cluster node state.
    #[command(subcommand)]
    Rack(RackCommand),

    /// Talk to node BMCs out of band.
    #[command(subcommand)]
    Bmc(BmcCommand),

    /// Inspect PDU connection map.
    #[command(subcommand)]
    Map(MapCommand),

    /// Show effective settings.
    Config,
}

#[derive(Debug, Clone, Subcommand)]
enum PowerCommand {
    /// Drive every outlet of target nodes to target state.
    #[command(override_usage = "rackops power set [options] <on|off> <node>...")]
    Set(PowerSetOptions),

    /// Read state of every outlet of target nodes.
    #[command(override_usage = "rackops power status [options] <node>...")]
    Status(NodeListOptions),
}

#[derive(Debug, Clone, Subcommand)]
enum RackCommand {
    /// Evaluate readiness of target racks.
    #[command(override_usage = "rackops rack status [options] <rack>...")]
    Status(RackStatusOptions),
}

#[derive(Debug, Clone, Subcommand)]
enum BmcCommand {
    /// Query or switch chassis power.
    #[command(override_usage = "rackops bmc power [options] <status|on|off|cycle> <node>...")]
    Power(BmcPowerOptions),

    /// Select boot device for next start.
    #[command(override_usage = "rackops bmc bootdev [options] <pxe|disk|bios> <node>...")]
    Bootdev(BmcBootdevOptions),

    /// Show full chassis status.
    #[command(override_usage = "rackops bmc chassis [options] <node>...")]
    Chassis(NodeListOptions),

    /// List BMC users.
    #[command(override_usage = "rackops bmc users [options] <node>")]
    Users(BmcUsersOptions),
}

#[derive(Debug, Clone, Subcommand)]
enum MapCommand {
    /// Show outlets feeding target nodes.
    #[command(override_usage = "rackops map show [options] <node>...")]
    Show(NodeListOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PowerSetOptions {
    /// Power state to drive outlets to.
    #[arg(required = true, value_name = "on|off")]
    pub state: TargetState,

    /// Nodes to switch, e.g., c0r21-gn1.
    #[arg(required = true, value_name = "node")]
    pub nodes: Vec<NodeName>,

    /// Show what would be switched without touching any outlet.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Wait until nodes answer steadily after powering on.
    #[arg(short, long)]
    pub verify_reachable: bool,

    /// Seconds to wait for startup confirmation.
    #[arg(short, long, value_name = "secs", requires = "verify_reachable")]
    pub timeout: Option<u64>,

    /// Do not ask before powering nodes off.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct NodeListOptions {
    /// Target nodes, e.g., c0r21-gn1.
    #[arg(required = true, value_name = "node")]
    pub nodes: Vec<NodeName>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RackStatusOptions {
    /// Racks or cross-rack pairs, e.g., c0r21 or c0r21-c0r22.
    #[arg(required = true, value_name = "rack")]
    pub racks: Vec<RackSelector>,

    /// Node count every rack must have.
    #[arg(short, long, value_name = "count")]
    pub expected_nodes: Option<u32>,

    /// Print verdicts as JSON.
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BmcPowerAction {
    Status,
    On,
    Off,
    Cycle,
}

impl From<BmcPowerAction> for BmcRequest {
    fn from(action: BmcPowerAction) -> Self {
        match action {
            BmcPowerAction::Status => Self::PowerStatus,
            BmcPowerAction::On => Self::PowerOn,
            BmcPowerAction::Off => Self::PowerOff,
            BmcPowerAction::Cycle => Self::PowerCycle,
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BmcPowerOptions {
    /// Chassis power action.
    #[arg(required = true, value_enum, value_name = "action")]
    pub action: BmcPowerAction,

    /// Target nodes, e.g., c0r21-gn1.
    #[arg(required = true, value_name = "node")]
    pub nodes: Vec<NodeName>,

    /// Do not ask before powering nodes off or cycling them.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BmcBootdevOptions {
    /// Boot device for next start.
    #[arg(required = true, value_name = "device")]
    pub device: BootDevice,

    /// Target nodes, e.g., c0r21-gn1.
    #[arg(required = true, value_name = "node")]
    pub nodes: Vec<NodeName>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BmcUsersOptions {
    /// Target node, e.g., c0r21-gn1.
    #[arg(required = true, value_name = "node")]
    pub node: NodeName,
}

#[derive(Serialize)]
struct RackStatusReport<'a> {
    racks: &'a [RackReadiness],
    summary: BatchSummary,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_sequencer(settings: &Settings, map: Option<PathBuf>) -> Result<NodePowerSequencer> {
    let path = match map.or_else(|| settings.pdu.map.clone()) {
        Some(path) => path,
        None => default_connection_map_path()?,
    };

    let map = ConnectionMap::load(&path, |warning| warn!("{}: {warning}", path.display()))
        .with_context(|| format!("cannot load connection map {}", path.display()))?;
    for conflict in map.conflicts() {
        warn!("{}: {conflict}", path.display());
    }

    Ok(NodePowerSequencer::from_settings(map, settings))
}

fn confirm(message: &str, skip: bool) -> Result<bool> {
    if skip {
        return Ok(true);
    }

    Ok(Confirm::new(message).with_default(false).prompt()?)
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping startup monitors");
            trigger.cancel();
        }
    });

    cancel
}

fn finish(summary: BatchSummary) -> Result<()> {
    println!("{summary}");
    if !summary.is_success() {
        bail!(
            "{} of {} operations did not succeed",
            summary.failed + summary.unconfirmed,
            summary.total()
        );
    }

    Ok(())
}

/// Spinners for nodes whose startup is being confirmed.
struct StartupSpinners {
    bars: MultiProgress,
    style: ProgressStyle,
    spinners: Mutex<HashMap<NodeName, ProgressBar>>,
}

impl StartupSpinners {
    fn new() -> Result<Self> {
        let style = ProgressStyle::with_template("{spinner:.green} {elapsed:>4.yellow}  {msg}")?;
        Ok(Self {
            bars: MultiProgress::new(),
            style,
            spinners: Mutex::new(HashMap::new()),
        })
    }

    fn update(&self, node: &NodeName, status: &NodeStartupStatus) {
        let Ok(mut spinners) = self.spinners.lock() else {
            return;
        };

        let spinner = spinners.entry(*node).or_insert_with(|| {
            let spinner = self.bars.add(ProgressBar::new_spinner());
            spinner.set_style(self.style.clone());
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner
        });

        match status.state {
            MonitorState::Confirmed => {
                spinner.finish_with_message(format!("{}: reachable", status.fqdn));
            }
            MonitorState::TimedOut => {
                spinner.abandon_with_message(format!("{}: not reachable", status.fqdn));
            }
            MonitorState::Checking | MonitorState::Waiting => spinner.set_message(format!(
                "{}: {} consecutive answers",
                status.fqdn, status.consecutive_success_count
            )),
        }
    }
}

async fn run_power_set(
    settings: Settings,
    map: Option<PathBuf>,
    opts: PowerSetOptions,
) -> Result<()> {
    let sequencer = load_sequencer(&settings, map)?;

    if opts.state == TargetState::Off && !opts.dry_run {
        let message = format!("Power off {} node(s)?", opts.nodes.len());
        if !confirm(&message, opts.yes)? {
            info!("nothing switched");
            return Ok(());
        }
    }

    let verify_reachable = opts.verify_reachable.then(|| {
        opts.timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.startup.timeout())
    });
    let plan = PowerPlan {
        target: opts.state,
        dry_run: opts.dry_run,
        verify_reachable,
        concurrency: settings.batch.concurrency,
    };

    let monitor = StartupMonitor::from_settings(&settings.startup);
    let spinners = StartupSpinners::new()?;
    let cancel = cancel_on_interrupt();
    let (outcomes, summary) = batch::power_nodes(
        &sequencer,
        &monitor,
        &opts.nodes,
        plan,
        &settings.cluster.domain_suffix,
        &cancel,
        |node, status| spinners.update(node, status),
    )
    .await;

    for outcome in &outcomes {
        print!("{outcome}");
    }

    finish(summary)
}

async fn run_power_status(
    settings: Settings,
    map: Option<PathBuf>,
    opts: NodeListOptions,
) -> Result<()> {
    let sequencer = load_sequencer(&settings, map)?;
    let (states, summary) =
        batch::outlet_states(&sequencer, &opts.nodes, settings.batch.concurrency).await;

    for (node, states) in states {
        match states {
            Ok(states) => {
                println!("{node}:");
                for (outlet, state) in states {
                    println!("  {} -> {state}", outlet.connection);
                }
            }
            Err(error) => println!("{node}: FAILED: {error}"),
        }
    }

    finish(summary)
}

async fn run_rack_status(settings: Settings, opts: RackStatusOptions) -> Result<()> {
    let mut policy = ReadinessPolicy::from_settings(&settings.rack);
    if let Some(expected_nodes) = opts.expected_nodes {
        policy = policy.with_expected_nodes(expected_nodes);
    }

    let source = KubectlSource::new(
        settings.cluster.context.clone(),
        settings.batch.operation_timeout(),
    );
    let evaluator = RackEvaluator::new(source, policy);

    let mut racks: Vec<RackName> = Vec::new();
    for rack in opts.racks.iter().flat_map(RackSelector::racks) {
        if !racks.contains(&rack) {
            racks.push(rack);
        }
    }

    let (verdicts, summary) = batch::evaluate_racks(
        &evaluator,
        &racks,
        settings.batch.concurrency,
        settings.batch.operation_timeout(),
    )
    .await;

    if opts.json {
        let report = RackStatusReport {
            racks: &verdicts,
            summary,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !summary.is_success() {
            bail!("{} of {} racks not ready", summary.failed, summary.total());
        }
        return Ok(());
    }

    for verdict in &verdicts {
        print!("{verdict}");
    }

    finish(summary)
}

fn print_bmc_replies<O: Display>(replies: Vec<BmcReply<O>>) {
    for reply in replies {
        match reply.output {
            Ok(output) => println!("{} ({}): {output}", reply.node, reply.host),
            Err(error) => println!("{} ({}): FAILED: {error}", reply.node, reply.host),
        }
    }
}

async fn send_bmc_request(
    settings: &Settings,
    nodes: &[NodeName],
    request: BmcRequest,
) -> Result<()> {
    let client = BmcClient::from_settings(&settings.bmc, settings.cluster.domain_suffix.as_str());
    let (replies, summary) = batch::bmc_requests(
        &client,
        nodes,
        request,
        settings.batch.concurrency,
        settings.batch.operation_timeout(),
    )
    .await;
    print_bmc_replies(replies);

    finish(summary)
}

async fn run_bmc_power(settings: Settings, opts: BmcPowerOptions) -> Result<()> {
    if opts.action == BmcPowerAction::Status {
        let client =
            BmcClient::from_settings(&settings.bmc, settings.cluster.domain_suffix.as_str());
        let (replies, summary) = batch::bmc_power_states(
            &client,
            &opts.nodes,
            settings.batch.concurrency,
            settings.batch.operation_timeout(),
        )
        .await;
        print_bmc_replies(replies);

        return finish(summary);
    }

    if matches!(opts.action, BmcPowerAction::Off | BmcPowerAction::Cycle) {
        let message = format!("Send power {:?} to {} BMC(s)?", opts.action, opts.nodes.len());
        if !confirm(&message, opts.yes)? {
            info!("nothing sent");
            return Ok(());
        }
    }

    send_bmc_request(&settings, &opts.nodes, BmcRequest::from(opts.action)).await
}

async fn run_bmc_bootdev(settings: Settings, opts: BmcBootdevOptions) -> Result<()> {
    send_bmc_request(&settings, &opts.nodes, BmcRequest::BootDevice(opts.device)).await
}

async fn run_bmc_chassis(settings: Settings, opts: NodeListOptions) -> Result<()> {
    send_bmc_request(&settings, &opts.nodes, BmcRequest::ChassisStatus).await
}

async fn run_bmc_users(settings: Settings, opts: BmcUsersOptions) -> Result<()> {
    send_bmc_request(&settings, &[opts.node], BmcRequest::UserList).await
}

fn run_map_show(settings: Settings, map: Option<PathBuf>, opts: NodeListOptions) -> Result<()> {
    let sequencer = load_sequencer(&settings, map)?;
    let mut summary = BatchSummary::default();

    for node in &opts.nodes {
        match sequencer.outlets(node) {
            Ok(outlets) => {
                println!("{node} ({}):", node.map_id());
                for outlet in outlets {
                    println!("  {outlet}");
                }
                summary.record(batch::ItemOutcome::Succeeded);
            }
            Err(error) => {
                println!("{node}: {error}");
                summary.record(batch::ItemOutcome::Failed);
            }
        }
    }

    finish(summary)
}

fn run_config(mut settings: Settings) -> Result<()> {
    if !settings.bmc.password.is_empty() {
        settings.bmc.password = "********".into();
    }
    if !settings.pdu.community.is_empty() {
        settings.pdu.community = "********".into();
    }
    print!("{settings}");

    Ok(())
}
