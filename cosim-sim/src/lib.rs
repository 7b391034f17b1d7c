#![doc = include_str!("../README.md")]
#![deny(clippy::all)]

use std::{
    ffi::OsString,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use cosim_io::{
    Callback, CoSimIo, DataKind, ElementType, FieldData, MeshData, Phase, RunOptions, SettingsMap,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "cosim-sim", version)]
#[command(about = "Dummy solver participant for cosim-io couplings")]
pub struct Cli {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect, run the coupling loop for a number of steps and disconnect
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Connection name, shared with the partner
    #[arg(long)]
    pub name: String,
    /// Number of coupling steps
    #[arg(long, default_value_t = 1)]
    pub steps: usize,
    /// Simulation start time
    #[arg(long, default_value_t = 0.0)]
    pub start_time: f64,
    /// Time increment returned by AdvanceInTime
    #[arg(long, default_value_t = 0.1)]
    pub time_step: f64,
    /// Number of interface nodes, i.e. the size of exported fields
    #[arg(long, default_value_t = 3)]
    pub nodes: usize,
    /// Field identifier to export every step, can be given multiple times
    #[arg(long = "export", value_name = "IDENTIFIER")]
    pub export: Vec<String>,
    /// Field identifier to import every step, can be given multiple times
    #[arg(long = "import", value_name = "IDENTIFIER")]
    pub import: Vec<String>,
    /// Mesh identifier to export
    #[arg(long, value_name = "IDENTIFIER")]
    pub export_mesh: Vec<String>,
    /// Mesh identifier to import
    #[arg(long, value_name = "IDENTIFIER")]
    pub import_mesh: Vec<String>,
    /// Run as a steady-state solver (no AdvanceInTime)
    #[arg(long, default_value_t = false)]
    pub steady_state: bool,
    /// Connection setting, e.g. `-s communication_format=file`
    #[arg(short = 's', long = "setting", value_name = "KEY=VALUE", value_parser = parse_setting)]
    pub settings: Vec<(String, String)>,
}

impl RunArgs {
    pub fn new(name: impl Into<String>, steps: usize) -> Self {
        Self {
            name: name.into(),
            steps,
            start_time: 0.0,
            time_step: 0.1,
            nodes: 3,
            export: vec![],
            import: vec![],
            export_mesh: vec![],
            import_mesh: vec![],
            steady_state: false,
            settings: vec![],
        }
    }

    fn settings_map(&self) -> SettingsMap {
        let mut map: SettingsMap = self.settings.iter().cloned().collect();
        if self.steady_state {
            map.insert("steady_state".to_owned(), "true".to_owned());
        }
        map
    }
}

fn parse_setting(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got \"{s}\""))?;
    Ok((key.trim().to_owned(), value.trim().to_owned()))
}

/// Printed as one JSON line after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub name: String,
    pub steps: usize,
    pub end_time: f64,
    pub invocations: usize,
    /// Sum of every imported field, per identifier in import order, per step.
    pub imported_sums: Vec<f64>,
    /// Node count of every imported mesh.
    pub imported_mesh_nodes: Vec<usize>,
}

#[derive(Debug, Default)]
struct SolverState {
    field: FieldData,
    imported_sums: Vec<f64>,
    imported_mesh_nodes: Vec<usize>,
}

/// The synthetic field of step `step`: entry `i` is `(step + 1) * (i + 1)`.
pub fn synthetic_field(step: usize, nodes: usize) -> FieldData {
    (0..nodes)
        .map(|i| ((step + 1) * (i + 1)) as f64)
        .collect::<Vec<_>>()
        .into()
}

/// A straight line of `nodes` nodes along x, one line element per segment.
pub fn interface_mesh(nodes: usize) -> MeshData {
    MeshData::new(
        (0..nodes).map(|i| [i as f64, 0.0, 0.0]).collect(),
        (1..nodes).map(|i| vec![i - 1, i]).collect(),
        vec![ElementType::Line; nodes.saturating_sub(1)],
    )
}

/// Run one participant with a fresh [`CoSimIo`].
pub fn run(args: &RunArgs) -> anyhow::Result<RunReport> {
    run_with(&mut CoSimIo::new(), args)
}

/// Run one participant on `io`; two registries sharing an exchange can couple in one process.
pub fn run_with(io: &mut CoSimIo, args: &RunArgs) -> anyhow::Result<RunReport> {
    let name = args.name.as_str();
    io.connect(name, &args.settings_map())
        .with_context(|| format!("Connecting \"{name}\""))?;

    for id in args.export.iter().chain(&args.import) {
        io.declare_identifier(name, id, DataKind::Field)?;
    }
    for id in args.export_mesh.iter().chain(&args.import_mesh) {
        io.declare_identifier(name, id, DataKind::Mesh)?;
    }

    let state = Arc::new(Mutex::new(SolverState::default()));
    register_callbacks(io, args, &state)?;

    let options = RunOptions {
        num_steps: args.steps,
        start_time: args.start_time,
        export_meshes: args.export_mesh.clone(),
        import_meshes: args.import_mesh.clone(),
        export_data: args.export.clone(),
        import_data: args.import.clone(),
    };
    let summary = io
        .run(name, &options)
        .with_context(|| format!("Coupling loop of \"{name}\" failed"))?;
    io.disconnect(name)?;

    let state = state.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(RunReport {
        name: name.to_owned(),
        steps: summary.steps,
        end_time: summary.end_time,
        invocations: summary.invocations,
        imported_sums: state.imported_sums.clone(),
        imported_mesh_nodes: state.imported_mesh_nodes.clone(),
    })
}

fn register_callbacks(
    io: &mut CoSimIo,
    args: &RunArgs,
    state: &Arc<Mutex<SolverState>>,
) -> cosim_io::Result<()> {
    let name = args.name.as_str();

    if !args.steady_state {
        let dt = args.time_step;
        io.register_callback(name, Phase::AdvanceInTime, Callback::time(move |_, t| Ok(t + dt)))?;
    }

    io.register_callback(
        name,
        Phase::InitializeSolutionStep,
        Callback::step(|ctx| {
            log::debug!("Step {} at t = {}", ctx.step(), ctx.time());
            Ok(())
        }),
    )?;

    let nodes = args.nodes;
    let s = state.clone();
    io.register_callback(
        name,
        Phase::SolveSolutionStep,
        Callback::step(move |ctx| {
            s.lock().unwrap_or_else(PoisonError::into_inner).field = synthetic_field(ctx.step(), nodes);
            Ok(())
        }),
    )?;

    let s = state.clone();
    io.register_callback(
        name,
        Phase::ExportData,
        Callback::data(move |ctx, id| {
            let field = s.lock().unwrap_or_else(PoisonError::into_inner).field.clone();
            ctx.export_data(id, &field)?;
            Ok(())
        }),
    )?;

    let s = state.clone();
    io.register_callback(
        name,
        Phase::ImportData,
        Callback::data(move |ctx, id| {
            let field = ctx.import_data(id)?;
            let sum = field.values().iter().sum();
            s.lock().unwrap_or_else(PoisonError::into_inner).imported_sums.push(sum);
            Ok(())
        }),
    )?;

    io.register_callback(
        name,
        Phase::ExportMesh,
        Callback::data(move |ctx, id| {
            ctx.export_mesh(id, &interface_mesh(nodes))?;
            Ok(())
        }),
    )?;

    let s = state.clone();
    io.register_callback(
        name,
        Phase::ImportMesh,
        Callback::data(move |ctx, id| {
            let mesh = ctx.import_mesh(id)?;
            s.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .imported_mesh_nodes
                .push(mesh.num_nodes());
            Ok(())
        }),
    )?;

    io.register_callback(
        name,
        Phase::Finalize,
        Callback::step(|ctx| {
            log::info!("\"{}\" finished at t = {}", ctx.connection(), ctx.time());
            Ok(())
        }),
    )
}

pub fn entrypoint() -> anyhow::Result<()> {
    entrypoint_from(std::env::args_os())
}

pub fn entrypoint_from<I, T>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let Cli { verbose, command } = Cli::parse_from(args);

    flexi_logger::Logger::try_with_env_or_str(verbose.log_level_filter().as_str())?.start()?;

    match command {
        Commands::Run(args) => {
            let report = run(&args)?;
            println!("{}", serde_json::to_string(&report)?);
        }
    }

    Ok(())
}
