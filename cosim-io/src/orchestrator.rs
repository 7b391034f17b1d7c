//! The fixed-order coupling loop.
//!
//! Every coupling step invokes the registered callbacks in this order:
//!
//! ```text
//! AdvanceInTime -> InitializeSolutionStep -> SolveSolutionStep
//!     -> ExportMesh -> ImportMesh     (per mesh export policy)
//!     -> ExportData -> ImportData
//!     -> FinalizeSolutionStep
//! ```
//!
//! `Finalize` runs once after the last step. A failure in any phase abandons the rest of the run,
//! disconnects the connection and is returned unchanged.

use crate::{
    callback::Phase,
    connection::{Connection, ConnectionState},
    data::DataKind,
    error::{ProtocolError, Result},
};

/// What one call to [`Connection::run`] does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub num_steps: usize,
    pub start_time: f64,
    /// Mesh identifiers passed to `ExportMesh`, in order.
    pub export_meshes: Vec<String>,
    /// Mesh identifiers passed to `ImportMesh`, in order.
    pub import_meshes: Vec<String>,
    /// Field identifiers passed to `ExportData`, in order.
    pub export_data: Vec<String>,
    /// Field identifiers passed to `ImportData`, in order.
    pub import_data: Vec<String>,
}

impl RunOptions {
    pub fn new(num_steps: usize) -> Self {
        Self {
            num_steps,
            ..Default::default()
        }
    }

    pub fn start_time(mut self, start_time: f64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn export_mesh(mut self, identifier: impl Into<String>) -> Self {
        self.export_meshes.push(identifier.into());
        self
    }

    pub fn import_mesh(mut self, identifier: impl Into<String>) -> Self {
        self.import_meshes.push(identifier.into());
        self
    }

    pub fn export_data(mut self, identifier: impl Into<String>) -> Self {
        self.export_data.push(identifier.into());
        self
    }

    pub fn import_data(mut self, identifier: impl Into<String>) -> Self {
        self.import_data.push(identifier.into());
        self
    }

    /// Phases that must have a callback for this plan, with the identifier kind each one needs.
    fn required_phases(&self, steady_state: bool) -> Vec<(Phase, &[String], DataKind)> {
        let mut phases = vec![(Phase::SolveSolutionStep, &[][..], DataKind::Field)];
        if !steady_state {
            phases.push((Phase::AdvanceInTime, &[][..], DataKind::Field));
        }
        for (phase, identifiers, kind) in [
            (Phase::ExportMesh, &self.export_meshes, DataKind::Mesh),
            (Phase::ImportMesh, &self.import_meshes, DataKind::Mesh),
            (Phase::ExportData, &self.export_data, DataKind::Field),
            (Phase::ImportData, &self.import_data, DataKind::Field),
        ] {
            if !identifiers.is_empty() {
                phases.push((phase, identifiers.as_slice(), kind));
            }
        }
        phases
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub steps: usize,
    pub end_time: f64,
    /// Total number of callback invocations.
    pub invocations: usize,
}

impl Connection {
    /// Drive the registered callbacks through `options.num_steps` coupling steps.
    ///
    /// The connection must be [`ConnectionState::Connected`]; it is `Running` for the duration of
    /// the loop and `Connected` again afterwards. On error it is left `Disconnected`.
    pub fn run(&mut self, options: &RunOptions) -> Result<RunSummary> {
        self.expect_state(ConnectionState::Connected, "run")?;

        // fail before the first step rather than halfway through it
        for (phase, identifiers, kind) in options.required_phases(self.settings.steady_state) {
            if !self.callbacks.contains(phase) {
                return Err(ProtocolError::MissingCallback {
                    connection: self.name.clone(),
                    phase,
                }
                .into());
            }
            for identifier in identifiers {
                self.dictionary.check(&self.name, identifier, kind)?;
            }
        }

        self.state = ConnectionState::Running;
        match self.run_steps(options) {
            Ok(summary) => {
                self.state = ConnectionState::Connected;
                if self.settings.echo_level > 0 {
                    log::info!(
                        "Connection \"{}\" finished {} steps at t = {}",
                        self.name,
                        summary.steps,
                        summary.end_time
                    );
                }
                Ok(summary)
            }
            Err(err) => {
                log::error!("Connection \"{}\" aborted: {err}", self.name);
                if let Err(close_err) = self.close() {
                    log::warn!("Connection \"{}\": {close_err}", self.name);
                }
                Err(err)
            }
        }
    }

    fn run_steps(&mut self, options: &RunOptions) -> Result<RunSummary> {
        let steady_state = self.settings.steady_state;
        let mesh_export = self.settings.mesh_export;
        let mut time = options.start_time;
        let mut invocations = 0;

        for step in 0..options.num_steps {
            if !steady_state {
                let (callbacks, mut ctx) = self.split(step, time);
                if let Some(next) = ctx.invoke_time(callbacks, time)? {
                    log::trace!("Connection \"{}\": t = {time} -> {next}", ctx.connection());
                    time = next;
                    invocations += 1;
                }
            }
            let (callbacks, mut ctx) = self.split(step, time);

            let mut call = |phase: Phase, identifier: Option<&str>| -> Result<()> {
                if ctx.invoke(callbacks, phase, identifier)? {
                    invocations += 1;
                }
                Ok(())
            };

            call(Phase::InitializeSolutionStep, None)?;
            call(Phase::SolveSolutionStep, None)?;
            if mesh_export.applies_to(step) {
                for identifier in &options.export_meshes {
                    call(Phase::ExportMesh, Some(identifier.as_str()))?;
                }
                for identifier in &options.import_meshes {
                    call(Phase::ImportMesh, Some(identifier.as_str()))?;
                }
            }
            for identifier in &options.export_data {
                call(Phase::ExportData, Some(identifier.as_str()))?;
            }
            for identifier in &options.import_data {
                call(Phase::ImportData, Some(identifier.as_str()))?;
            }
            call(Phase::FinalizeSolutionStep, None)?;
        }

        let (callbacks, mut ctx) = self.split(options.num_steps, time);
        if ctx.invoke(callbacks, Phase::Finalize, None)? {
            invocations += 1;
        }

        Ok(RunSummary {
            steps: options.num_steps,
            end_time: time,
            invocations,
        })
    }
}
