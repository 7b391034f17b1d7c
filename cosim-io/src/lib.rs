//! The `cosim-io` crate couples independently running numerical solvers. Each participant owns a
//! [`CoSimIo`] registry of named connections; through a connection it exchanges field data and
//! interface meshes with its partner, either directly or from callbacks that the orchestrator
//! invokes in a fixed per-step order.
//!
//! ## Examples
//!
//! ### Two participants in one process
//!
//! ```rust
//! use cosim_io::{CoSimIo, DataKind, FieldData, InProcessExchange, SettingsMap};
//!
//! let exchange = InProcessExchange::new();
//! let settings: SettingsMap = [("communication_format", "in_process")]
//!     .into_iter()
//!     .map(|(k, v)| (k.to_owned(), v.to_owned()))
//!     .collect();
//!
//! let mut structure = CoSimIo::with_exchange(exchange.clone());
//! let mut fluid = CoSimIo::with_exchange(exchange);
//! structure.connect("fsi", &settings).unwrap();
//! fluid.connect("fsi", &settings).unwrap();
//! structure.declare_identifier("fsi", "disp", DataKind::Field).unwrap();
//! fluid.declare_identifier("fsi", "disp", DataKind::Field).unwrap();
//!
//! structure.export_data("fsi", "disp", &FieldData::new(vec![0.1, 0.2])).unwrap();
//! assert_eq!(fluid.import_data("fsi", "disp").unwrap().values(), &[0.1, 0.2]);
//!
//! structure.disconnect("fsi").unwrap();
//! fluid.disconnect("fsi").unwrap();
//! ```
//!
//! ### Driving a solver through callbacks
//!
//! ```rust,no_run
//! use cosim_io::{Callback, CoSimIo, DataKind, FieldData, Phase, RunOptions, SettingsMap};
//!
//! let mut io = CoSimIo::new();
//! io.connect("fsi", &SettingsMap::new()).unwrap();
//! io.declare_identifier("fsi", "force", DataKind::Field).unwrap();
//! io.register_callback("fsi", Phase::AdvanceInTime, Callback::time(|_, t| Ok(t + 0.1))).unwrap();
//! io.register_callback("fsi", Phase::SolveSolutionStep, Callback::step(|_| Ok(()))).unwrap();
//! io.register_callback(
//!     "fsi",
//!     Phase::ExportData,
//!     Callback::data(|ctx, id| Ok(ctx.export_data(id, &FieldData::zeros(3))?)),
//! )
//! .unwrap();
//! io.run("fsi", &RunOptions::new(10).export_data("force")).unwrap();
//! ```
#![doc = document_features::document_features!()]
#![deny(clippy::all)]

use std::collections::{BTreeMap, BTreeSet};

pub mod callback;
pub mod connection;
pub mod data;
pub mod error;
pub mod orchestrator;
pub mod settings;
pub mod transfer;
pub mod transport;

pub use callback::{Callback, CallbackResult, Phase};
pub use connection::{Connection, ConnectionHandle, ConnectionState, SessionContext};
pub use data::{DataKind, ElementType, FieldData, InterfaceData, MeshData, Payload};
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::{RunOptions, RunSummary};
pub use settings::{CommunicationFormat, MeshExportPolicy, Settings, SettingsMap};
pub use transfer::{
    create_operator, DataTransferOperator, OperatorSettings, TransferOption, TransferOptions,
};
#[cfg(feature = "in-process")]
pub use transport::InProcessExchange;

use error::ConnectionError;

/// The named connections of one participant.
#[derive(Debug, Default)]
pub struct CoSimIo {
    connections: BTreeMap<String, Connection>,
    disconnected: BTreeSet<String>,
    #[cfg(feature = "in-process")]
    exchange: InProcessExchange,
}

impl CoSimIo {
    /// A registry with a private in-process exchange.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose in-process connections rendezvous through `exchange`.
    #[cfg(feature = "in-process")]
    pub fn with_exchange(exchange: InProcessExchange) -> Self {
        Self {
            exchange,
            ..Default::default()
        }
    }

    #[cfg(feature = "in-process")]
    pub fn exchange(&self) -> &InProcessExchange {
        &self.exchange
    }

    /// Validate `settings`, allocate the transport and register the connection under `name`.
    pub fn connect(&mut self, name: &str, settings: &SettingsMap) -> Result<ConnectionHandle> {
        if self.connections.contains_key(name) {
            return Err(ConnectionError::DuplicateConnection {
                connection: name.to_owned(),
            }
            .into());
        }

        let settings = Settings::from_map(name, settings)?;
        let connection = Connection::open(
            name,
            settings,
            #[cfg(feature = "in-process")]
            &self.exchange,
        )?;
        let handle = connection.handle();

        self.disconnected.remove(name);
        self.connections.insert(name.to_owned(), connection);
        Ok(handle)
    }

    /// Release the transport of `name`. The name can be connected again afterwards.
    pub fn disconnect(&mut self, name: &str) -> Result<()> {
        let mut connection = self
            .connections
            .remove(name)
            .ok_or_else(|| unknown(name))?;
        self.disconnected.insert(name.to_owned());
        connection.close()
    }

    pub fn connection(&self, name: &str) -> Result<&Connection> {
        self.connections.get(name).ok_or_else(|| unknown(name))
    }

    pub fn connection_mut(&mut self, name: &str) -> Result<&mut Connection> {
        self.connections.get_mut(name).ok_or_else(|| unknown(name))
    }

    /// `Uninitialized` for names never connected, `Disconnected` after [`CoSimIo::disconnect`].
    pub fn state(&self, name: &str) -> ConnectionState {
        match self.connections.get(name) {
            Some(connection) => connection.state(),
            None if self.disconnected.contains(name) => ConnectionState::Disconnected,
            None => ConnectionState::Uninitialized,
        }
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    pub fn settings(&self, name: &str) -> Result<&Settings> {
        self.connection(name).map(Connection::settings)
    }

    pub fn connection_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.connections.keys().map(String::as_str)
    }

    pub fn register_callback(
        &mut self,
        name: &str,
        phase: Phase,
        callback: Callback,
    ) -> Result<()> {
        self.connection_mut(name)?.register_callback(phase, callback)
    }

    /// Register by phase name.
    ///
    /// Unknown names fail with [`InvalidPhase`](error::ProtocolError::InvalidPhase).
    pub fn register_callback_named(
        &mut self,
        name: &str,
        phase: &str,
        callback: Callback,
    ) -> Result<()> {
        let phase = phase
            .parse::<Phase>()
            .map_err(|err| err.in_connection(name))?;
        self.register_callback(name, phase, callback)
    }

    pub fn declare_identifier(
        &mut self,
        name: &str,
        identifier: &str,
        kind: DataKind,
    ) -> Result<()> {
        self.connection_mut(name)?.declare_identifier(identifier, kind);
        Ok(())
    }

    pub fn export_data(&mut self, name: &str, identifier: &str, data: &FieldData) -> Result<()> {
        self.exchange_with(name, "export data", |ctx| ctx.export_data(identifier, data))
    }

    pub fn import_data(&mut self, name: &str, identifier: &str) -> Result<FieldData> {
        self.exchange_with(name, "import data", |ctx| ctx.import_data(identifier))
    }

    pub fn export_mesh(&mut self, name: &str, identifier: &str, mesh: &MeshData) -> Result<()> {
        self.exchange_with(name, "export a mesh", |ctx| ctx.export_mesh(identifier, mesh))
    }

    pub fn import_mesh(&mut self, name: &str, identifier: &str) -> Result<MeshData> {
        self.exchange_with(name, "import a mesh", |ctx| ctx.import_mesh(identifier))
    }

    /// Invoke the `AdvanceInTime` callback of `name`.
    pub fn advance_in_time(&mut self, name: &str, current_time: f64) -> Result<f64> {
        self.connection_mut(name)?.advance_in_time(current_time)
    }

    /// Run the coupling loop of `name`. A failed run leaves the connection disconnected.
    pub fn run(&mut self, name: &str, options: &RunOptions) -> Result<RunSummary> {
        let result = self.connection_mut(name)?.run(options);
        if result.is_err() {
            self.forget(name);
        }
        result
    }

    /// Direct exchanges disconnect on transport and data failures, like a failed coupling step.
    fn exchange_with<T>(
        &mut self,
        name: &str,
        operation: &'static str,
        f: impl FnOnce(&mut SessionContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let connection = self.connection_mut(name)?;
        connection.expect_state(ConnectionState::Connected, operation)?;

        let result = f(&mut connection.context());
        if let Err(err) = &result {
            if matches!(err.kind(), ErrorKind::Transport | ErrorKind::Data) {
                log::error!("Connection \"{name}\": {err}, disconnecting");
                if let Err(close_err) = connection.close() {
                    log::warn!("Connection \"{name}\": {close_err}");
                }
                self.forget(name);
            }
        }
        result
    }

    /// Drop a connection that already closed itself.
    fn forget(&mut self, name: &str) {
        if self.connections.remove(name).is_some() {
            self.disconnected.insert(name.to_owned());
        }
    }
}

fn unknown(name: &str) -> Error {
    ConnectionError::UnknownConnection {
        connection: name.to_owned(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use crate::error::ProtocolError;

    use super::*;

    fn in_process() -> SettingsMap {
        [
            ("communication_format", "in_process"),
            ("timeout_ms", "50"),
            ("poll_interval_ms", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    #[test]
    fn test_connect_twice() {
        let mut io = CoSimIo::new();
        let handle = io.connect("TAU", &in_process()).unwrap();
        assert_eq!(handle.name(), "TAU");
        assert!(matches!(
            io.connect("TAU", &in_process()),
            Err(Error::Connection(ConnectionError::DuplicateConnection { connection })) if connection == "TAU"
        ));
    }

    #[test]
    fn test_disconnect_unknown() {
        let mut io = CoSimIo::new();
        assert!(matches!(
            io.disconnect("Kratos"),
            Err(Error::Connection(ConnectionError::UnknownConnection { .. }))
        ));
    }

    #[test]
    fn test_lifecycle_states() {
        let mut io = CoSimIo::new();
        assert_eq!(io.state("c"), ConnectionState::Uninitialized);
        io.connect("c", &in_process()).unwrap();
        assert_eq!(io.state("c"), ConnectionState::Connected);
        io.disconnect("c").unwrap();
        assert_eq!(io.state("c"), ConnectionState::Disconnected);
        assert!(!io.is_connected("c"));

        // calls on a disconnected name are rejected
        assert!(matches!(
            io.register_callback("c", Phase::SolveSolutionStep, Callback::step(|_| Ok(()))),
            Err(Error::Connection(ConnectionError::UnknownConnection { .. }))
        ));
        assert!(matches!(
            io.disconnect("c"),
            Err(Error::Connection(ConnectionError::UnknownConnection { .. }))
        ));

        io.connect("c", &in_process()).unwrap();
        assert_eq!(io.state("c"), ConnectionState::Connected);
    }

    #[test]
    fn test_invalid_settings_leave_nothing_behind() {
        let mut io = CoSimIo::new();
        let mut settings = in_process();
        settings.insert("echo_level".into(), "-3".into());
        assert!(matches!(
            io.connect("c", &settings),
            Err(Error::Connection(ConnectionError::InvalidSettings { .. }))
        ));
        assert_eq!(io.state("c"), ConnectionState::Uninitialized);
    }

    #[test]
    fn test_register_by_phase_name() {
        let mut io = CoSimIo::new();
        io.connect("c", &in_process()).unwrap();
        io.register_callback_named("c", "FinalizeSolutionStep", Callback::step(|_| Ok(())))
            .unwrap();
        let err = io
            .register_callback_named("c", "Terminate", Callback::step(|_| Ok(())))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidPhase { .. })
        ));
        assert_eq!(
            err.to_string(),
            "Connection \"c\": \"Terminate\" is not a recognized phase"
        );
    }

    #[test_log::test]
    fn test_import_timeout_disconnects() {
        let mut io = CoSimIo::new();
        io.connect("c", &in_process()).unwrap();
        io.declare_identifier("c", "disp", DataKind::Field).unwrap();
        let err = io.import_data("c", "disp").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(io.state("c"), ConnectionState::Disconnected);
    }

    #[test]
    fn test_advance_in_time_on_steady_state() {
        let mut io = CoSimIo::new();
        let mut settings = in_process();
        settings.insert("steady_state".into(), "true".into());
        io.connect("c", &settings).unwrap();
        assert!(matches!(
            io.advance_in_time("c", 0.0),
            Err(Error::Protocol(ProtocolError::NotImplementedForSteadyState { .. }))
        ));
    }
}
