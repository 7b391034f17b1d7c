//! One named coupling connection and the context handed to its callbacks.

use std::time::Instant;

use crate::{
    callback::{Callback, CallbackRegistry, Phase},
    data::{DataDictionary, DataKind, FieldData, InterfaceData, MeshData, Payload},
    error::{CallbackError, DataError, Error, ProtocolError, Result},
    settings::{CommunicationFormat, Settings},
    transfer::{DataTransferOperator, TransferOptions},
    transport::Transport,
};

#[cfg(feature = "in-process")]
use crate::transport::InProcessExchange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connected,
    /// The coupling loop is executing.
    Running,
    Disconnected,
}

/// Returned by `connect`; names the connection in all further calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    name: String,
}

impl ConnectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct Connection {
    pub(crate) name: String,
    pub(crate) settings: Settings,
    pub(crate) state: ConnectionState,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) dictionary: DataDictionary,
    pub(crate) transport: Box<dyn Transport>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Allocate the transport selected by `settings` and enter [`ConnectionState::Connected`].
    pub(crate) fn open(
        name: &str,
        settings: Settings,
        #[cfg(feature = "in-process")] exchange: &InProcessExchange,
    ) -> Result<Self> {
        let transport: Box<dyn Transport> = match settings.communication_format {
            #[cfg(feature = "file")]
            CommunicationFormat::File => {
                Box::new(crate::transport::FileTransport::open(name, &settings)?)
            }
            #[cfg(feature = "in-process")]
            CommunicationFormat::InProcess => Box::new(exchange.open(name, &settings)),
            #[allow(unreachable_patterns)]
            other => {
                return Err(crate::error::ConnectionError::InvalidSettings {
                    connection: name.to_owned(),
                    key: "communication_format".to_owned(),
                    reason: format!("{other:?} is not enabled in this build"),
                }
                .into())
            }
        };

        if settings.echo_level > 0 {
            log::info!(
                "Connection \"{name}\" connected to \"{}\" via {:?}",
                settings.partner_name,
                settings.communication_format
            );
        }

        Ok(Self {
            name: name.to_owned(),
            settings,
            state: ConnectionState::Connected,
            callbacks: CallbackRegistry::default(),
            dictionary: DataDictionary::default(),
            transport,
        })
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            name: self.name.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Name of the local solver, used when building [`InterfaceData`].
    pub fn solver_name(&self) -> &str {
        self.settings.solver_name.as_deref().unwrap_or(&self.name)
    }

    pub fn dictionary(&self) -> &DataDictionary {
        &self.dictionary
    }

    pub(crate) fn expect_state(
        &self,
        state: ConnectionState,
        operation: &'static str,
    ) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(ProtocolError::InvalidState {
                connection: self.name.clone(),
                state: self.state,
                operation,
            }
            .into())
        }
    }

    pub fn register_callback(&mut self, phase: Phase, callback: Callback) -> Result<()> {
        self.callbacks.register(&self.name, phase, callback)?;
        log::debug!("Connection \"{}\": registered {phase} callback", self.name);
        Ok(())
    }

    pub fn declare_identifier(&mut self, identifier: impl Into<String>, kind: DataKind) {
        self.dictionary.declare(identifier, kind);
    }

    /// Borrow the callback table and a context over the remaining state at the same time.
    pub(crate) fn split(
        &mut self,
        step: usize,
        time: f64,
    ) -> (&mut CallbackRegistry, SessionContext<'_>) {
        let ctx = SessionContext {
            connection: &self.name,
            settings: &self.settings,
            dictionary: &self.dictionary,
            transport: self.transport.as_mut(),
            step,
            time,
        };
        (&mut self.callbacks, ctx)
    }

    pub fn context(&mut self) -> SessionContext<'_> {
        self.split(0, 0.0).1
    }

    /// Invoke the registered `AdvanceInTime` callback.
    pub fn advance_in_time(&mut self, current_time: f64) -> Result<f64> {
        if self.settings.steady_state {
            return Err(ProtocolError::NotImplementedForSteadyState {
                connection: self.name.clone(),
            }
            .into());
        }
        self.expect_state(ConnectionState::Connected, "advance in time")?;
        let (callbacks, mut ctx) = self.split(0, current_time);
        ctx.invoke_time(callbacks, current_time)?
            .ok_or_else(|| {
                ProtocolError::MissingCallback {
                    connection: ctx.connection.to_owned(),
                    phase: Phase::AdvanceInTime,
                }
                .into()
            })
    }

    /// Close the transport. The partner's next blocking receive ends with `SessionEnded`.
    pub(crate) fn close(&mut self) -> Result<()> {
        let result = self.transport.close();
        self.state = ConnectionState::Disconnected;
        if self.settings.echo_level > 0 {
            log::info!("Connection \"{}\" disconnected", self.name);
        }
        result.map_err(Error::from)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Disconnected {
            if let Err(err) = self.close() {
                log::warn!("Connection \"{}\": {err}", self.name);
            }
        }
    }
}

/// What a callback sees of its connection while it runs.
pub struct SessionContext<'a> {
    connection: &'a str,
    settings: &'a Settings,
    dictionary: &'a DataDictionary,
    transport: &'a mut dyn Transport,
    step: usize,
    time: f64,
}

impl<'a> SessionContext<'a> {
    pub fn connection(&self) -> &str {
        self.connection
    }

    pub fn settings(&self) -> &Settings {
        self.settings
    }

    /// Zero-based index of the current coupling step.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Simulation time at the start of the current phase.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn solver_name(&self) -> &str {
        self.settings.solver_name.as_deref().unwrap_or(self.connection)
    }

    pub fn export_data(&mut self, identifier: &str, data: &FieldData) -> Result<()> {
        self.dictionary.check(self.connection, identifier, DataKind::Field)?;
        self.timed("export", identifier, |t| t.send(identifier, &Payload::Field(data.clone())))?;
        if self.settings.echo_level > 1 {
            log::debug!(
                "Connection \"{}\": exported {} values as \"{identifier}\"",
                self.connection,
                data.len()
            );
        }
        Ok(())
    }

    pub fn import_data(&mut self, identifier: &str) -> Result<FieldData> {
        self.dictionary.check(self.connection, identifier, DataKind::Field)?;
        match self.timed("import", identifier, |t| t.receive(identifier))? {
            Payload::Field(data) => {
                if self.settings.echo_level > 1 {
                    log::debug!(
                        "Connection \"{}\": imported {} values as \"{identifier}\"",
                        self.connection,
                        data.len()
                    );
                }
                Ok(data)
            }
            other => Err(self.kind_mismatch(identifier, DataKind::Field, other.kind())),
        }
    }

    /// Import `identifier` and move it into `to` through `operator`.
    ///
    /// The received values are attributed to the partner solver.
    pub fn import_data_with(
        &mut self,
        identifier: &str,
        to: &mut InterfaceData,
        operator: &dyn DataTransferOperator,
        options: &TransferOptions,
    ) -> Result<()> {
        let data = self.import_data(identifier)?;
        let from = InterfaceData::new(
            identifier,
            self.settings.partner_name.as_str(),
            to.dimension,
            data,
        );
        operator
            .transfer_data(&from, to, options)
            .map_err(|err| err.in_connection(self.connection))?;
        Ok(())
    }

    pub fn export_mesh(&mut self, identifier: &str, mesh: &MeshData) -> Result<()> {
        self.dictionary.check(self.connection, identifier, DataKind::Mesh)?;
        mesh.validate()
            .map_err(|defect| defect.into_data_error(self.connection, identifier))?;
        self.timed("export", identifier, |t| t.send(identifier, &Payload::Mesh(mesh.clone())))?;
        if self.settings.echo_level > 1 {
            log::debug!(
                "Connection \"{}\": exported mesh \"{identifier}\" ({} nodes, {} elements)",
                self.connection,
                mesh.num_nodes(),
                mesh.num_elements()
            );
        }
        Ok(())
    }

    pub fn import_mesh(&mut self, identifier: &str) -> Result<MeshData> {
        self.dictionary.check(self.connection, identifier, DataKind::Mesh)?;
        match self.timed("import", identifier, |t| t.receive(identifier))? {
            Payload::Mesh(mesh) => {
                mesh.validate()
                    .map_err(|defect| defect.into_data_error(self.connection, identifier))?;
                if self.settings.echo_level > 1 {
                    log::debug!(
                        "Connection \"{}\": imported mesh \"{identifier}\" ({} nodes, {} elements)",
                        self.connection,
                        mesh.num_nodes(),
                        mesh.num_elements()
                    );
                }
                Ok(mesh)
            }
            other => Err(self.kind_mismatch(identifier, DataKind::Mesh, other.kind())),
        }
    }

    fn kind_mismatch(&self, identifier: &str, expected: DataKind, found: DataKind) -> Error {
        DataError::PayloadKindMismatch {
            connection: self.connection.to_owned(),
            identifier: identifier.to_owned(),
            expected,
            found,
        }
        .into()
    }

    fn timed<T, E>(
        &mut self,
        what: &str,
        identifier: &str,
        f: impl FnOnce(&mut dyn Transport) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let start = Instant::now();
        let result = f(&mut *self.transport);
        if self.settings.print_timing {
            log::info!(
                "Connection \"{}\": {what} of \"{identifier}\" took {:?}",
                self.connection,
                start.elapsed()
            );
        }
        result
    }

    /// Run the time callback; `None` if none is registered.
    pub(crate) fn invoke_time(
        &mut self,
        callbacks: &mut CallbackRegistry,
        current_time: f64,
    ) -> Result<Option<f64>> {
        let Some(Callback::Time(f)) = callbacks.get_mut(Phase::AdvanceInTime) else {
            return Ok(None);
        };
        let start = Instant::now();
        let result = f(self, current_time);
        self.report(Phase::AdvanceInTime, None, start);
        result
            .map(Some)
            .map_err(|err| CallbackError::wrap(self.connection, Phase::AdvanceInTime, None, err))
    }

    /// Run a step or data callback; `false` if none is registered for `phase`.
    pub(crate) fn invoke(
        &mut self,
        callbacks: &mut CallbackRegistry,
        phase: Phase,
        identifier: Option<&str>,
    ) -> Result<bool> {
        let start = Instant::now();
        let result = match (callbacks.get_mut(phase), identifier) {
            (None, _) => return Ok(false),
            (Some(Callback::Step(f)), _) => f(self),
            (Some(Callback::Data(f)), Some(identifier)) => f(self, identifier),
            // the registry only holds callbacks whose kind matches their phase
            (Some(other), _) => {
                return Err(ProtocolError::CallbackKindMismatch {
                    connection: self.connection.to_owned(),
                    phase,
                    expected: phase.callback_kind(),
                    found: other.kind(),
                }
                .into())
            }
        };
        self.report(phase, identifier, start);
        result
            .map(|()| true)
            .map_err(|err| CallbackError::wrap(self.connection, phase, identifier, err))
    }

    fn report(&self, phase: Phase, identifier: Option<&str>, start: Instant) {
        let label = match identifier {
            Some(identifier) => format!("{phase} \"{identifier}\""),
            None => phase.to_string(),
        };
        if self.settings.echo_level > 0 {
            log::info!("Connection \"{}\" step {}: {label}", self.connection, self.step);
        }
        if self.settings.print_timing {
            log::info!("Connection \"{}\": {label} took {:?}", self.connection, start.elapsed());
        }
    }
}
