use std::{path::PathBuf, time::Duration};

use crate::{
    callback::{CallbackKind, Phase},
    connection::ConnectionState,
    data::{DataKind, ElementType},
};

/// Boxed error type returned by solver callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse error category, for callers deciding whether a failure is worth a re-`connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Transport,
    Data,
    Protocol,
    Callback,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Callback(#[from] CallbackError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Data(_) => ErrorKind::Data,
            Error::Protocol(_) => ErrorKind::Protocol,
            // a crate error raised inside a callback keeps its category
            Error::Callback(err) => err.inner().map_or(ErrorKind::Callback, Error::kind),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection \"{connection}\" is already connected")]
    DuplicateConnection { connection: String },

    #[error("Connection \"{connection}\" is not connected")]
    UnknownConnection { connection: String },

    #[error("Invalid setting \"{key}\" for connection \"{connection}\": {reason}")]
    InvalidSettings {
        connection: String,
        key: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection \"{connection}\": timed out after {waited:?} waiting for \"{identifier}\"")]
    Timeout {
        connection: String,
        identifier: String,
        waited: Duration,
    },

    #[error("Connection \"{connection}\": corrupt payload for \"{identifier}\": {detail}")]
    CorruptPayload {
        connection: String,
        identifier: String,
        detail: String,
    },

    #[error("Connection \"{connection}\": unconsumed payload for \"{identifier}\" already at {path:?}")]
    PathCollision {
        connection: String,
        identifier: String,
        path: PathBuf,
    },

    #[error("Connection \"{connection}\": partner ended the session while waiting for \"{identifier}\"")]
    SessionEnded {
        connection: String,
        identifier: String,
    },

    #[error("Connection \"{connection}\": \"{component}\" cannot be used as a file name")]
    InvalidPathComponent {
        connection: String,
        component: String,
    },

    #[error("Connection \"{connection}\": I/O error on {path:?}")]
    Io {
        connection: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error(
        "{}The sizes of the data are not matching: {from_size} (data \"{from_name}\" of solver \
         \"{from_solver}\") != {to_size} (data \"{to_name}\" of solver \"{to_solver}\")",
        in_connection(.connection)
    )]
    SizeMismatch {
        /// Set once the transfer is attributed to a connection.
        connection: Option<String>,
        from_name: String,
        from_solver: String,
        from_size: usize,
        to_name: String,
        to_solver: String,
        to_size: usize,
    },

    #[error("Connection \"{connection}\": identifier \"{identifier}\" is not known (known: [{known}])")]
    UnknownIdentifier {
        connection: String,
        identifier: String,
        known: String,
    },

    #[error(
        "{}Transfer option \"{option}\" is not supported by operator \"{operator}\" \
         (available: [{available}])",
        in_connection(.connection)
    )]
    UnsupportedTransferOption {
        connection: Option<String>,
        operator: String,
        option: String,
        available: String,
    },

    #[error("Connection \"{connection}\": \"{identifier}\" is declared as {expected} but {found} was exchanged")]
    PayloadKindMismatch {
        connection: String,
        identifier: String,
        expected: DataKind,
        found: DataKind,
    },

    #[error(
        "Connection \"{connection}\": element {element} of mesh \"{identifier}\" references node \
         {node_index}, but the mesh has {num_nodes} nodes"
    )]
    InvalidConnectivity {
        connection: String,
        identifier: String,
        element: usize,
        node_index: usize,
        num_nodes: usize,
    },

    #[error(
        "Connection \"{connection}\": element {element} of mesh \"{identifier}\" is a {element_type:?} \
         with {found} nodes, expected {expected}"
    )]
    ElementNodeCountMismatch {
        connection: String,
        identifier: String,
        element: usize,
        element_type: ElementType,
        expected: usize,
        found: usize,
    },

    #[error("Connection \"{connection}\": mesh \"{identifier}\" has {connectivities} connectivities but {element_types} element types")]
    ElementTypeCountMismatch {
        connection: String,
        identifier: String,
        connectivities: usize,
        element_types: usize,
    },

    #[error("Unknown data transfer operator type \"{type_name}\"")]
    UnknownOperatorType { type_name: String },

    #[error("Invalid data transfer operator setting \"{key}\": {reason}")]
    InvalidOperatorSettings { key: String, reason: String },
}

impl DataError {
    /// Attribute an operator error to `name` unless it already names a connection.
    pub(crate) fn in_connection(mut self, name: &str) -> Self {
        if let DataError::SizeMismatch { connection, .. }
        | DataError::UnsupportedTransferOption { connection, .. } = &mut self
        {
            connection.get_or_insert_with(|| name.to_owned());
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{}\"{name}\" is not a recognized phase", in_connection(.connection))]
    InvalidPhase {
        connection: Option<String>,
        name: String,
    },

    #[error("Connection \"{connection}\": a callback for {phase} is already registered")]
    DuplicatePhaseRegistration { connection: String, phase: Phase },

    #[error("Connection \"{connection}\": {phase} expects a {expected:?} callback, got {found:?}")]
    CallbackKindMismatch {
        connection: String,
        phase: Phase,
        expected: CallbackKind,
        found: CallbackKind,
    },

    #[error("Connection \"{connection}\": no callback registered for {phase}")]
    MissingCallback { connection: String, phase: Phase },

    #[error("Connection \"{connection}\": AdvanceInTime is not implemented for a steady-state solver")]
    NotImplementedForSteadyState { connection: String },

    #[error("Connection \"{connection}\": cannot {operation} while {state:?}")]
    InvalidState {
        connection: String,
        state: ConnectionState,
        operation: &'static str,
    },
}

impl ProtocolError {
    /// Attribute a phase parse error to `name` unless it already names a connection.
    pub(crate) fn in_connection(mut self, name: &str) -> Self {
        if let ProtocolError::InvalidPhase { connection, .. } = &mut self {
            connection.get_or_insert_with(|| name.to_owned());
        }
        self
    }
}

fn in_connection(connection: &Option<String>) -> String {
    connection
        .as_ref()
        .map(|c| format!("Connection \"{c}\": "))
        .unwrap_or_default()
}

/// A failure raised inside a registered solver callback.
#[derive(Debug, thiserror::Error)]
#[error("Connection \"{connection}\": {phase} callback failed{}", for_identifier(.identifier))]
pub struct CallbackError {
    pub connection: String,
    pub phase: Phase,
    pub identifier: Option<String>,
    #[source]
    pub source: BoxError,
}

fn for_identifier(identifier: &Option<String>) -> String {
    identifier
        .as_ref()
        .map(|id| format!(" for \"{id}\""))
        .unwrap_or_default()
}

impl CallbackError {
    /// Wrap an error returned from a callback.
    pub(crate) fn wrap(
        connection: &str,
        phase: Phase,
        identifier: Option<&str>,
        err: BoxError,
    ) -> Error {
        CallbackError {
            connection: connection.to_owned(),
            phase,
            identifier: identifier.map(str::to_owned),
            source: err,
        }
        .into()
    }

    /// The error of this crate the callback failed with (e.g. a transport timeout hit by an
    /// `ImportData` callback), if any.
    pub fn inner(&self) -> Option<&Error> {
        self.source.downcast_ref::<Error>()
    }
}
