//! Lifecycle phases and the per-connection callback table.

use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::{
    connection::SessionContext,
    error::{BoxError, ProtocolError},
};

pub type CallbackResult<T = ()> = Result<T, BoxError>;

type TimeFn = dyn FnMut(&mut SessionContext<'_>, f64) -> CallbackResult<f64> + Send;
type StepFn = dyn FnMut(&mut SessionContext<'_>) -> CallbackResult + Send;
type DataFn = dyn FnMut(&mut SessionContext<'_>, &str) -> CallbackResult + Send;

/// The recognized lifecycle phases of a coupling participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    AdvanceInTime,
    InitializeSolutionStep,
    SolveSolutionStep,
    FinalizeSolutionStep,
    ImportData,
    ExportData,
    ImportMesh,
    ExportMesh,
    /// Runs once after the last coupling step.
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::AdvanceInTime,
        Phase::InitializeSolutionStep,
        Phase::SolveSolutionStep,
        Phase::FinalizeSolutionStep,
        Phase::ImportData,
        Phase::ExportData,
        Phase::ImportMesh,
        Phase::ExportMesh,
        Phase::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::AdvanceInTime => "AdvanceInTime",
            Phase::InitializeSolutionStep => "InitializeSolutionStep",
            Phase::SolveSolutionStep => "SolveSolutionStep",
            Phase::FinalizeSolutionStep => "FinalizeSolutionStep",
            Phase::ImportData => "ImportData",
            Phase::ExportData => "ExportData",
            Phase::ImportMesh => "ImportMesh",
            Phase::ExportMesh => "ExportMesh",
            Phase::Finalize => "Finalize",
        }
    }

    /// The callback signature this phase is invoked with.
    pub fn callback_kind(self) -> CallbackKind {
        match self {
            Phase::AdvanceInTime => CallbackKind::Time,
            Phase::InitializeSolutionStep
            | Phase::SolveSolutionStep
            | Phase::FinalizeSolutionStep
            | Phase::Finalize => CallbackKind::Step,
            Phase::ImportData | Phase::ExportData | Phase::ImportMesh | Phase::ExportMesh => {
                CallbackKind::Data
            }
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| ProtocolError::InvalidPhase {
                connection: None,
                name: s.to_owned(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// `(current_time) -> next_time`
    Time,
    /// `()`
    Step,
    /// `(identifier)`
    Data,
}

/// A solver-side callable registered for one phase.
pub enum Callback {
    Time(Box<TimeFn>),
    Step(Box<StepFn>),
    Data(Box<DataFn>),
}

impl Callback {
    /// A callback for [`Phase::AdvanceInTime`].
    pub fn time<F>(f: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, f64) -> CallbackResult<f64> + Send + 'static,
    {
        Callback::Time(Box::new(f))
    }

    /// A callback for the solution-step phases and [`Phase::Finalize`].
    pub fn step<F>(f: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>) -> CallbackResult + Send + 'static,
    {
        Callback::Step(Box::new(f))
    }

    /// A callback for the data and mesh phases; receives the identifier.
    pub fn data<F>(f: F) -> Self
    where
        F: FnMut(&mut SessionContext<'_>, &str) -> CallbackResult + Send + 'static,
    {
        Callback::Data(Box::new(f))
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Callback::Time(_) => CallbackKind::Time,
            Callback::Step(_) => CallbackKind::Step,
            Callback::Data(_) => CallbackKind::Data,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.kind()).finish()
    }
}

/// At most one callback per phase. Registration order is irrelevant; invocation order is fixed
/// by the orchestrator.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    callbacks: BTreeMap<Phase, Callback>,
}

impl CallbackRegistry {
    pub fn register(
        &mut self,
        connection: &str,
        phase: Phase,
        callback: Callback,
    ) -> Result<(), ProtocolError> {
        if callback.kind() != phase.callback_kind() {
            return Err(ProtocolError::CallbackKindMismatch {
                connection: connection.to_owned(),
                phase,
                expected: phase.callback_kind(),
                found: callback.kind(),
            });
        }
        if self.callbacks.contains_key(&phase) {
            return Err(ProtocolError::DuplicatePhaseRegistration {
                connection: connection.to_owned(),
                phase,
            });
        }
        self.callbacks.insert(phase, callback);
        Ok(())
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.callbacks.contains_key(&phase)
    }

    pub fn get_mut(&mut self, phase: Phase) -> Option<&mut Callback> {
        self.callbacks.get_mut(&phase)
    }

    pub fn phases(&self) -> impl Iterator<Item = Phase> + '_ {
        self.callbacks.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
