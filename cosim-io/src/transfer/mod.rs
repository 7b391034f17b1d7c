//! Data-transfer operators.
//!
//! An operator moves the values of one [`InterfaceData`] into another, applying the requested
//! [`TransferOption`]s. The options always run in the operator's fixed order, whatever order the
//! caller listed them in: for [`CopyOperator`] a sign swap happens before accumulation, so values
//! already held by the destination are never negated.

use std::{fmt, str::FromStr};

use itertools::Itertools;

use crate::{data::InterfaceData, error::DataError, settings::SettingsMap};

mod copy;
mod single_to_distributed;
mod sum_distributed_to_single;

pub use copy::CopyOperator;
pub use single_to_distributed::CopySingleToDistributedOperator;
pub use sum_distributed_to_single::SumDistributedToSingleOperator;

/// A named transform flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOption {
    /// Negate the transferred values.
    SwapSign,
    /// Spread a single value evenly over the destination entries.
    DistributeValues,
    /// Accumulate into the destination instead of overwriting it.
    AddValues,
}

impl TransferOption {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferOption::SwapSign => "swap_sign",
            TransferOption::DistributeValues => "distribute_values",
            TransferOption::AddValues => "add_values",
        }
    }
}

impl fmt::Display for TransferOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swap_sign" => Ok(Self::SwapSign),
            "distribute_values" => Ok(Self::DistributeValues),
            "add_values" => Ok(Self::AddValues),
            _ => Err(s.to_owned()),
        }
    }
}

/// The option tokens attached to one transfer call.
///
/// Tokens are kept verbatim so that an operator can report the exact token it does not support.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    tokens: Vec<String>,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, option: TransferOption) -> Self {
        self.tokens.push(option.as_str().to_owned());
        self
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, option: TransferOption) -> bool {
        self.tokens.iter().any(|t| t == option.as_str())
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> + '_ {
        self.tokens.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl FromIterator<TransferOption> for TransferOptions {
    fn from_iter<T: IntoIterator<Item = TransferOption>>(iter: T) -> Self {
        Self::from_tokens(iter.into_iter().map(TransferOption::as_str))
    }
}

pub trait DataTransferOperator: Send {
    /// Registered type name of the operator.
    fn name(&self) -> &'static str;

    /// Options this operator understands, in the order it applies them.
    fn available_options(&self) -> &'static [TransferOption];

    fn echo_level(&self) -> u32;

    /// Move the values of `from` into `to`.
    ///
    /// On error `to` is left untouched.
    fn transfer_data(
        &self,
        from: &InterfaceData,
        to: &mut InterfaceData,
        options: &TransferOptions,
    ) -> Result<(), DataError>;

    /// Validate the operator before first use.
    fn check(&self) -> Result<(), DataError> {
        Ok(())
    }

    /// Fail with [`DataError::UnsupportedTransferOption`] on the first token this operator
    /// does not know.
    fn check_transfer_options(&self, options: &TransferOptions) -> Result<(), DataError> {
        let available = self.available_options();
        for token in options.tokens() {
            let known = token
                .parse::<TransferOption>()
                .is_ok_and(|option| available.contains(&option));
            if !known {
                return Err(DataError::UnsupportedTransferOption {
                    connection: None,
                    operator: self.name().to_owned(),
                    option: token.to_owned(),
                    available: available.iter().join(", "),
                });
            }
        }
        Ok(())
    }
}

/// Settings an operator is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSettings {
    pub type_name: String,
    pub echo_level: u32,
}

impl OperatorSettings {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            echo_level: 0,
        }
    }

    /// Build from the keys `type` (required) and `echo_level`.
    pub fn from_map(map: &SettingsMap) -> Result<Self, DataError> {
        let invalid = |key: &str, reason: String| DataError::InvalidOperatorSettings {
            key: key.to_owned(),
            reason,
        };

        if let Some(key) = map.keys().find(|k| !matches!(k.as_str(), "type" | "echo_level")) {
            return Err(invalid(key, "unrecognized key".to_owned()));
        }
        let type_name = map
            .get("type")
            .ok_or_else(|| invalid("type", "must be given".to_owned()))?;
        let echo_level = match map.get("echo_level") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| {
                    invalid(
                        "echo_level",
                        format!("expected a non-negative integer, got \"{value}\""),
                    )
                })?,
            None => 0,
        };

        Ok(Self {
            type_name: type_name.clone(),
            echo_level,
        })
    }
}

/// Type names accepted by [`create_operator`].
pub const OPERATOR_TYPES: &[&str] = &[
    CopyOperator::NAME,
    CopySingleToDistributedOperator::NAME,
    SumDistributedToSingleOperator::NAME,
];

/// Build the operator named by `settings.type_name`.
pub fn create_operator(
    settings: &OperatorSettings,
) -> Result<Box<dyn DataTransferOperator>, DataError> {
    let operator: Box<dyn DataTransferOperator> = match settings.type_name.as_str() {
        CopyOperator::NAME => Box::new(CopyOperator::new(settings.echo_level)),
        CopySingleToDistributedOperator::NAME => {
            Box::new(CopySingleToDistributedOperator::new(settings.echo_level))
        }
        SumDistributedToSingleOperator::NAME => {
            Box::new(SumDistributedToSingleOperator::new(settings.echo_level))
        }
        other => {
            return Err(DataError::UnknownOperatorType {
                type_name: other.to_owned(),
            })
        }
    };
    operator.check()?;
    log::debug!("Created data transfer operator \"{}\"", operator.name());
    Ok(operator)
}

pub(crate) fn size_mismatch(
    from: &InterfaceData,
    to: &InterfaceData,
    from_size: usize,
    to_size: usize,
) -> DataError {
    DataError::SizeMismatch {
        connection: None,
        from_name: from.name.clone(),
        from_solver: from.solver_name.clone(),
        from_size,
        to_name: to.name.clone(),
        to_solver: to.solver_name.clone(),
        to_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory() {
        for name in OPERATOR_TYPES {
            let op = create_operator(&OperatorSettings::new(*name)).unwrap();
            assert_eq!(op.name(), *name);
        }
        assert!(matches!(
            create_operator(&OperatorSettings::new("mapping")),
            Err(DataError::UnknownOperatorType { type_name }) if type_name == "mapping"
        ));
    }

    #[test]
    fn test_operator_settings_from_map() {
        let map: SettingsMap = [("type", "copy"), ("echo_level", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        let settings = OperatorSettings::from_map(&map).unwrap();
        assert_eq!(settings.type_name, "copy");
        assert_eq!(settings.echo_level, 2);

        assert!(matches!(
            OperatorSettings::from_map(&SettingsMap::new()),
            Err(DataError::InvalidOperatorSettings { key, .. }) if key == "type"
        ));
    }

    #[test]
    fn test_options_keep_tokens() {
        let options = TransferOptions::from_tokens(["add_values", "scale"]);
        assert!(options.contains(TransferOption::AddValues));
        assert!(!options.contains(TransferOption::SwapSign));
        assert_eq!(options.tokens().collect::<Vec<_>>(), ["add_values", "scale"]);

        let options: TransferOptions = [TransferOption::SwapSign].into_iter().collect();
        assert_eq!(options, TransferOptions::new().with(TransferOption::SwapSign));
    }
}
