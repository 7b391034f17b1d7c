use crate::{data::InterfaceData, error::DataError};

use super::{size_mismatch, DataTransferOperator, TransferOption, TransferOptions};

/// Copies values between interfaces of equal size.
#[derive(Debug, Clone, Default)]
pub struct CopyOperator {
    echo_level: u32,
}

impl CopyOperator {
    pub const NAME: &'static str = "copy";

    pub fn new(echo_level: u32) -> Self {
        Self { echo_level }
    }
}

impl DataTransferOperator for CopyOperator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn available_options(&self) -> &'static [TransferOption] {
        &[TransferOption::SwapSign, TransferOption::AddValues]
    }

    fn echo_level(&self) -> u32 {
        self.echo_level
    }

    fn transfer_data(
        &self,
        from: &InterfaceData,
        to: &mut InterfaceData,
        options: &TransferOptions,
    ) -> Result<(), DataError> {
        self.check_transfer_options(options)?;

        if from.size() != to.size() {
            return Err(size_mismatch(from, to, from.size(), to.size()));
        }

        let mut values = from.data().values().to_vec();

        // swap before accumulating, otherwise the destination's values get negated too
        if options.contains(TransferOption::SwapSign) {
            values.iter_mut().for_each(|v| *v = -*v);
        }
        if options.contains(TransferOption::AddValues) {
            for (v, current) in values.iter_mut().zip(to.data().values()) {
                *v += current;
            }
        }

        if self.echo_level > 1 {
            log::debug!(
                "Copied {} values from \"{}\" ({}) to \"{}\" ({})",
                values.len(),
                from.name,
                from.solver_name,
                to.name,
                to.solver_name
            );
        }
        to.set_data(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn from() -> InterfaceData {
        InterfaceData::new("load", "structure", 1, vec![1.0, -2.0, 3.0])
    }

    fn to() -> InterfaceData {
        InterfaceData::new("force", "fluid", 1, vec![10.0, 20.0, 30.0])
    }

    #[rstest]
    #[case(&[], &[1.0, -2.0, 3.0])]
    #[case(&["swap_sign"], &[-1.0, 2.0, -3.0])]
    #[case(&["add_values"], &[11.0, 18.0, 33.0])]
    #[case(&["swap_sign", "add_values"], &[9.0, 22.0, 27.0])]
    #[case(&["add_values", "swap_sign"], &[9.0, 22.0, 27.0])]
    fn test_transfer(#[case] tokens: &[&str], #[case] expected: &[f64]) {
        let mut to = to();
        CopyOperator::default()
            .transfer_data(&from(), &mut to, &TransferOptions::from_tokens(tokens.iter().copied()))
            .unwrap();
        assert_eq!(to.data().values(), expected);
    }

    #[test]
    fn test_size_mismatch_leaves_destination() {
        let mut to = InterfaceData::new("force", "fluid", 1, vec![10.0, 20.0, 30.0, 40.0]);
        let err = CopyOperator::default()
            .transfer_data(&from(), &mut to, &TransferOptions::new())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The sizes of the data are not matching: 3 (data \"load\" of solver \"structure\") != \
             4 (data \"force\" of solver \"fluid\")"
        );
        assert_eq!(to.data().values(), &[10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn test_unsupported_option() {
        let mut dest = to();
        let err = CopyOperator::default()
            .transfer_data(
                &from(),
                &mut dest,
                &TransferOptions::from_tokens(["distribute_values"]),
            )
            .unwrap_err();
        match err {
            DataError::UnsupportedTransferOption {
                operator,
                option,
                available,
                ..
            } => {
                assert_eq!(operator, "copy");
                assert_eq!(option, "distribute_values");
                assert_eq!(available, "swap_sign, add_values");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dest, to());
    }
}
