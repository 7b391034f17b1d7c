use crate::{data::InterfaceData, error::DataError};

use super::{size_mismatch, DataTransferOperator, TransferOption, TransferOptions};

/// Sums all source values into a destination of size one.
#[derive(Debug, Clone, Default)]
pub struct SumDistributedToSingleOperator {
    echo_level: u32,
}

impl SumDistributedToSingleOperator {
    pub const NAME: &'static str = "sum_distributed_to_single";

    pub fn new(echo_level: u32) -> Self {
        Self { echo_level }
    }
}

impl DataTransferOperator for SumDistributedToSingleOperator {
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

        let &[current] = to.data().values() else {
            return Err(size_mismatch(from, to, 1, to.size()));
        };

        let mut sum: f64 = from.data().values().iter().sum();
        if options.contains(TransferOption::SwapSign) {
            sum = -sum;
        }
        if options.contains(TransferOption::AddValues) {
            sum += current;
        }

        if self.echo_level > 1 {
            log::debug!(
                "Summed {} values of \"{}\" ({}) into \"{}\" ({})",
                from.size(),
                from.name,
                from.solver_name,
                to.name,
                to.solver_name
            );
        }
        to.set_data(vec![sum]);
        Ok(())
    }
}
