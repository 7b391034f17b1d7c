use crate::{data::InterfaceData, error::DataError};

use super::{size_mismatch, DataTransferOperator, TransferOption, TransferOptions};

/// Broadcasts the single value of the source to every entry of the destination.
#[derive(Debug, Clone, Default)]
pub struct CopySingleToDistributedOperator {
    echo_level: u32,
}

impl CopySingleToDistributedOperator {
    pub const NAME: &'static str = "copy_single_to_distributed";

    pub fn new(echo_level: u32) -> Self {
        Self { echo_level }
    }
}

impl DataTransferOperator for CopySingleToDistributedOperator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn available_options(&self) -> &'static [TransferOption] {
        &[
            TransferOption::SwapSign,
            TransferOption::DistributeValues,
            TransferOption::AddValues,
        ]
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

        let [value] = from.data().values() else {
            return Err(size_mismatch(from, to, from.size(), 1));
        };
        let mut value = *value;
        let to_size = to.size();

        if options.contains(TransferOption::SwapSign) {
            value = -value;
        }
        if options.contains(TransferOption::DistributeValues) && to_size > 0 {
            value /= to_size as f64;
        }
        let mut values = vec![value; to_size];
        if options.contains(TransferOption::AddValues) {
            for (v, current) in values.iter_mut().zip(to.data().values()) {
                *v += current;
            }
        }

        if self.echo_level > 1 {
            log::debug!(
                "Distributed \"{}\" ({}) over {to_size} entries of \"{}\" ({})",
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
