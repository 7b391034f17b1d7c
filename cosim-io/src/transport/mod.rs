//! Exchange transports.
//!
//! A [`Transport`] moves a [`Payload`] across the process boundary for one connection. The
//! protocol layer only ever talks to this trait, so strategies can be swapped without touching
//! the orchestrator or the data-transfer operators.
//!
//! The only ordering guarantee is per identifier: a `receive` blocks until the matching `send`
//! from the partner has completed. Callers must not overlap `send`/`receive` on one identifier.

use crate::{data::Payload, error::TransportError};

pub mod codec;
#[cfg(feature = "file")]
pub mod file;
#[cfg(feature = "in-process")]
pub mod in_process;

#[cfg(feature = "file")]
pub use file::FileTransport;
#[cfg(feature = "in-process")]
pub use in_process::{InProcessExchange, InProcessTransport};

pub trait Transport: Send {
    /// Publish `payload` under `identifier`. Returns once the payload is visible to the partner.
    fn send(&mut self, identifier: &str, payload: &Payload) -> Result<(), TransportError>;

    /// Block until the partner's next payload for `identifier` is available, then take it.
    fn receive(&mut self, identifier: &str) -> Result<Payload, TransportError>;

    /// Release transport resources and signal the partner that this side ended the session.
    ///
    /// Must be callable more than once.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Reject names that cannot be embedded in a file name.
#[cfg_attr(not(feature = "file"), allow(dead_code))]
pub(crate) fn check_path_component(
    connection: &str,
    component: &str,
) -> Result<(), TransportError> {
    let bad = component.is_empty()
        || component == "."
        || component == ".."
        || component
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
    if bad {
        Err(TransportError::InvalidPathComponent {
            connection: connection.to_owned(),
            component: component.to_owned(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_components() {
        assert!(check_path_component("c", "Fluid.Interface").is_ok());
        assert!(check_path_component("c", "Interface_disp").is_ok());
        assert!(check_path_component("c", "").is_err());
        assert!(check_path_component("c", "..").is_err());
        assert!(check_path_component("c", "a/b").is_err());
    }
}
