//! The link to the target's debug port.
//!
//! Everything in this crate reaches the hardware through a [`RegisterTransport`]: an
//! implementation moves 32-bit values to and from addresses behind an access port and
//! nothing else. The scan protocol used to do so is the implementation's business.

#[cfg(any(test, feature = "test"))]
pub mod fake_probe;

/// Failure of the underlying link.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The access port signalled a fault for this transfer.
    #[error("Access to {address:#010x} through access port {ap} faulted")]
    Fault { ap: u8, address: u64 },
    /// The debug port did not answer in time.
    #[error("The debug port did not respond in time")]
    Timeout,
    /// The probe is gone.
    #[error("The probe is not connected")]
    NotConnected,
    /// The transport does not provide this functionality.
    #[error("{0} is not supported by this transport")]
    NotImplemented(&'static str),
    /// Any other transport specific failure.
    #[error("{0}")]
    Other(String),
}

/// Access to 32-bit memory mapped registers behind a debug port.
///
/// Implementations may queue operations internally, but every read must return the value
/// observed after all previously issued operations completed.
pub trait RegisterTransport {
    /// Read a single 32-bit value.
    fn read_word_32(&mut self, ap: u8, address: u64) -> Result<u32, TransportError>;

    /// Write a single 32-bit value.
    fn write_word_32(&mut self, ap: u8, address: u64, value: u32) -> Result<(), TransportError>;

    /// Read `data.len()` values from the same address, without incrementing it.
    fn read_repeated_32(
        &mut self,
        ap: u8,
        address: u64,
        data: &mut [u32],
    ) -> Result<(), TransportError> {
        for value in data.iter_mut() {
            *value = self.read_word_32(ap, address)?;
        }

        Ok(())
    }

    /// Write all of `data` to the same address, without incrementing it.
    fn write_repeated_32(
        &mut self,
        ap: u8,
        address: u64,
        data: &[u32],
    ) -> Result<(), TransportError> {
        for value in data {
            self.write_word_32(ap, address, *value)?;
        }

        Ok(())
    }

    /// Complete all queued operations.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Assert the system reset line.
    fn target_reset_assert(&mut self) -> Result<(), TransportError> {
        Err(TransportError::NotImplemented("Asserting the system reset line"))
    }

    /// Release the system reset line.
    fn target_reset_deassert(&mut self) -> Result<(), TransportError> {
        Err(TransportError::NotImplemented("Releasing the system reset line"))
    }
}
