//! ARM semihosting support for AArch64.
//!
//! Specification: <https://github.com/ARM-software/abi-aa/blob/2024Q3/semihosting/semihosting.rst>
//!
//! Only the exit requests are decoded. Any other operation is reported as
//! [`SemihostingCommand::Unknown`] and can be answered through [`UnknownCommandDetails`].

use crate::{
    core::{AccessSize, CoreInterface, RegisterId},
    error::Error,
};

/// `HLT #0xF000`, the A64 semihosting trap.
pub const SEMIHOSTING_TRAP: u32 = 0xD45E_0000;

const SYS_EXIT: u32 = 0x18;
const SYS_EXIT_EXTENDED: u32 = 0x20;
const SYS_EXIT_ADP_STOPPED_APPLICATIONEXIT: u64 = 0x20026;

/// Indicates the operation the target would like the debugger to perform.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SemihostingCommand {
    /// The target indicates that it completed successfully and no-longer wishes
    /// to run.
    ExitSuccess,

    /// The target indicates that it completed unsuccessfully, with an error
    /// code, and no-longer wishes to run.
    ExitError(ExitErrorDetails),

    /// The target indicated that it would like to run a semihosting operation which we don't support yet.
    Unknown(UnknownCommandDetails),
}

/// Details of a semihosting exit with error
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct ExitErrorDetails {
    /// Some application specific exit reason.
    pub reason: u64,

    /// The exit status of the application, present if reason is `ADP_Stopped_ApplicationExit` (`0x20026`).
    pub exit_status: Option<u64>,

    /// The subcode of the exit, present for any other reason.
    pub subcode: Option<u64>,
}

impl std::fmt::Display for ExitErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reason: {:#x}", self.reason)?;
        if let Some(exit_status) = self.exit_status {
            write!(f, ", exit_status: {exit_status}")?;
        }
        if let Some(subcode) = self.subcode {
            write!(f, ", subcode: {subcode:#x}")?;
        }
        Ok(())
    }
}

/// Details of a semihosting operation that we don't support yet
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct UnknownCommandDetails {
    /// The semihosting operation requested
    pub operation: u32,

    /// The parameter to the semihosting operation
    pub parameter: u64,
}

impl UnknownCommandDetails {
    /// Writes the status of the semihosting operation to the return register of the target
    pub fn write_status(&self, core: &mut dyn CoreInterface, status: i64) -> Result<(), Error> {
        core.write_core_reg(RegisterId::x(0), status as u64)
    }
}

/// Is `instruction` the A64 semihosting trap?
pub fn is_semihosting_trap(instruction: u32) -> bool {
    instruction == SEMIHOSTING_TRAP
}

fn read_u64(core: &mut dyn CoreInterface, address: u64) -> Result<u64, Error> {
    let mut bytes = [0u8; 8];
    core.read_memory(address, AccessSize::U64, 1, &mut bytes)?;

    Ok(u64::from_le_bytes(bytes))
}

/// Decodes a semihosting syscall.
///
/// The core must be halted on the semihosting trap, with the operation in `w0` and the
/// parameter in `x1`.
pub fn decode_semihosting_syscall(
    core: &mut dyn CoreInterface,
) -> Result<SemihostingCommand, Error> {
    let operation = core.read_core_reg(RegisterId::x(0))? as u32;
    let parameter = core.read_core_reg(RegisterId::x(1))?;

    tracing::debug!("Semihosting found x0={operation:#x} x1={parameter:#x}");

    Ok(match operation {
        // On AArch64 both exit calls pass a block of two doublewords.
        SYS_EXIT | SYS_EXIT_EXTENDED => {
            let reason = read_u64(core, parameter)?;
            let subcode = read_u64(core, parameter.wrapping_add(8))?;
            match (reason, subcode) {
                (SYS_EXIT_ADP_STOPPED_APPLICATIONEXIT, 0) => SemihostingCommand::ExitSuccess,
                (SYS_EXIT_ADP_STOPPED_APPLICATIONEXIT, exit_status) => {
                    SemihostingCommand::ExitError(ExitErrorDetails {
                        reason,
                        exit_status: Some(exit_status),
                        subcode: None,
                    })
                }
                (reason, subcode) => SemihostingCommand::ExitError(ExitErrorDetails {
                    reason,
                    exit_status: None,
                    subcode: Some(subcode),
                }),
            }
        }
        _ => SemihostingCommand::Unknown(UnknownCommandDetails {
            operation,
            parameter,
        }),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::armv8a::instructions::build_hlt;

    #[test]
    fn trap_encoding() {
        assert!(is_semihosting_trap(build_hlt(0xF000)));
        assert!(!is_semihosting_trap(build_hlt(0xB)));
    }

    #[test]
    fn exit_details_display() {
        let details = ExitErrorDetails {
            reason: 0x20026,
            exit_status: Some(3),
            subcode: None,
        };

        assert_eq!(details.to_string(), "reason: 0x20026, exit_status: 3");
    }
}
