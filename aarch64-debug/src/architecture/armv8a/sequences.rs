//! Debug sequences for ARMv8-A cores.
//!
//! Targets with special requirements provide their own [`Armv8aDebugSequence`] and
//! override the steps that differ.

use std::{
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use super::{
    cti::Cti,
    dap::Dap,
    debug_regs::{Edecr, Edesr, Edlar, Edprcr, Edprsr, Edscr, Oslar},
    Armv8aError,
};
use crate::{config::CoreDefinition, error::Error, probe::RegisterTransport};

/// The default sequences, used for every target unless one is configured.
#[derive(Debug)]
pub struct DefaultArmv8aSequence(pub(crate) ());

impl DefaultArmv8aSequence {
    /// Creates a new default ARMv8-A debug sequence.
    pub fn create() -> Arc<dyn Armv8aDebugSequence> {
        Arc::new(Self(()))
    }
}

impl Armv8aDebugSequence for DefaultArmv8aSequence {}

fn debug_registers<'probe>(
    transport: &'probe mut dyn RegisterTransport,
    core: &CoreDefinition,
) -> Dap<'probe> {
    Dap::new(transport, core.ap, core.debug_base)
}

/// Target specific steps of bringing up and resetting an ARMv8-A core.
pub trait Armv8aDebugSequence: Send + Sync + Debug {
    /// Initialize the core debug logic and its CTI.
    ///
    /// Fails with [`Armv8aError::PoweredDown`] if the core power domain is off.
    fn debug_core_start(
        &self,
        transport: &mut dyn RegisterTransport,
        core: &CoreDefinition,
    ) -> Result<(), Error> {
        tracing::debug!(
            "Starting debug for core {} with registers at {:#X}",
            core.name,
            core.debug_base
        );

        let mut debug = debug_registers(transport, core);

        // Reading EDPRSR also clears the sticky powerdown flag.
        let edprsr: Edprsr = debug.read_register()?;
        if !edprsr.pu() {
            return Err(Armv8aError::PoweredDown.into());
        }

        let mut edlar = Edlar::from(0);
        edlar.set_key(Edlar::UNLOCK_KEY);
        debug.write_register(edlar)?;

        // Unlock the OS Lock to enable access to debug registers
        debug.write_register(Oslar::from(0))?;

        let mut cti = Cti::new(Dap::new(&mut *transport, core.cti_ap, core.cti_base));
        cti.enable(true)?;
        cti.configure_outputs()?;

        let mut debug = debug_registers(transport, core);
        let mut edscr: Edscr = debug.read_register()?;
        if edscr.hde() {
            tracing::debug!("Halting debug is already enabled on core {}", core.name);
            return Ok(());
        }

        edscr.set_hde(true);
        debug.write_register(edscr)?;

        Ok(())
    }

    /// Make the core halt on its first instruction after reset.
    fn reset_catch_set(
        &self,
        transport: &mut dyn RegisterTransport,
        core: &CoreDefinition,
    ) -> Result<(), Error> {
        let mut debug = debug_registers(transport, core);

        let mut edecr: Edecr = debug.read_register()?;
        edecr.set_rce(true);
        debug.write_register(edecr)?;

        Ok(())
    }

    /// Drop a pending reset catch event and disable reset catch.
    fn reset_catch_clear(
        &self,
        transport: &mut dyn RegisterTransport,
        core: &CoreDefinition,
    ) -> Result<(), Error> {
        let mut debug = debug_registers(transport, core);

        let mut edesr = Edesr::from(0);
        edesr.set_rc(true);
        debug.write_register(edesr)?;

        let mut edecr: Edecr = debug.read_register()?;
        edecr.set_rce(false);
        debug.write_register(edecr)?;

        Ok(())
    }

    /// Warm reset of a single core through EDPRCR.CWRR.
    ///
    /// Waits for the sticky reset flag, so the reset has happened when this returns.
    fn reset_system(
        &self,
        transport: &mut dyn RegisterTransport,
        core: &CoreDefinition,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut debug = debug_registers(transport, core);

        // Clear any stale sticky reset indication first.
        let _: Edprsr = debug.read_register()?;

        let mut edprcr = Edprcr::from(0);
        edprcr.set_cwrr(true);
        debug.write_register(edprcr)?;

        let start = Instant::now();
        loop {
            let edprsr: Edprsr = debug.read_register()?;
            if edprsr.sr() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout {
                    core: core.id,
                    operation: "warm reset",
                });
            }
        }
    }
}
