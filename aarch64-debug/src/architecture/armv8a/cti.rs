//! Cross trigger interface handling.
//!
//! Each core has a CTI. Channel [`CTI_CHANNEL_HALT`] drives the core's debug request
//! trigger and channel [`CTI_CHANNEL_RESTART`] its restart trigger. A channel bit set in
//! CTIGATE lets events on that channel travel to and from the cross trigger matrix; with
//! the bit clear, pulses stay local to this CTI and group wide events do not reach the core.

use std::time::{Duration, Instant};

use super::{
    dap::Dap,
    debug_regs::{
        CtiApppulse, CtiControl, CtiGate, CtiIntack, CtiOuten, CtiTrigoutstatus, CTI_OUTEN_STRIDE,
    },
};
use crate::probe::TransportError;

/// Channel carrying halt requests.
pub const CTI_CHANNEL_HALT: usize = 0;
/// Channel carrying restart requests.
pub const CTI_CHANNEL_RESTART: usize = 1;

/// Trigger output wired to the core's debug request input.
pub const CTI_TRIGGER_HALT: usize = 0;
/// Trigger output wired to the core's restart input.
pub const CTI_TRIGGER_RESTART: usize = 1;

/// Cross trigger interface of one core.
pub struct Cti<'probe> {
    dap: Dap<'probe>,
}

impl<'probe> Cti<'probe> {
    pub fn new(dap: Dap<'probe>) -> Self {
        Self { dap }
    }

    /// Enable or disable all mapping functions of this CTI.
    pub fn enable(&mut self, enable: bool) -> Result<(), TransportError> {
        let mut control = CtiControl::from(0);
        control.set_glben(enable);

        self.dap.write_register(control)
    }

    /// Route channel 0 to the halt trigger and channel 1 to the restart trigger, and close all gates.
    pub fn configure_outputs(&mut self) -> Result<(), TransportError> {
        self.write_gate(0)?;

        let mut halt = CtiOuten::from(0);
        halt.set_outen(CTI_CHANNEL_HALT, 1);
        self.dap
            .write_indexed(CTI_TRIGGER_HALT, CTI_OUTEN_STRIDE, halt)?;

        let mut restart = CtiOuten::from(0);
        restart.set_outen(CTI_CHANNEL_RESTART, 1);
        self.dap
            .write_indexed(CTI_TRIGGER_RESTART, CTI_OUTEN_STRIDE, restart)
    }

    pub fn read_gate(&mut self) -> Result<u32, TransportError> {
        let gate: CtiGate = self.dap.read_register()?;

        Ok(gate.into())
    }

    pub fn write_gate(&mut self, mask: u32) -> Result<(), TransportError> {
        self.dap.write_register(CtiGate::from(mask))
    }

    /// Keep events on `channel` local to this CTI.
    pub fn gate_channel(&mut self, channel: usize) -> Result<(), TransportError> {
        let mut gate = CtiGate::from(self.read_gate()?);
        gate.set_en(channel, 0);

        self.dap.write_register(gate)
    }

    /// Let events on `channel` pass to and from the cross trigger matrix.
    pub fn ungate_channel(&mut self, channel: usize) -> Result<(), TransportError> {
        let mut gate = CtiGate::from(self.read_gate()?);
        gate.set_en(channel, 1);

        self.dap.write_register(gate)
    }

    /// Generate a single event on `channel`.
    pub fn pulse_channel(&mut self, channel: usize) -> Result<(), TransportError> {
        let mut pulse = CtiApppulse::from(0);
        pulse.set_apppulse(channel, 1);

        self.dap.write_register(pulse)
    }

    /// Acknowledge the trigger outputs set in `trigger_mask`.
    pub fn ack_events(&mut self, trigger_mask: u32) -> Result<(), TransportError> {
        self.dap.write_register(CtiIntack::from(trigger_mask))
    }

    /// Currently asserted trigger outputs.
    pub fn trigger_out_status(&mut self) -> Result<u32, TransportError> {
        let status: CtiTrigoutstatus = self.dap.read_register()?;

        Ok(status.into())
    }

    /// Acknowledge the halt trigger and wait until the output drops.
    ///
    /// Returns `false` if it is still asserted after `timeout`.
    pub fn ack_halt(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        self.ack_events(1 << CTI_TRIGGER_HALT)?;

        let start = Instant::now();
        loop {
            let status = CtiTrigoutstatus::from(self.trigger_out_status()?);
            if status.status(CTI_TRIGGER_HALT) == 0 {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::armv8a::test::MockProbe;

    const CTI_BASE: u64 = 0x8000_2000;

    #[test]
    fn configure_outputs_maps_halt_and_restart() {
        let mut probe = MockProbe::new();
        probe.expected_write(CTI_BASE + 0x140, 0);
        probe.expected_write(CTI_BASE + 0x0A0, 0b01);
        probe.expected_write(CTI_BASE + 0x0A4, 0b10);

        let mut cti = Cti::new(Dap::new(&mut probe, 0, CTI_BASE));
        cti.configure_outputs().unwrap();

        assert!(probe.is_done());
    }

    #[test]
    fn gate_changes_only_one_channel() {
        let mut probe = MockProbe::new();
        probe.expected_read(CTI_BASE + 0x140, 0b11);
        probe.expected_write(CTI_BASE + 0x140, 0b10);
        probe.expected_read(CTI_BASE + 0x140, 0b10);
        probe.expected_write(CTI_BASE + 0x140, 0b11);

        let mut cti = Cti::new(Dap::new(&mut probe, 0, CTI_BASE));
        cti.gate_channel(CTI_CHANNEL_HALT).unwrap();
        cti.ungate_channel(CTI_CHANNEL_HALT).unwrap();

        assert!(probe.is_done());
    }

    #[test]
    fn pulse_and_ack() {
        let mut probe = MockProbe::new();
        probe.expected_write(CTI_BASE + 0x01C, 0b10);
        probe.expected_write(CTI_BASE + 0x010, 0b01);
        probe.expected_read(CTI_BASE + 0x134, 0b01);
        probe.expected_read(CTI_BASE + 0x134, 0b00);

        let mut cti = Cti::new(Dap::new(&mut probe, 0, CTI_BASE));
        cti.pulse_channel(CTI_CHANNEL_RESTART).unwrap();
        assert!(cti.ack_halt(Duration::from_secs(1)).unwrap());

        assert!(probe.is_done());
    }

    #[test]
    fn transport_errors_propagate_unchanged() {
        let mut probe = MockProbe::new();
        probe.expected_error(CTI_BASE + 0x01C, TransportError::Timeout);

        let mut cti = Cti::new(Dap::new(&mut probe, 0, CTI_BASE));

        assert_eq!(
            cti.pulse_channel(CTI_CHANNEL_HALT),
            Err(TransportError::Timeout)
        );
    }
}
