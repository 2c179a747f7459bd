//! Breakpoint and watchpoint units.
//!
//! The breakpoint register pairs are split in two pools: the highest `ctx_cmps` pairs
//! can compare the context ID and are reserved for context and hybrid breakpoints, all
//! others match instruction addresses.

use super::{
    debug_regs::{Dbgbcr, Dbgbvr, Dbgwcr, Dbgwvr, BANK_STRIDE},
    instructions::{build_hlt, build_hlt_t32},
    Armv8a, Armv8aError,
};
use crate::{
    core::{AccessSize, BreakpointId, WatchpointAccess, WatchpointId},
    error::{Error, SlotResource},
};

/// Immediate of the `HLT` instruction used for software breakpoints.
const SOFTWARE_BREAKPOINT_IMMEDIATE: u16 = 0xB;

/// What a breakpoint register pair can compare against.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotKind {
    /// Instruction address only.
    Address,
    /// Instruction address or context ID.
    Context,
}

/// Bookkeeping for one breakpoint register pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BreakpointSlot {
    pub kind: SlotKind,
    pub used: bool,
    pub value: u64,
    pub control: u32,
    /// The other half of a hybrid breakpoint.
    pub linked: Option<usize>,
}

/// Bookkeeping for one watchpoint register pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct WatchpointSlot {
    pub used: bool,
    pub value: u64,
    pub control: u32,
}

/// How a breakpoint is realized on the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointType {
    /// Address match in a register pair.
    Hardware { slot: usize },
    /// `HLT` patched into memory, with the bytes it replaced.
    Software { original: Vec<u8> },
    /// Context ID match in a register pair.
    Context { slot: usize },
    /// Address match linked to a context ID match.
    Hybrid {
        context_slot: usize,
        address_slot: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    /// `None` for context breakpoints.
    pub address: Option<u64>,
    pub asid: Option<u32>,
    pub length: u32,
    pub kind: BreakpointType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchpoint {
    pub id: WatchpointId,
    pub address: u64,
    pub length: u64,
    pub access: WatchpointAccess,
    pub slot: usize,
}

/// Register pairs of one core and the breakpoints and watchpoints using them.
#[derive(Debug, Clone, Default)]
pub struct BreakpointUnits {
    slots: Vec<BreakpointSlot>,
    watch_slots: Vec<WatchpointSlot>,
    breakpoints: Vec<Breakpoint>,
    watchpoints: Vec<Watchpoint>,
    next_id: u32,
}

impl BreakpointUnits {
    /// `brps` breakpoint pairs of which the top `ctx_cmps` are context aware, and `wrps` watchpoint pairs.
    pub fn new(brps: usize, ctx_cmps: usize, wrps: usize) -> Self {
        let first_context = brps.saturating_sub(ctx_cmps);

        let slots = (0..brps)
            .map(|index| BreakpointSlot {
                kind: if index >= first_context {
                    SlotKind::Context
                } else {
                    SlotKind::Address
                },
                used: false,
                value: 0,
                control: 0,
                linked: None,
            })
            .collect();

        Self {
            slots,
            watch_slots: vec![WatchpointSlot::default(); wrps],
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            next_id: 0,
        }
    }

    pub fn slots(&self) -> &[BreakpointSlot] {
        &self.slots
    }

    pub fn watch_slots(&self) -> &[WatchpointSlot] {
        &self.watch_slots
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.watchpoints
    }

    /// The lowest unused pair of the given kind.
    pub fn free_slot(&self, kind: SlotKind) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| !slot.used && slot.kind == kind)
    }

    pub fn free_watch_slot(&self) -> Option<usize> {
        self.watch_slots.iter().position(|slot| !slot.used)
    }

    pub fn find_breakpoint(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.id == id)
    }

    /// The first breakpoint matching instruction address `address`.
    pub fn breakpoint_at(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints
            .iter()
            .find(|bp| bp.address == Some(address))
    }

    fn breakpoints_at(&self, address: u64) -> Vec<Breakpoint> {
        self.breakpoints
            .iter()
            .filter(|bp| bp.address == Some(address))
            .cloned()
            .collect()
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn claim(
        &mut self,
        index: usize,
        value: u64,
        control: u32,
        linked: Option<usize>,
    ) -> Result<(), Error> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| Error::InvalidState(format!("breakpoint unit {index} does not exist")))?;

        if slot.used {
            return Err(Error::InvalidState(format!(
                "breakpoint unit {index} is already in use"
            )));
        }

        slot.used = true;
        slot.value = value;
        slot.control = control;
        slot.linked = linked;

        Ok(())
    }

    fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.used = false;
            slot.value = 0;
            slot.control = 0;
            slot.linked = None;
        }
    }

    fn claim_watch(&mut self, index: usize, value: u64, control: u32) -> Result<(), Error> {
        let slot = self
            .watch_slots
            .get_mut(index)
            .ok_or_else(|| Error::InvalidState(format!("watchpoint unit {index} does not exist")))?;

        if slot.used {
            return Err(Error::InvalidState(format!(
                "watchpoint unit {index} is already in use"
            )));
        }

        *slot = WatchpointSlot {
            used: true,
            value,
            control,
        };

        Ok(())
    }

    fn release_watch(&mut self, index: usize) {
        if let Some(slot) = self.watch_slots.get_mut(index) {
            *slot = WatchpointSlot::default();
        }
    }

    fn insert_breakpoint(
        &mut self,
        address: Option<u64>,
        asid: Option<u32>,
        length: u32,
        kind: BreakpointType,
    ) -> BreakpointId {
        let id = BreakpointId(self.allocate_id());
        self.breakpoints.push(Breakpoint {
            id,
            address,
            asid,
            length,
            kind,
        });
        id
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) {
        self.breakpoints.retain(|bp| bp.id != id);
    }
}

/// Byte address select for an instruction of `length` bytes at `address`.
pub(crate) fn breakpoint_bas(address: u64, length: u32) -> Result<u32, Armv8aError> {
    match length {
        4 => Ok(0b1111),
        2 => Ok(0b11 << (address & 0b10)),
        other => Err(Armv8aError::UnsupportedBreakpointLength(other)),
    }
}

/// Value, byte address select and address mask for a watchpoint.
///
/// Windows inside one doubleword use byte select. Larger windows must be naturally
/// aligned powers of two and use the address mask.
pub(crate) fn watchpoint_geometry(address: u64, length: u64) -> Result<(u64, u32, u32), Armv8aError> {
    let unsupported = Armv8aError::UnsupportedWatchpoint { address, length };

    if length == 0 {
        return Err(unsupported);
    }

    let offset = address & 0b111;
    if length <= 8 && offset + length <= 8 {
        let bas = ((1u32 << length) - 1) << offset;
        return Ok((address & !0b111, bas, 0));
    }

    if length.is_power_of_two() && address % length == 0 && length <= 1 << 31 {
        return Ok((address, 0xFF, length.trailing_zeros()));
    }

    Err(unsupported)
}

fn software_trap(length: u32) -> Result<(AccessSize, Vec<u8>), Armv8aError> {
    match length {
        4 => Ok((
            AccessSize::U32,
            build_hlt(SOFTWARE_BREAKPOINT_IMMEDIATE).to_le_bytes().to_vec(),
        )),
        2 => Ok((
            AccessSize::U16,
            build_hlt_t32(SOFTWARE_BREAKPOINT_IMMEDIATE as u8)
                .to_le_bytes()
                .to_vec(),
        )),
        other => Err(Armv8aError::UnsupportedBreakpointLength(other)),
    }
}

fn access_size_for(length: usize) -> AccessSize {
    if length == 2 {
        AccessSize::U16
    } else {
        AccessSize::U32
    }
}

impl<'probe> Armv8a<'probe> {
    fn exhausted(&self, resource: SlotResource) -> Error {
        Error::ResourceExhausted {
            core: self.definition.id,
            resource,
        }
    }

    /// Disable every breakpoint and watchpoint pair.
    pub(super) fn clear_all_slots(&mut self) -> Result<(), Error> {
        for index in 0..self.state.breakpoints.slots().len() {
            self.disable_breakpoint_slot(index)?;
        }
        for index in 0..self.state.breakpoints.watch_slots().len() {
            self.disable_watchpoint_slot(index)?;
        }

        Ok(())
    }

    /// Program every pair in use again, e.g. after a reset cleared the debug logic.
    pub(super) fn reapply_slots(&mut self) -> Result<(), Error> {
        for index in 0..self.state.breakpoints.slots().len() {
            if self.state.breakpoints.slots()[index].used {
                self.write_breakpoint_slot(index)?;
            }
        }
        for index in 0..self.state.breakpoints.watch_slots().len() {
            if self.state.breakpoints.watch_slots()[index].used {
                self.write_watchpoint_slot(index)?;
            }
        }

        Ok(())
    }

    fn write_breakpoint_slot(&mut self, index: usize) -> Result<(), Error> {
        let slot = self.state.breakpoints.slots()[index];

        let mut debug = self.debug();
        debug.write_indexed_64::<Dbgbvr>(index, BANK_STRIDE, slot.value)?;
        debug.write_indexed(index, BANK_STRIDE, Dbgbcr::from(slot.control))?;

        Ok(())
    }

    fn disable_breakpoint_slot(&mut self, index: usize) -> Result<(), Error> {
        self.debug()
            .write_indexed(index, BANK_STRIDE, Dbgbcr::from(0))?;

        Ok(())
    }

    fn write_watchpoint_slot(&mut self, index: usize) -> Result<(), Error> {
        let slot = self.state.breakpoints.watch_slots()[index];

        let mut debug = self.debug();
        debug.write_indexed_64::<Dbgwvr>(index, BANK_STRIDE, slot.value)?;
        debug.write_indexed(index, BANK_STRIDE, Dbgwcr::from(slot.control))?;

        Ok(())
    }

    fn disable_watchpoint_slot(&mut self, index: usize) -> Result<(), Error> {
        self.debug()
            .write_indexed(index, BANK_STRIDE, Dbgwcr::from(0))?;

        Ok(())
    }

    /// Claim a pair and write it. The pair is disabled and released again if the write fails.
    fn program_breakpoint_slot(
        &mut self,
        index: usize,
        value: u64,
        control: Dbgbcr,
        linked: Option<usize>,
    ) -> Result<(), Error> {
        self.state
            .breakpoints
            .claim(index, value, control.into(), linked)?;

        if let Err(error) = self.write_breakpoint_slot(index) {
            self.state.breakpoints.release(index);
            if let Err(disable) = self.disable_breakpoint_slot(index) {
                tracing::warn!("Failed to disable breakpoint unit {}: {}", index, disable);
            }
            return Err(error);
        }

        Ok(())
    }

    pub(super) fn add_hardware_breakpoint(
        &mut self,
        address: u64,
        length: u32,
    ) -> Result<BreakpointId, Error> {
        let bas = breakpoint_bas(address, length)?;
        let slot = self
            .state
            .breakpoints
            .free_slot(SlotKind::Address)
            .ok_or_else(|| self.exhausted(SlotResource::Breakpoint))?;

        let mut control = Dbgbcr::from(0);
        control.set_bt(Dbgbcr::BT_ADDRESS);
        control.set_hmc(true);
        control.set_bas(bas);
        control.set_pmc(0b11);
        control.set_e(true);

        self.program_breakpoint_slot(slot, address & !0b11, control, None)?;

        tracing::debug!("Hardware breakpoint at {:#x} in unit {}", address, slot);

        Ok(self.state.breakpoints.insert_breakpoint(
            Some(address),
            None,
            length,
            BreakpointType::Hardware { slot },
        ))
    }

    pub(super) fn add_software_breakpoint(
        &mut self,
        address: u64,
        length: u32,
    ) -> Result<BreakpointId, Error> {
        let (size, trap) = software_trap(length)?;

        if let Some(existing) = self.state.breakpoints.breakpoint_at(address) {
            if matches!(existing.kind, BreakpointType::Software { .. }) {
                return Err(Error::InvalidState(format!(
                    "a software breakpoint is already set at {address:#x}"
                )));
            }
        }

        let mut original = vec![0u8; trap.len()];
        self.read_memory_inner(address, size, 1, &mut original, false)?;
        self.write_memory_inner(address, size, 1, &trap, false)?;
        self.flush_instruction_range(address, trap.len() as u64)?;

        tracing::debug!(
            "Software breakpoint at {:#x}, replaced {:02x?}",
            address,
            original
        );

        Ok(self.state.breakpoints.insert_breakpoint(
            Some(address),
            None,
            length,
            BreakpointType::Software { original },
        ))
    }

    pub(super) fn add_context_breakpoint_inner(
        &mut self,
        asid: u32,
        length: u32,
    ) -> Result<BreakpointId, Error> {
        breakpoint_bas(0, length)?;
        let slot = self
            .state
            .breakpoints
            .free_slot(SlotKind::Context)
            .ok_or_else(|| self.exhausted(SlotResource::ContextBreakpoint))?;

        let mut control = Dbgbcr::from(0);
        control.set_bt(Dbgbcr::BT_CONTEXT);
        control.set_bas(0b1111);
        control.set_pmc(0b11);
        control.set_e(true);

        self.program_breakpoint_slot(slot, asid as u64, control, None)?;

        tracing::debug!("Context breakpoint for ASID {:#x} in unit {}", asid, slot);

        Ok(self.state.breakpoints.insert_breakpoint(
            None,
            Some(asid),
            length,
            BreakpointType::Context { slot },
        ))
    }

    /// An address breakpoint that only matches while the context ID equals `asid`.
    ///
    /// The context half is written first. If the address half fails, the context half is
    /// disabled again so no pair stays claimed.
    pub(super) fn add_hybrid_breakpoint_inner(
        &mut self,
        address: u64,
        asid: u32,
        length: u32,
    ) -> Result<BreakpointId, Error> {
        let bas = breakpoint_bas(address, length)?;
        let context_slot = self
            .state
            .breakpoints
            .free_slot(SlotKind::Context)
            .ok_or_else(|| self.exhausted(SlotResource::ContextBreakpoint))?;
        let address_slot = self
            .state
            .breakpoints
            .free_slot(SlotKind::Address)
            .ok_or_else(|| self.exhausted(SlotResource::Breakpoint))?;

        let mut context_control = Dbgbcr::from(0);
        context_control.set_bt(Dbgbcr::BT_LINKED_CONTEXT);
        context_control.set_lbn(address_slot as u32);
        context_control.set_bas(0b1111);
        context_control.set_pmc(0b11);
        context_control.set_e(true);

        let mut address_control = Dbgbcr::from(0);
        address_control.set_bt(Dbgbcr::BT_LINKED_ADDRESS);
        address_control.set_lbn(context_slot as u32);
        address_control.set_hmc(true);
        address_control.set_bas(bas);
        address_control.set_pmc(0b11);
        address_control.set_e(true);

        self.program_breakpoint_slot(
            context_slot,
            asid as u64,
            context_control,
            Some(address_slot),
        )?;

        if let Err(error) = self.program_breakpoint_slot(
            address_slot,
            address & !0b11,
            address_control,
            Some(context_slot),
        ) {
            self.state.breakpoints.release(context_slot);
            if let Err(disable) = self.disable_breakpoint_slot(context_slot) {
                tracing::warn!(
                    "Failed to disable breakpoint unit {}: {}",
                    context_slot,
                    disable
                );
            }
            return Err(error);
        }

        tracing::debug!(
            "Hybrid breakpoint at {:#x} for ASID {:#x} in units {} and {}",
            address,
            asid,
            address_slot,
            context_slot
        );

        Ok(self.state.breakpoints.insert_breakpoint(
            Some(address),
            Some(asid),
            length,
            BreakpointType::Hybrid {
                context_slot,
                address_slot,
            },
        ))
    }

    pub(super) fn remove_breakpoint_inner(&mut self, id: BreakpointId) -> Result<(), Error> {
        let breakpoint = self
            .state
            .breakpoints
            .find_breakpoint(id)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("breakpoint {} does not exist", id.0)))?;

        match &breakpoint.kind {
            BreakpointType::Hardware { slot } | BreakpointType::Context { slot } => {
                self.disable_breakpoint_slot(*slot)?;
                self.state.breakpoints.release(*slot);
            }
            BreakpointType::Hybrid {
                context_slot,
                address_slot,
            } => {
                self.disable_breakpoint_slot(*address_slot)?;
                self.state.breakpoints.release(*address_slot);
                self.disable_breakpoint_slot(*context_slot)?;
                self.state.breakpoints.release(*context_slot);
            }
            BreakpointType::Software { original } => {
                let address = breakpoint.address.ok_or_else(|| {
                    Error::InvalidState("software breakpoint without address".to_string())
                })?;
                self.restore_original_instruction(address, original)?;
            }
        }

        self.state.breakpoints.remove_breakpoint(id);

        Ok(())
    }

    /// Put the replaced bytes back and make sure they stuck.
    fn restore_original_instruction(&mut self, address: u64, original: &[u8]) -> Result<(), Error> {
        let size = access_size_for(original.len());

        for attempt in 0..2 {
            self.write_memory_inner(address, size, 1, original, false)?;
            self.flush_instruction_range(address, original.len() as u64)?;

            let mut current = vec![0u8; original.len()];
            self.read_memory_inner(address, size, 1, &mut current, false)?;
            if current == original {
                return Ok(());
            }

            tracing::warn!(
                "Instruction at {:#x} reads {:02x?} instead of {:02x?} (attempt {})",
                address,
                current,
                original,
                attempt + 1
            );
        }

        Err(Armv8aError::BreakpointRestoreFailed(address).into())
    }

    pub(super) fn add_watchpoint_inner(
        &mut self,
        address: u64,
        length: u64,
        access: WatchpointAccess,
    ) -> Result<WatchpointId, Error> {
        let (value, bas, mask) = watchpoint_geometry(address, length)?;
        let slot = self
            .state
            .breakpoints
            .free_watch_slot()
            .ok_or_else(|| self.exhausted(SlotResource::Watchpoint))?;

        let mut control = Dbgwcr::from(0);
        control.set_mask(mask);
        control.set_hmc(true);
        control.set_bas(bas);
        control.set_lsc(match access {
            WatchpointAccess::Read => 0b01,
            WatchpointAccess::Write => 0b10,
            WatchpointAccess::ReadWrite => 0b11,
        });
        control.set_pac(0b11);
        control.set_e(true);

        self.state
            .breakpoints
            .claim_watch(slot, value, control.into())?;

        if let Err(error) = self.write_watchpoint_slot(slot) {
            self.state.breakpoints.release_watch(slot);
            if let Err(disable) = self.disable_watchpoint_slot(slot) {
                tracing::warn!("Failed to disable watchpoint unit {}: {}", slot, disable);
            }
            return Err(error);
        }

        tracing::debug!(
            "Watchpoint on {} bytes at {:#x} in unit {}",
            length,
            address,
            slot
        );

        let units = &mut self.state.breakpoints;
        let id = WatchpointId(units.allocate_id());
        units.watchpoints.push(Watchpoint {
            id,
            address,
            length,
            access,
            slot,
        });

        Ok(id)
    }

    pub(super) fn remove_watchpoint_inner(&mut self, id: WatchpointId) -> Result<(), Error> {
        let slot = self
            .state
            .breakpoints
            .watchpoints()
            .iter()
            .find(|wp| wp.id == id)
            .map(|wp| wp.slot)
            .ok_or_else(|| Error::InvalidState(format!("watchpoint {} does not exist", id.0)))?;

        self.disable_watchpoint_slot(slot)?;
        self.state.breakpoints.release_watch(slot);
        self.state.breakpoints.watchpoints.retain(|wp| wp.id != id);

        Ok(())
    }

    /// Remove everything, restoring patched memory where the core allows it.
    pub(super) fn remove_all_breakpoints(&mut self) -> Result<(), Error> {
        let breakpoints = self.state.breakpoints.breakpoints().to_vec();
        for breakpoint in breakpoints {
            let software = matches!(breakpoint.kind, BreakpointType::Software { .. });
            if software && !self.state.current_state.is_halted() {
                tracing::warn!(
                    "Core {} is running, leaving the software breakpoint at {:#x?} in memory",
                    self.definition.id,
                    breakpoint.address
                );
                self.state.breakpoints.remove_breakpoint(breakpoint.id);
                continue;
            }

            self.remove_breakpoint_inner(breakpoint.id)?;
        }

        let watchpoints: Vec<WatchpointId> = self
            .state
            .breakpoints
            .watchpoints()
            .iter()
            .map(|wp| wp.id)
            .collect();
        for id in watchpoints {
            self.remove_watchpoint_inner(id)?;
        }

        Ok(())
    }

    /// Run `f` with every breakpoint at `address` temporarily taken out.
    pub(super) fn with_breakpoint_lifted<T>(
        &mut self,
        address: u64,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let lifted = self.state.breakpoints.breakpoints_at(address);

        for breakpoint in &lifted {
            self.disarm(breakpoint)?;
        }

        let result = f(self);

        let mut rearm = Ok(());
        for breakpoint in &lifted {
            if let Err(error) = self.arm(breakpoint) {
                tracing::warn!("Failed to re-insert breakpoint at {:#x}: {}", address, error);
                if rearm.is_ok() {
                    rearm = Err(error);
                }
            }
        }

        let value = result?;
        rearm?;

        Ok(value)
    }

    fn disarm(&mut self, breakpoint: &Breakpoint) -> Result<(), Error> {
        match (&breakpoint.kind, breakpoint.address) {
            (BreakpointType::Hardware { slot }, _) => self.disable_breakpoint_slot(*slot),
            (BreakpointType::Hybrid { address_slot, .. }, _) => {
                self.disable_breakpoint_slot(*address_slot)
            }
            (BreakpointType::Software { original }, Some(address)) => {
                let size = access_size_for(original.len());
                self.write_memory_inner(address, size, 1, original, false)?;
                self.flush_instruction_range(address, original.len() as u64)
            }
            _ => Ok(()),
        }
    }

    fn arm(&mut self, breakpoint: &Breakpoint) -> Result<(), Error> {
        match (&breakpoint.kind, breakpoint.address) {
            (BreakpointType::Hardware { slot }, _) => self.write_breakpoint_slot(*slot),
            (BreakpointType::Hybrid { address_slot, .. }, _) => {
                self.write_breakpoint_slot(*address_slot)
            }
            (BreakpointType::Software { .. }, Some(address)) => {
                let (size, trap) = software_trap(breakpoint.length)?;
                self.write_memory_inner(address, size, 1, &trap, false)?;
                self.flush_instruction_range(address, trap.len() as u64)
            }
            _ => Ok(()),
        }
    }
}
