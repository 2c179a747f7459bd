//! The debug session: every core of the target behind one transport.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    architecture::armv8a::{
        sequences::{Armv8aDebugSequence, DefaultArmv8aSequence},
        Armv8a, Armv8aError, Armv8aState, HaltMode, RestartMode, RestartScope,
    },
    config::{CoreDefinition, ResetStrategy, SessionConfig, SmpGroup},
    core::{
        Core, CoreInformation, CoreInterface, CoreStatus, RegisterId, ResumeOptions, TargetEvent,
    },
    error::Error,
    probe::RegisterTransport,
};

type EventListener = Box<dyn FnMut(usize, TargetEvent)>;

struct CoreSlot {
    definition: CoreDefinition,
    state: Armv8aState,
}

/// The `Session` struct represents an active debug session.
///
/// It owns the transport and the state of every configured core. Single core operations
/// go through [`Session::core`]. The group aware operations on the session itself keep
/// the members of an SMP group in step with each other.
pub struct Session {
    transport: Box<dyn RegisterTransport>,
    cores: Vec<CoreSlot>,
    groups: Vec<SmpGroup>,
    sequence: Arc<dyn Armv8aDebugSequence>,
    listeners: Vec<EventListener>,
    foreground_core: Option<usize>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field(
                "cores",
                &self
                    .cores
                    .iter()
                    .map(|slot| (&slot.definition.name, slot.state.current_state()))
                    .collect::<Vec<_>>(),
            )
            .field("groups", &self.groups)
            .field("foreground_core", &self.foreground_core)
            .finish()
    }
}

impl Session {
    /// Open a session with the default debug sequences.
    pub fn new(
        transport: Box<dyn RegisterTransport>,
        config: &SessionConfig,
    ) -> Result<Self, Error> {
        Self::with_sequence(transport, config, DefaultArmv8aSequence::create())
    }

    /// Open a session with target specific debug sequences.
    ///
    /// Every core is examined. A core whose power domain is off is left unexamined and
    /// examined again the next time it is accessed.
    pub fn with_sequence(
        transport: Box<dyn RegisterTransport>,
        config: &SessionConfig,
        sequence: Arc<dyn Armv8aDebugSequence>,
    ) -> Result<Self, Error> {
        let (definitions, groups) = config.resolve()?;

        let cores = definitions
            .into_iter()
            .zip(&config.cores)
            .map(|(definition, core)| CoreSlot {
                definition,
                state: Armv8aState::new(core.step_interrupt_masking),
            })
            .collect();

        let mut session = Self {
            transport,
            cores,
            groups,
            sequence,
            listeners: Vec::new(),
            foreground_core: None,
        };

        for index in 0..session.cores.len() {
            let examined = session.armv8a(index).map(|_| ());
            match examined {
                Ok(()) => {}
                Err(Error::Armv8a(Armv8aError::PoweredDown)) => {
                    tracing::warn!(
                        "Core {} is powered down, it will be examined on first use",
                        session.cores[index].definition.name
                    );
                }
                Err(error) => return Err(error),
            }
        }

        Ok(session)
    }

    /// Number of configured cores.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Index and name of every core.
    pub fn list_cores(&self) -> Vec<(usize, &str)> {
        self.cores
            .iter()
            .map(|slot| (slot.definition.id, slot.definition.name.as_str()))
            .collect()
    }

    /// The SMP groups, with members as core indices.
    pub fn smp_groups(&self) -> &[SmpGroup] {
        &self.groups
    }

    /// Index of the SMP group `core` belongs to.
    pub fn smp_group_of(&self, core: usize) -> Option<usize> {
        self.groups
            .iter()
            .position(|group| group.members.contains(&core))
    }

    /// Status of `core` as of its last poll.
    pub fn cached_status(&self, core: usize) -> Result<CoreStatus, Error> {
        Ok(self.slot(core)?.state.current_state())
    }

    /// Mark the core a front end is currently polling itself.
    ///
    /// When another member of its SMP group halts, this core is halted with the group but
    /// left for the front end to poll.
    pub fn set_foreground_core(&mut self, core: Option<usize>) -> Result<(), Error> {
        if let Some(core) = core {
            self.slot(core)?;
        }
        self.foreground_core = core;

        Ok(())
    }

    /// Register a callback for state changes of any core.
    pub fn add_event_listener(&mut self, listener: impl FnMut(usize, TargetEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Attach to the core with index `index`.
    ///
    /// Operations through the returned handle affect this core only, even when it is a
    /// member of an SMP group.
    pub fn core(&mut self, index: usize) -> Result<Core<'_>, Error> {
        Ok(Core::new(self.armv8a(index)?))
    }

    pub(crate) fn armv8a(&mut self, index: usize) -> Result<Armv8a<'_>, Error> {
        let slot = self
            .cores
            .get_mut(index)
            .ok_or(Error::CoreNotFound(index))?;

        Armv8a::new(
            &mut *self.transport,
            &mut slot.state,
            &slot.definition,
            self.sequence.clone(),
        )
    }

    fn slot(&self, index: usize) -> Result<&CoreSlot, Error> {
        self.cores.get(index).ok_or(Error::CoreNotFound(index))
    }

    fn emit(&mut self, core: usize, event: TargetEvent) {
        tracing::debug!("Core {}: {:?}", core, event);
        for listener in &mut self.listeners {
            listener(core, event);
        }
    }

    fn is_examined(&self, core: usize) -> bool {
        self.cores
            .get(core)
            .is_some_and(|slot| slot.state.examined)
    }

    /// Members of the SMP group of `core`, or `core` alone.
    fn group_members(&self, core: usize) -> Vec<usize> {
        match self.smp_group_of(core) {
            Some(group) => self.groups[group].members.clone(),
            None => vec![core],
        }
    }

    fn halt_timeout(&self, core: usize) -> Duration {
        self.cores
            .get(core)
            .map(|slot| slot.definition.timeouts.halt())
            .unwrap_or_default()
    }

    /// Halt `core`, and the rest of its SMP group if it is in one.
    #[tracing::instrument(skip(self))]
    pub fn halt(&mut self, core: usize) -> Result<CoreInformation, Error> {
        match self.smp_group_of(core) {
            Some(group) => {
                self.halt_smp(group, None)?;
                for member in self.groups[group].members.clone() {
                    if self.is_examined(member) {
                        self.poll_inner(member, false)?;
                    }
                }
            }
            None => {
                if !self.slot(core)?.state.current_state().is_halted() {
                    self.armv8a(core)?.halt_one(HaltMode::Sync)?;
                    self.poll_inner(core, false)?;
                }
            }
        }

        let pc = self.armv8a(core)?.read_core_reg(RegisterId::PC)?;

        Ok(CoreInformation { pc })
    }

    /// Halt every member of SMP group `group` that is not halted yet with a single cross trigger
    /// event. Members held in reset are left alone.
    ///
    /// `excluding` is a member that already halted on its own.
    #[tracing::instrument(skip(self))]
    pub fn halt_smp(&mut self, group: usize, excluding: Option<usize>) -> Result<(), Error> {
        let Some(smp) = self.groups.get(group) else {
            return Err(Error::InvalidState(format!("SMP group {group} does not exist")));
        };
        let members = smp.members.clone();
        let retry = smp.smp_halt_retry;

        let mut prepared = Vec::new();
        for &member in &members {
            if Some(member) == excluding || !self.is_examined(member) {
                continue;
            }
            // Debug running and not yet known members are halted as well.
            let state = self.cores[member].state.current_state();
            if state.is_halted() || state == CoreStatus::Reset {
                continue;
            }

            self.armv8a(member)?.prepare_smp_halt()?;
            prepared.push(member);
        }

        let Some(&first) = prepared.first() else {
            return Ok(());
        };

        // One pulse reaches every prepared member through the matrix.
        self.armv8a(first)?.halt_one(HaltMode::Lazy)?;

        let timeout = self.halt_timeout(first);
        let mut pending = self.wait_for_members_halted(prepared, timeout)?;

        if !pending.is_empty() && retry {
            for &member in &pending {
                tracing::warn!(
                    "Core {} did not halt with its SMP group, halting it individually",
                    member
                );
                self.armv8a(member)?.halt_one(HaltMode::Lazy)?;
            }
            pending = self.wait_for_members_halted(pending, timeout)?;
        }

        match pending.first() {
            Some(&core) => Err(Error::Timeout {
                core,
                operation: "SMP halt",
            }),
            None => Ok(()),
        }
    }

    /// Returns the members which are still running after `timeout`.
    fn wait_for_members_halted(
        &mut self,
        mut pending: Vec<usize>,
        timeout: Duration,
    ) -> Result<Vec<usize>, Error> {
        let start = Instant::now();
        loop {
            let mut running = Vec::with_capacity(pending.len());
            for member in pending {
                if !self.armv8a(member)?.core_halted()? {
                    running.push(member);
                }
            }
            pending = running;

            if pending.is_empty() || start.elapsed() >= timeout {
                return Ok(pending);
            }
        }
    }

    /// Resume `core`. The other halted members of its SMP group restart with it.
    #[tracing::instrument(skip(self))]
    pub fn resume(&mut self, core: usize, options: ResumeOptions) -> Result<(), Error> {
        if !self.slot(core)?.state.current_state().is_halted() {
            return Err(Error::NotHalted(core));
        }

        let Some(group) = self.smp_group_of(core) else {
            let event = self.armv8a(core)?.resume_core(
                options,
                RestartScope::Local,
                RestartMode::Sync,
            )?;
            self.emit(core, event);
            return Ok(());
        };

        // Leave the breakpoint behind while the rest of the group is still halted.
        let address = self.armv8a(core)?.step_over_breakpoint(options)?;

        let peers = self.prepare_peers_for_restart(group, core)?;

        let event = {
            let mut armv8a = self.armv8a(core)?;
            armv8a.restore_context(address)?;
            armv8a.prepare_restart(RestartScope::Group)?;
            armv8a.restart(RestartMode::Sync)?;
            armv8a.finish_resume(options.debug_execution)
        };

        self.wait_for_peers_restarted(core, peers)?;
        self.emit(core, event);

        Ok(())
    }

    /// Restore and prepare every halted member of `group` except `core`.
    fn prepare_peers_for_restart(&mut self, group: usize, core: usize) -> Result<Vec<usize>, Error> {
        let mut prepared = Vec::new();

        for member in self.groups[group].members.clone() {
            if member == core || !self.is_examined(member) {
                continue;
            }
            if !self.cores[member].state.current_state().is_halted() {
                continue;
            }

            let mut armv8a = self.armv8a(member)?;
            armv8a.restore_context(None)?;
            armv8a.prepare_restart(RestartScope::Group)?;
            prepared.push(member);
        }

        Ok(prepared)
    }

    fn wait_for_peers_restarted(&mut self, core: usize, peers: Vec<usize>) -> Result<(), Error> {
        let timeout = self.halt_timeout(core);
        let start = Instant::now();

        for peer in peers {
            loop {
                if self.armv8a(peer)?.has_restarted()? {
                    break;
                }
                if start.elapsed() >= timeout {
                    return Err(Error::Timeout {
                        core: peer,
                        operation: "SMP resume",
                    });
                }
            }

            let event = self.armv8a(peer)?.finish_resume(false);
            self.emit(peer, event);
        }

        Ok(())
    }

    /// Execute a single instruction on `core`.
    ///
    /// The other members of its SMP group are resumed and keep running.
    #[tracing::instrument(skip(self))]
    pub fn step(
        &mut self,
        core: usize,
        address: Option<u64>,
        handle_breakpoints: bool,
    ) -> Result<CoreInformation, Error> {
        let context = self.armv8a(core)?.step_prepare()?;

        if let Some(group) = self.smp_group_of(core) {
            if let Err(error) = self.restart_peers_for_step(group, core) {
                self.armv8a(core)?.step_cleanup(context)?;
                return Err(error);
            }
        }

        let information = self
            .armv8a(core)?
            .step_execute(context, address, handle_breakpoints)?;
        self.emit(core, TargetEvent::Halted);

        Ok(information)
    }

    fn restart_peers_for_step(&mut self, group: usize, core: usize) -> Result<(), Error> {
        // The restart pulse for the group must not reach the stepping core.
        self.armv8a(core)?.isolate_from_restart()?;

        let peers = self.prepare_peers_for_restart(group, core)?;
        let Some(&first) = peers.first() else {
            return Ok(());
        };

        self.armv8a(first)?.restart(RestartMode::Lazy)?;
        self.wait_for_peers_restarted(core, peers)
    }

    /// Poll `core` and dispatch events for any state change.
    ///
    /// When a member of an SMP group halted on its own, the rest of the group is halted
    /// and polled as well.
    #[tracing::instrument(skip(self))]
    pub fn poll(&mut self, core: usize) -> Result<CoreStatus, Error> {
        self.poll_inner(core, true)
    }

    /// Poll every examined core.
    pub fn poll_all(&mut self) -> Result<(), Error> {
        for core in 0..self.cores.len() {
            if self.is_examined(core) {
                self.poll_inner(core, true)?;
            }
        }

        Ok(())
    }

    fn poll_inner(&mut self, core: usize, follow_group: bool) -> Result<CoreStatus, Error> {
        let requested = self.slot(core)?.state.pending_reason.is_some();

        let mut armv8a = self.armv8a(core)?;
        let event = armv8a.poll_core()?;
        let status = armv8a.state().current_state();

        if let Some(event) = event {
            self.emit(core, event);
        }

        let halted = matches!(
            event,
            Some(TargetEvent::Halted) | Some(TargetEvent::DebugHalted)
        );
        if halted && follow_group {
            if let Some(group) = self.smp_group_of(core) {
                self.update_group_after_halt(group, core, requested)?;
            }
        }

        Ok(status)
    }

    fn update_group_after_halt(
        &mut self,
        group: usize,
        core: usize,
        requested: bool,
    ) -> Result<(), Error> {
        if !requested {
            tracing::debug!(
                "Core {} halted on its own, halting the rest of SMP group {}",
                core,
                self.groups[group].name
            );
            self.halt_smp(group, Some(core))?;
        }

        let members = self.groups[group].members.clone();
        let foreground = self.foreground_core;

        for &member in &members {
            if member == core || Some(member) == foreground || !self.is_examined(member) {
                continue;
            }
            if self.cores[member].state.current_state().is_halted() {
                continue;
            }
            self.poll_inner(member, false)?;
        }

        Ok(())
    }

    /// Assert reset on `core`.
    ///
    /// The system reset line resets every core of the session. A warm reset resets the
    /// members of the SMP group of `core`.
    #[tracing::instrument(skip(self))]
    pub fn assert_reset(&mut self, core: usize) -> Result<(), Error> {
        let strategy = self.slot(core)?.definition.reset_strategy;
        let affected = self.reset_domain(core, strategy);

        for &member in &affected {
            let catch = self.cores[member].definition.reset_catch;
            self.armv8a(member)?.prepare_reset(catch)?;
        }

        match strategy {
            ResetStrategy::SystemReset => self.transport.target_reset_assert()?,
            ResetStrategy::WarmReset => {
                for &member in &affected {
                    self.armv8a(member)?.warm_reset()?;
                }
            }
        }

        for member in affected {
            self.armv8a(member)?.mark_reset();
            self.emit(member, TargetEvent::ResetAsserted);
        }

        Ok(())
    }

    /// Release reset on `core` and apply the reset catch policy of every reset core.
    #[tracing::instrument(skip(self))]
    pub fn deassert_reset(&mut self, core: usize) -> Result<(), Error> {
        let strategy = self.slot(core)?.definition.reset_strategy;
        let affected = self.reset_domain(core, strategy);

        if strategy == ResetStrategy::SystemReset {
            self.transport.target_reset_deassert()?;
        }

        for member in affected {
            let catch = self.cores[member].definition.reset_catch;
            let event = self.armv8a(member)?.finish_reset(catch)?;

            self.emit(member, TargetEvent::ResetDeasserted);
            if let Some(event) = event {
                self.emit(member, event);
            }
        }

        Ok(())
    }

    fn reset_domain(&self, core: usize, strategy: ResetStrategy) -> Vec<usize> {
        let members = match strategy {
            ResetStrategy::SystemReset => (0..self.cores.len()).collect(),
            ResetStrategy::WarmReset => self.group_members(core),
        };

        members
            .into_iter()
            .filter(|&member| member == core || self.is_examined(member))
            .collect()
    }
}

impl Drop for Session {
    #[tracing::instrument(name = "session_drop", skip(self))]
    fn drop(&mut self) {
        for index in 0..self.cores.len() {
            if !self.is_examined(index) {
                continue;
            }

            if let Err(err) = self
                .armv8a(index)
                .and_then(|mut core| core.debug_core_stop())
            {
                tracing::warn!("Failed to deconfigure core {}: {:?}", index, err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::fake_probe::FakeTarget;
    use pretty_assertions::assert_eq;

    const CLUSTER: &str = r#"
cores:
  - name: cpu0
    ap: 0
    debug_base: 0x80010000
    cti: cti0
  - name: cpu1
    ap: 0
    debug_base: 0x80012000
    cti: cti1
  - name: cpu2
    ap: 0
    debug_base: 0x80014000
    cti: cti2
ctis:
  - name: cti0
    ap: 0
    base: 0x80020000
  - name: cti1
    ap: 0
    base: 0x80021000
  - name: cti2
    ap: 0
    base: 0x80022000
smp_groups:
  - name: cluster0
    cores: [cpu0, cpu1]
"#;

    fn session() -> (Session, FakeTarget) {
        let config = SessionConfig::from_yaml_str(CLUSTER).unwrap();
        let target = FakeTarget::from_config(&config);
        let session = Session::new(Box::new(target.clone()), &config).unwrap();

        (session, target)
    }

    #[test]
    fn cores_are_listed_in_configuration_order() {
        let (session, _target) = session();

        assert_eq!(
            session.list_cores(),
            vec![(0, "cpu0"), (1, "cpu1"), (2, "cpu2")]
        );
        assert_eq!(session.smp_group_of(1), Some(0));
        assert_eq!(session.smp_group_of(2), None);
    }

    #[test]
    fn examined_cores_are_running() {
        let (session, _target) = session();

        for core in 0..3 {
            assert_eq!(session.cached_status(core).unwrap(), CoreStatus::Running);
        }
    }

    #[test]
    fn unknown_core_is_reported() {
        let (mut session, _target) = session();

        assert!(matches!(session.core(7), Err(Error::CoreNotFound(7))));
        assert!(matches!(
            session.set_foreground_core(Some(3)),
            Err(Error::CoreNotFound(3))
        ));
    }

    #[test]
    fn group_halt_leaves_other_cores_running() {
        let (mut session, _target) = session();

        session.halt(0).unwrap();

        assert!(session.cached_status(0).unwrap().is_halted());
        assert!(session.cached_status(1).unwrap().is_halted());
        assert_eq!(session.cached_status(2).unwrap(), CoreStatus::Running);
    }
}
