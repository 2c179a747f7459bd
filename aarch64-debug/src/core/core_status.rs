use crate::semihosting::SemihostingCommand;

/// The status of the core.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CoreStatus {
    /// The core is currently running.
    Running,
    /// The core is currently halted. This also specifies the reason as a payload.
    Halted(HaltReason),
    /// The core was resumed on behalf of the debugger, for instance to run an algorithm.
    DebugRunning,
    /// The core is held in reset.
    Reset,
    /// The core state is currently unknown. This is always the case when the core is first created.
    Unknown,
}

impl CoreStatus {
    /// Returns `true` if the core is currently halted.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }

    /// Returns `true` if the core is executing code, for the user or for the debugger.
    pub fn is_running(&self) -> bool {
        matches!(self, CoreStatus::Running | CoreStatus::DebugRunning)
    }
}

/// When the core halts due to a breakpoint request, some architectures will allow us to distinguish between a software and hardware breakpoint.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BreakpointCause {
    /// We encountered a hardware breakpoint.
    Hardware,
    /// We encountered a software breakpoint instruction.
    Software,
    /// We were not able to distinguish if this was a hardware or software breakpoint.
    Unknown,
    /// The target requested the host perform a semihosting operation.
    ///
    /// The core set up some registers into a well-specified state and then hit
    /// a breakpoint. This indicates the core would like the debug probe to do
    /// some work.
    Semihosting(SemihostingCommand),
}

/// The reason why a core was halted.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HaltReason {
    /// Core halted due to a breakpoint.
    Breakpoint(BreakpointCause),
    /// Core halted due to an exception or a catch event, e.g. reset catch.
    Exception,
    /// Core halted due to a data watchpoint.
    Watchpoint,
    /// Core halted after single step.
    Step,
    /// Core halted because of a debugger request, directly or through the cross trigger matrix.
    Request,
    /// The reason for the halt is unknown.
    Unknown,
}
