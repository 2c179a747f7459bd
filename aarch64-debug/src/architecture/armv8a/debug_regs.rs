//! External debug and cross trigger register definitions for ARMv8-A

use crate::{
    core::core_status::{BreakpointCause, HaltReason},
    memory_mapped_bitfield_register,
};

/// Distance between consecutive entries of the breakpoint and watchpoint banks.
pub const BANK_STRIDE: u64 = 16;

/// Distance between consecutive CTIOUTEN registers.
pub const CTI_OUTEN_STRIDE: u64 = 4;

memory_mapped_bitfield_register! {
    /// EDSCR - External Debug Status and Control Register
    pub struct Edscr(u32);
    0x088, "EDSCR",
    impl From;

    /// DTRRX holds a value the PE has not consumed yet.
    pub rxfull, set_rxfull: 30;

    /// DTRTX holds a value the debugger has not consumed yet.
    pub txfull, set_txfull: 29;

    /// ITR overrun, sticky.
    pub ito, _: 28;

    /// DTRRX overrun, sticky.
    pub rxo, _: 27;

    /// DTRTX underrun, sticky.
    pub txu, _: 26;

    /// Sticky pipeline advance.
    pub pipeadv, _: 25;

    /// The previous EDITR instruction completed.
    pub ite, set_ite: 24;

    /// Interrupt mask for Non-debug state. 0b11 masks all interrupts while stepping.
    pub intdis, set_intdis: 23, 22;

    /// Memory access mode for the DCC.
    pub ma, set_ma: 20;

    /// Halting debug enable.
    pub hde, set_hde: 14;

    /// Execution state per exception level, bit n is 1 if ELn is AArch64.
    pub rw, set_rw: 13, 10;

    /// Current exception level, valid in Debug state.
    pub el, set_el: 9, 8;

    /// SError interrupt pending.
    pub a, _: 7;

    /// Cumulative error flag, set on aborts and DCC/ITR overruns.
    pub err, set_err: 6;

    /// Debug status: execution state and halt reason.
    pub status, set_status: 5, 0;
}

impl Edscr {
    /// PE is restarting and leaving Debug state.
    pub const STATUS_RESTARTING: u32 = 0b000001;
    /// PE is in Non-debug state.
    pub const STATUS_NON_DEBUG: u32 = 0b000010;
    /// Hardware breakpoint.
    pub const STATUS_BREAKPOINT: u32 = 0b000111;
    /// External debug request, e.g. a CTI halt trigger.
    pub const STATUS_EXTERNAL_REQUEST: u32 = 0b010011;
    /// Halting step, normal.
    pub const STATUS_STEP_NORMAL: u32 = 0b011011;
    /// Halting step, exclusive.
    pub const STATUS_STEP_EXCLUSIVE: u32 = 0b011111;
    /// OS unlock catch.
    pub const STATUS_OS_UNLOCK_CATCH: u32 = 0b100011;
    /// Reset catch.
    pub const STATUS_RESET_CATCH: u32 = 0b100111;
    /// Watchpoint.
    pub const STATUS_WATCHPOINT: u32 = 0b101011;
    /// HLT instruction.
    pub const STATUS_HLT: u32 = 0b101111;
    /// Software access to a debug register.
    pub const STATUS_SW_ACCESS: u32 = 0b110011;
    /// Exception catch.
    pub const STATUS_EXCEPTION_CATCH: u32 = 0b110111;
    /// Halting step, no syndrome.
    pub const STATUS_STEP_NO_SYNDROME: u32 = 0b111011;

    /// Is the core in AArch64 state at its current exception level?
    ///
    /// Only meaningful while halted.
    pub fn currently_64_bit(&self) -> bool {
        self.rw() & (1 << self.el()) > 0
    }

    /// Does the status field describe Debug state?
    pub fn halted(&self) -> bool {
        matches!(
            self.status(),
            Self::STATUS_BREAKPOINT
                | Self::STATUS_EXTERNAL_REQUEST
                | Self::STATUS_STEP_NORMAL
                | Self::STATUS_STEP_EXCLUSIVE
                | Self::STATUS_OS_UNLOCK_CATCH
                | Self::STATUS_RESET_CATCH
                | Self::STATUS_WATCHPOINT
                | Self::STATUS_HLT
                | Self::STATUS_SW_ACCESS
                | Self::STATUS_EXCEPTION_CATCH
                | Self::STATUS_STEP_NO_SYNDROME
        )
    }

    /// Decode the status field into a [`HaltReason`].
    pub fn halt_reason(&self) -> HaltReason {
        match self.status() {
            Self::STATUS_BREAKPOINT => HaltReason::Breakpoint(BreakpointCause::Hardware),
            Self::STATUS_EXTERNAL_REQUEST => HaltReason::Request,
            Self::STATUS_STEP_NORMAL | Self::STATUS_STEP_EXCLUSIVE | Self::STATUS_STEP_NO_SYNDROME => {
                HaltReason::Step
            }
            Self::STATUS_OS_UNLOCK_CATCH
            | Self::STATUS_RESET_CATCH
            | Self::STATUS_SW_ACCESS
            | Self::STATUS_EXCEPTION_CATCH => HaltReason::Exception,
            Self::STATUS_WATCHPOINT => HaltReason::Watchpoint,
            Self::STATUS_HLT => HaltReason::Breakpoint(BreakpointCause::Software),
            _ => HaltReason::Unknown,
        }
    }
}

memory_mapped_bitfield_register! {
    /// OSLAR_EL1 - OS Lock Access Register
    pub struct Oslar(u32);
    0x300, "OSLAR_EL1",
    impl From;

    /// Writing 0 releases the OS lock.
    pub oslk, set_oslk: 0;
}

memory_mapped_bitfield_register! {
    /// EDLAR - External Debug Lock Access Register
    pub struct Edlar(u32);
    0xFB0, "EDLAR",
    impl From;

    /// Write [`Edlar::UNLOCK_KEY`] to unlock the software lock.
    pub key, set_key: 31, 0;
}

impl Edlar {
    pub const UNLOCK_KEY: u32 = 0xC5AC_CE55;
}

memory_mapped_bitfield_register! {
    /// DBGBVR<n> - Breakpoint Value Register, low word. The high word follows at +4.
    pub struct Dbgbvr(u32);
    0x400, "DBGBVR",
    impl From;

    /// Address or context ID to match.
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGBCR<n> - Breakpoint Control Register
    pub struct Dbgbcr(u32);
    0x408, "DBGBCR",
    impl From;

    /// Breakpoint type
    pub bt, set_bt: 23, 20;

    /// Linked breakpoint number
    pub lbn, set_lbn: 19, 16;

    /// Security state control
    pub ssc, set_ssc: 15, 14;

    /// Higher mode control
    pub hmc, set_hmc: 13;

    /// Byte address select
    pub bas, set_bas: 8, 5;

    /// Privileged mode control
    pub pmc, set_pmc: 2, 1;

    /// Breakpoint enable
    pub e, set_e: 0;
}

impl Dbgbcr {
    /// Unlinked instruction address match.
    pub const BT_ADDRESS: u32 = 0b0000;
    /// Linked instruction address match.
    pub const BT_LINKED_ADDRESS: u32 = 0b0001;
    /// Unlinked context ID match.
    pub const BT_CONTEXT: u32 = 0b0010;
    /// Linked context ID match.
    pub const BT_LINKED_CONTEXT: u32 = 0b0011;
}

memory_mapped_bitfield_register! {
    /// DBGWVR<n> - Watchpoint Value Register, low word. The high word follows at +4.
    pub struct Dbgwvr(u32);
    0x800, "DBGWVR",
    impl From;

    /// Data address to match, bits [1:0] are RES0.
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGWCR<n> - Watchpoint Control Register
    pub struct Dbgwcr(u32);
    0x808, "DBGWCR",
    impl From;

    /// Address mask, the number of low address bits ignored.
    pub mask, set_mask: 28, 24;

    /// Watchpoint type, 1 for linked.
    pub wt, set_wt: 20;

    /// Linked breakpoint number
    pub lbn, set_lbn: 19, 16;

    /// Security state control
    pub ssc, set_ssc: 15, 14;

    /// Higher mode control
    pub hmc, set_hmc: 13;

    /// Byte address select, one bit per byte of the doubleword.
    pub bas, set_bas: 12, 5;

    /// Load/store control: 0b01 load, 0b10 store, 0b11 either.
    pub lsc, set_lsc: 4, 3;

    /// Privilege of access control
    pub pac, set_pac: 2, 1;

    /// Watchpoint enable
    pub e, set_e: 0;
}

memory_mapped_bitfield_register! {
    /// EDDFR - External Debug Feature Register
    pub struct Eddfr(u32);
    0xD28, "EDDFR",
    impl From;

    /// Number of breakpoints that are context-aware, minus 1.
    pub ctx_cmps, set_ctx_cmps: 31, 28;

    /// Number of watchpoints, minus 1.
    pub wrps, set_wrps: 23, 20;

    /// Number of breakpoints, minus 1
    pub brps, set_brps: 15, 12;
}

memory_mapped_bitfield_register! {
    /// EDITR - External Debug Instruction Transfer Register
    pub struct Editr(u32);
    0x084, "EDITR",
    impl From;

    /// Instruction to execute in Debug state.
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDRCR - External Debug Reserve Control Register
    pub struct Edrcr(u32);
    0x090, "EDRCR",
    impl From;

    /// Allow imprecise entry to Debug state.
    pub cbrrq, set_cbrrq: 4;

    /// Clear Sticky Pipeline Advance.
    pub cspa, set_cspa: 3;

    /// Clear Sticky Error.
    pub cse, set_cse: 2;
}

memory_mapped_bitfield_register! {
    /// EDESR - External Debug Event Status Register
    pub struct Edesr(u32);
    0x020, "EDESR",
    impl From;

    /// Halting step debug event pending.
    pub ss, set_ss: 2;

    /// Reset catch debug event pending. Write 1 to clear.
    pub rc, set_rc: 1;

    /// OS unlock debug event pending. Write 1 to clear.
    pub osuc, set_osuc: 0;
}

memory_mapped_bitfield_register! {
    /// EDECR - External Debug Execution Control Register
    pub struct Edecr(u32);
    0x024, "EDECR",
    impl From;

    /// Halting step enable.
    pub ss, set_ss: 2;

    /// Reset catch enable.
    pub rce, set_rce: 1;

    /// OS unlock catch enable.
    pub osuce, set_osuce: 0;
}

memory_mapped_bitfield_register! {
    /// EDWAR - External Debug Watchpoint Address Register, low word.
    pub struct EdwarLo(u32);
    0x030, "EDWAR_LO",
    impl From;

    /// Bits [31:0] of the address that hit the watchpoint.
    pub address, _: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDWAR - External Debug Watchpoint Address Register, high word.
    pub struct EdwarHi(u32);
    0x034, "EDWAR_HI",
    impl From;

    /// Bits [63:32] of the address that hit the watchpoint.
    pub address, _: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDPRCR - External Debug Power/Reset Control Register
    pub struct Edprcr(u32);
    0x310, "EDPRCR",
    impl From;

    /// Core power up request.
    pub corepurq, set_corepurq: 3;

    /// Warm reset request.
    pub cwrr, set_cwrr: 1;

    /// Core no powerdown request.
    pub corenpdrq, set_corenpdrq: 0;
}

memory_mapped_bitfield_register! {
    /// DBGDTRTX - Debug Data Transfer Register, Transmit
    pub struct Dbgdtrtx(u32);
    0x08C, "DBGDTRTX",
    impl From;

    /// Data word
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGDTRRX - Debug Data Transfer Register, Receive
    pub struct Dbgdtrrx(u32);
    0x080, "DBGDTRRX",
    impl From;

    /// Data word
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDPRSR - External Debug Processor Status Register
    ///
    /// Reading this register clears the sticky bits SDR, SR and SPD.
    pub struct Edprsr(u32);
    0x314, "EDPRSR",
    impl From;

    /// Sticky debug restart: the PE left Debug state since the last read.
    pub sdr, set_sdr: 11;

    /// OS lock status.
    pub oslk, set_oslk: 5;

    /// The PE is in Debug state.
    pub halted, set_halted: 4;

    /// Sticky core reset.
    pub sr, set_sr: 3;

    /// The PE is held in reset.
    pub r, set_r: 2;

    /// Sticky core powerdown.
    pub spd, set_spd: 1;

    /// The core power domain is up.
    pub pu, set_pu: 0;
}

memory_mapped_bitfield_register! {
    /// CTICONTROL - CTI control register
    pub struct CtiControl(u32);
    0x000, "CTICONTROL",
    impl From;

    /// Global enable of the CTI mapping functions.
    pub glben, set_glben: 0;
}

memory_mapped_bitfield_register! {
    /// CTIGATE - CTI gate register. A set bit lets channel N pass to and from the matrix.
    pub struct CtiGate(u32);
    0x140, "CTIGATE",
    impl From;

    /// Channel N open to the cross trigger matrix.
    pub en, set_en: 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTIOUTEN<n> - CTI output enable register for trigger output n
    pub struct CtiOuten(u32);
    0x0A0, "CTIOUTEN",
    impl From;

    /// Channel N drives this trigger output.
    pub outen, set_outen: 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTIAPPPULSE - CTI application pulse register
    pub struct CtiApppulse(u32);
    0x01C, "CTIAPPPULSE",
    impl From;

    /// Generate a pulse on channel N.
    pub apppulse, set_apppulse: 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTIINTACK - CTI Output Trigger Acknowledge register
    pub struct CtiIntack(u32);
    0x010, "CTIINTACK",
    impl From;

    /// Acknowledge trigger output N.
    pub ack, set_ack: 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTITRIGOUTSTATUS - CTI Trigger Out Status register
    pub struct CtiTrigoutstatus(u32);
    0x134, "CTITRIGOUTSTATUS",
    impl From;

    /// Trigger output N is asserted.
    pub status, _: 0, 0, 32;
}
