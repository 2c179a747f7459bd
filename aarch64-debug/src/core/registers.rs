//! Core register identifiers and the per-core register cache.

/// The index of a core register in the register cache.
///
/// The numbering matches what GDB uses for AArch64: `x0` to `x30` are 0 to 30,
/// followed by SP, PC and CPSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterId(pub u16);

impl RegisterId {
    /// The stack pointer of the current exception level.
    pub const SP: RegisterId = RegisterId(31);
    /// The program counter, backed by DLR_EL0 while halted.
    pub const PC: RegisterId = RegisterId(32);
    /// The processor state, backed by DSPSR_EL0 while halted.
    pub const CPSR: RegisterId = RegisterId(33);

    /// General purpose register `x<n>`.
    pub const fn x(n: u16) -> RegisterId {
        RegisterId(n)
    }

    /// Register name as used in disassembly.
    pub fn name(self) -> String {
        match self {
            RegisterId::SP => "sp".to_string(),
            RegisterId::PC => "pc".to_string(),
            RegisterId::CPSR => "cpsr".to_string(),
            RegisterId(30) => "lr".to_string(),
            RegisterId(n) => format!("x{n}"),
        }
    }
}

impl From<u16> for RegisterId {
    fn from(value: u16) -> Self {
        RegisterId(value)
    }
}

/// Number of registers tracked in the cache.
pub const AARCH64_REGISTER_COUNT: usize = 34;

/// All cached registers in the order they have to be written back to the core.
///
/// SP, PC and CPSR go through `x0`, so they are restored before the general purpose registers.
pub fn writeback_order() -> impl Iterator<Item = RegisterId> {
    (31u16..=33).chain(0u16..=30).map(RegisterId)
}

/// One entry of the [`RegisterCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachedRegister {
    /// The last value read from or written to the core.
    pub value: u64,
    /// `value` reflects the register.
    pub valid: bool,
    /// `value` has to be written back before the core resumes.
    pub dirty: bool,
}

/// Cached core registers, owned by a single core and indexed by [`RegisterId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCache {
    entries: Vec<CachedRegister>,
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterCache {
    /// An empty cache for the AArch64 register file.
    pub fn new() -> Self {
        Self {
            entries: vec![CachedRegister::default(); AARCH64_REGISTER_COUNT],
        }
    }

    fn entry(&self, id: RegisterId) -> Option<&CachedRegister> {
        self.entries.get(usize::from(id.0))
    }

    /// The cached value, if it is valid.
    pub fn get(&self, id: RegisterId) -> Option<u64> {
        self.entry(id).filter(|e| e.valid).map(|e| e.value)
    }

    /// Is there a value waiting to be written back?
    pub fn is_dirty(&self, id: RegisterId) -> bool {
        self.entry(id).is_some_and(|e| e.valid && e.dirty)
    }

    /// Record a value read from the core.
    ///
    /// Returns `false` if `id` is out of range.
    pub fn fill(&mut self, id: RegisterId, value: u64) -> bool {
        match self.entries.get_mut(usize::from(id.0)) {
            Some(entry) => {
                *entry = CachedRegister {
                    value,
                    valid: true,
                    dirty: false,
                };
                true
            }
            None => false,
        }
    }

    /// Record a value that has to reach the core before it resumes.
    ///
    /// Returns `false` if `id` is out of range.
    pub fn set(&mut self, id: RegisterId, value: u64) -> bool {
        match self.entries.get_mut(usize::from(id.0)) {
            Some(entry) => {
                *entry = CachedRegister {
                    value,
                    valid: true,
                    dirty: true,
                };
                true
            }
            None => false,
        }
    }

    /// Flag a valid entry for writeback without changing its value.
    pub fn mark_dirty(&mut self, id: RegisterId) {
        if let Some(entry) = self.entries.get_mut(usize::from(id.0)) {
            if entry.valid {
                entry.dirty = true;
            }
        }
    }

    /// Forget every cached value.
    pub fn invalidate(&mut self) {
        self.entries.fill(CachedRegister::default());
    }

    /// Registers with pending writes, in [`writeback_order`].
    pub fn dirty_registers(&self) -> Vec<(RegisterId, u64)> {
        writeback_order()
            .filter_map(|id| {
                self.entry(id)
                    .filter(|e| e.valid && e.dirty)
                    .map(|e| (id, e.value))
            })
            .collect()
    }
}

/// The register context saved around an algorithm run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugRegisterSnapshot {
    /// `x0`-`x30`, SP, PC and CPSR, indexed by [`RegisterId`].
    pub registers: [u64; AARCH64_REGISTER_COUNT],
    /// Exception level the core was halted in.
    pub exception_level: u8,
}

impl DebugRegisterSnapshot {
    /// The saved value of `id`.
    pub fn get(&self, id: RegisterId) -> Option<u64> {
        self.registers.get(usize::from(id.0)).copied()
    }
}
