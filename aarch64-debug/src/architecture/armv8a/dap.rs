//! Register access scoped to one debug component.

use crate::{
    core::memory_mapped_registers::MemoryMappedRegister,
    probe::{RegisterTransport, TransportError},
};

/// A debug component (core debug block or CTI) behind a [`RegisterTransport`].
///
/// This is the only place where component offsets are turned into absolute addresses.
/// No access is ever retried here.
pub struct Dap<'probe> {
    transport: &'probe mut dyn RegisterTransport,
    ap: u8,
    base_address: u64,
}

impl<'probe> Dap<'probe> {
    pub fn new(transport: &'probe mut dyn RegisterTransport, ap: u8, base_address: u64) -> Self {
        Self {
            transport,
            ap,
            base_address,
        }
    }

    /// Base address of the component.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    fn address(&self, offset: u64) -> Result<u64, TransportError> {
        self.base_address
            .checked_add(offset)
            .ok_or(TransportError::Fault {
                ap: self.ap,
                address: self.base_address,
            })
    }

    /// Read the register at `offset` from the component base.
    pub fn read32(&mut self, offset: u64) -> Result<u32, TransportError> {
        let address = self.address(offset)?;
        let value = self.transport.read_word_32(self.ap, address)?;

        tracing::trace!("read  {:#010x} = {:#010x}", address, value);

        Ok(value)
    }

    /// Write the register at `offset` from the component base.
    pub fn write32(&mut self, offset: u64, value: u32) -> Result<(), TransportError> {
        let address = self.address(offset)?;

        tracing::trace!("write {:#010x} = {:#010x}", address, value);

        self.transport.write_word_32(self.ap, address, value)
    }

    /// Read the same register `data.len()` times in one block transfer.
    pub fn read_repeated(&mut self, offset: u64, data: &mut [u32]) -> Result<(), TransportError> {
        let address = self.address(offset)?;

        self.transport.read_repeated_32(self.ap, address, data)
    }

    /// Write every value in `data` to the same register in one block transfer.
    pub fn write_repeated(&mut self, offset: u64, data: &[u32]) -> Result<(), TransportError> {
        let address = self.address(offset)?;

        self.transport.write_repeated_32(self.ap, address, data)
    }

    /// Wait for queued transfers to complete.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.transport.flush()
    }

    pub fn read_register<R: MemoryMappedRegister>(&mut self) -> Result<R, TransportError> {
        Ok(R::from(self.read32(R::ADDRESS_OFFSET)?))
    }

    pub fn write_register<R: MemoryMappedRegister>(&mut self, register: R) -> Result<(), TransportError> {
        self.write32(R::ADDRESS_OFFSET, register.into())
    }

    /// Write entry `index` of a register bank spaced `stride` bytes apart.
    pub fn write_indexed<R: MemoryMappedRegister>(
        &mut self,
        index: usize,
        stride: u64,
        register: R,
    ) -> Result<(), TransportError> {
        self.write32(R::ADDRESS_OFFSET + index as u64 * stride, register.into())
    }

    /// Write a 64-bit value as two words, low word first, at entry `index` of a bank.
    pub fn write_indexed_64<R: MemoryMappedRegister>(
        &mut self,
        index: usize,
        stride: u64,
        value: u64,
    ) -> Result<(), TransportError> {
        let offset = R::ADDRESS_OFFSET + index as u64 * stride;

        self.write32(offset, value as u32)?;
        self.write32(offset + 4, (value >> 32) as u32)
    }

    /// Read a 64-bit value stored as two words, low word first, at entry `index` of a bank.
    pub fn read_indexed_64<R: MemoryMappedRegister>(
        &mut self,
        index: usize,
        stride: u64,
    ) -> Result<u64, TransportError> {
        let offset = R::ADDRESS_OFFSET + index as u64 * stride;

        let low = self.read32(offset)? as u64;
        let high = self.read32(offset + 4)? as u64;

        Ok(high << 32 | low)
    }
}
