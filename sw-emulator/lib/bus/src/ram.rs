/*++

Licensed under the Apache-2.0 license.

File Name:

    ram.rs

Abstract:

    File contains a little-endian RAM device, used as the host address space
    that bus masters such as the DMA controller read from and write to.

--*/

use crate::{Bus, BusError};
use vr0_emu_types::{BusAddr, BusData, BusSize};

/// Byte-addressable little-endian memory. Accesses must be naturally aligned.
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    /// Create new RAM holding `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Create zero-filled RAM of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    pub fn mmap_size(&self) -> BusAddr {
        self.data.len() as BusAddr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The bytes an access touches, or None if it runs past the end.
    fn span(&self, size: BusSize, addr: BusAddr) -> Option<std::ops::Range<usize>> {
        let len = size.bytes() as usize;
        if len == 0 {
            return None;
        }
        let start = addr as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    fn is_aligned(size: BusSize, addr: BusAddr) -> bool {
        addr % size.bytes().max(1) == 0
    }
}

impl Bus for Ram {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        let span = self.span(size, addr).ok_or(BusError::LoadAccessFault)?;
        if !Self::is_aligned(size, addr) {
            return Err(BusError::LoadAddrMisaligned);
        }
        let mut bytes = [0u8; 4];
        bytes[..span.len()].copy_from_slice(&self.data[span]);
        Ok(BusData::from_le_bytes(bytes))
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        let span = self.span(size, addr).ok_or(BusError::StoreAccessFault)?;
        if !Self::is_aligned(size, addr) {
            return Err(BusError::StoreAddrMisaligned);
        }
        let len = span.len();
        self.data[span].copy_from_slice(&val.to_le_bytes()[..len]);
        Ok(())
    }
}
