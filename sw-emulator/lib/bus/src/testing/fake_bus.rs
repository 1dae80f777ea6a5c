/*++

Licensed under the Apache-2.0 license.

File Name:

    fake_bus.rs

Abstract:

    File contains code for a fake implementation of the Bus trait.

--*/
use vr0_emu_types::{BusAddr, BusData, BusSize};

use crate::{testing::Log, Bus, BusError};
use std::fmt::Write;

/// A Bus implementation that logs all calls, and allows the user to override
/// the return value of the methods.
///
/// # Example
///
/// ```
/// use vr0_emu_bus::{Bus, testing::FakeBus};
/// use vr0_emu_types::BusSize;
///
/// let mut fake_bus = FakeBus::new();
/// fake_bus.read_result = Ok(35);
/// assert_eq!(fake_bus.read(BusSize::HalfWord, 0xdeadcafe), Ok(35));
/// assert_eq!("read(BusSize::HalfWord, 0xdeadcafe)\n", fake_bus.log.take());
/// ```
pub struct FakeBus {
    pub log: Log,
    pub read_result: Result<BusData, BusError>,
    pub write_result: Result<(), BusError>,
}
impl FakeBus {
    pub fn new() -> Self {
        Self {
            log: Log::new(),
            read_result: Ok(0),
            write_result: Ok(()),
        }
    }
}
impl Default for FakeBus {
    fn default() -> Self {
        Self::new()
    }
}
impl Bus for FakeBus {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        writeln!(self.log.w(), "read(BusSize::{size:?}, {addr:#x})").unwrap();
        self.read_result
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        writeln!(self.log.w(), "write(BusSize::{size:?}, {addr:#x}, {val:#x})").unwrap();
        self.write_result
    }

    fn poll(&mut self) {
        writeln!(self.log.w(), "poll()").unwrap();
    }

    fn reset(&mut self) {
        writeln!(self.log.w(), "reset()").unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_bus() {
        let mut fake_bus = FakeBus::new();

        assert_eq!(fake_bus.read(BusSize::HalfWord, 0xdeadcafe), Ok(0));
        assert_eq!("read(BusSize::HalfWord, 0xdeadcafe)\n", fake_bus.log.take());

        assert_eq!(fake_bus.write(BusSize::Word, 0xf00dcafe, 0x537), Ok(()));
        assert_eq!(
            "write(BusSize::Word, 0xf00dcafe, 0x537)\n",
            fake_bus.log.take()
        );

        fake_bus.read_result = Err(BusError::LoadAccessFault);
        assert_eq!(
            fake_bus.read(BusSize::Byte, 0x12345678),
            Err(BusError::LoadAccessFault)
        );
        assert_eq!("read(BusSize::Byte, 0x12345678)\n", fake_bus.log.take());

        fake_bus.write_result = Err(BusError::StoreAddrMisaligned);
        assert_eq!(
            fake_bus.write(BusSize::HalfWord, 0x1001, 0x2),
            Err(BusError::StoreAddrMisaligned)
        );
        assert_eq!(
            "write(BusSize::HalfWord, 0x1001, 0x2)\n",
            fake_bus.log.take()
        );
    }
}
