/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains the primitive types shared by the VRender0 emulator libraries.

--*/

mod macros;

/// Bus data width
pub type BusData = u32;

/// Bus address width
pub type BusAddr = u32;

/// Interrupt source number inside the SoC interrupt controller
pub type IrqId = u8;

emu_enum!(
    /// Bus access size
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub BusSize;
    usize;
    {
        Byte = 1,
        HalfWord = 2,
        Word = 4,
    };
    Invalid
);

impl BusSize {
    /// Mask selecting the low `self` bytes of a bus word. `Invalid` selects
    /// nothing.
    pub fn mask(self) -> BusData {
        match self {
            BusSize::Byte => 0x0000_00ff,
            BusSize::HalfWord => 0x0000_ffff,
            BusSize::Word => 0xffff_ffff,
            BusSize::Invalid => 0,
        }
    }

    /// Number of bytes covered by an access of this size.
    pub fn bytes(self) -> u32 {
        match self {
            BusSize::Byte => 1,
            BusSize::HalfWord => 2,
            BusSize::Word => 4,
            BusSize::Invalid => 0,
        }
    }
}
