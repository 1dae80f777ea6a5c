/*++

Licensed under the Apache-2.0 license.

File Name:

    register_bank.rs

Abstract:

    File contains the register file every peripheral keeps its raw register
    state in, together with the access rules and byte-lane masking applied
    to bus accesses.

--*/

use vr0_emu_types::{BusAddr, BusData, BusSize};

/// How bus accesses treat a register. Hardware-side updates through
/// [`RegisterBank::set`] ignore these rules.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    ReadWrite,

    /// Writes are ignored.
    ReadOnly,

    /// Reads return 0.
    WriteOnly,

    /// Writing a 1 clears the bit; writing 0 leaves it alone.
    WriteOneToClear,

    /// Read-only; the listed bits clear after a read samples them.
    ClearOnRead(BusData),
}

/// Static description of one register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterDef {
    pub name: &'static str,

    /// Byte offset inside the owning peripheral's window.
    pub offset: BusAddr,

    /// Natural width.
    pub size: BusSize,

    /// Power-on value.
    pub reset: BusData,

    pub access: Access,
}

impl RegisterDef {
    pub const fn new(
        name: &'static str,
        offset: BusAddr,
        size: BusSize,
        reset: BusData,
        access: Access,
    ) -> Self {
        Self {
            name,
            offset,
            size,
            reset,
            access,
        }
    }

    fn contains(&self, addr: BusAddr) -> bool {
        addr.checked_sub(self.offset)
            .is_some_and(|delta| delta < self.size.bytes())
    }
}

/// The byte lanes of one register selected by a bus access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaneAccess {
    /// Index of the register in its bank.
    pub index: usize,

    /// Bit position of the first accessed lane.
    pub shift: u32,

    /// Accessed bits, in register position. Never reaches past the
    /// register's natural width.
    pub mask: BusData,

    /// True when the access size and alignment match the register exactly.
    pub exact: bool,
}

impl LaneAccess {
    /// The accessed lanes of `reg_value`, shifted down to bit 0.
    pub fn extract(&self, reg_value: BusData) -> BusData {
        (reg_value & self.mask) >> self.shift
    }

    /// `old` with the accessed lanes replaced by `val`.
    pub fn merge(&self, old: BusData, val: BusData) -> BusData {
        (old & !self.mask) | ((val << self.shift) & self.mask)
    }

    /// `val` moved into register position, restricted to the accessed lanes.
    pub fn place(&self, val: BusData) -> BusData {
        (val << self.shift) & self.mask
    }

    /// Whether any bit of `bits` lies in the accessed lanes.
    pub fn touches(&self, bits: BusData) -> bool {
        self.mask & bits != 0
    }
}

/// Result of a bus write, for the owning peripheral to act on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterWrite {
    pub index: usize,
    pub old: BusData,
    pub new: BusData,
}

impl RegisterWrite {
    /// Bits that went from 0 to 1.
    pub fn rising(&self) -> BusData {
        !self.old & self.new
    }

    /// Bits that went from 1 to 0.
    pub fn falling(&self) -> BusData {
        self.old & !self.new
    }
}

/// Raw register state of one peripheral.
///
/// Every bus access to a peripheral's registers goes through the bank, which
/// is the only place the stored values change apart from the peripheral's own
/// hardware-side updates.
pub struct RegisterBank {
    defs: &'static [RegisterDef],
    resets: Vec<BusData>,
    values: Vec<BusData>,
}

impl RegisterBank {
    pub fn new(defs: &'static [RegisterDef]) -> Self {
        let resets: Vec<BusData> = defs.iter().map(|d| d.reset).collect();
        Self {
            defs,
            values: resets.clone(),
            resets,
        }
    }

    /// Overrides the power-on value of one register, for values that come
    /// from board configuration rather than the chip.
    pub fn with_reset(mut self, index: usize, value: BusData) -> Self {
        let value = value & self.defs[index].size.mask();
        self.resets[index] = value;
        self.values[index] = value;
        self
    }

    /// Restores every register to its power-on value.
    pub fn reset(&mut self) {
        self.values.copy_from_slice(&self.resets);
    }

    /// Power-on value of one register.
    pub fn reset_value(&self, index: usize) -> BusData {
        self.resets[index]
    }

    pub fn defs(&self) -> &'static [RegisterDef] {
        self.defs
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.defs.iter().position(|d| d.name == name)
    }

    pub fn get(&self, index: usize) -> BusData {
        self.values[index]
    }

    /// Hardware-side store, truncated to the register width.
    pub fn set(&mut self, index: usize, val: BusData) {
        self.values[index] = val & self.defs[index].size.mask();
    }

    pub fn set_bits(&mut self, index: usize, bits: BusData) {
        self.set(index, self.values[index] | bits);
    }

    pub fn clear_bits(&mut self, index: usize, bits: BusData) {
        self.set(index, self.values[index] & !bits);
    }

    /// Finds the register holding `addr` and the lanes a `size` access
    /// starting there covers. Lanes past the register's end are dropped
    /// rather than spilling into the neighbour.
    pub fn decode(&self, addr: BusAddr, size: BusSize) -> Option<LaneAccess> {
        if size == BusSize::Invalid {
            return None;
        }
        let index = self.defs.iter().position(|d| d.contains(addr))?;
        let def = &self.defs[index];
        let shift = (addr - def.offset) * 8;
        Some(LaneAccess {
            index,
            shift,
            mask: (size.mask() << shift) & def.size.mask(),
            exact: shift == 0 && size == def.size,
        })
    }

    /// Bus read of the lanes in `access`, applying the register's access
    /// rules. Clear-on-read bits are returned as they were before clearing.
    pub fn read(&mut self, access: &LaneAccess) -> BusData {
        let value = self.values[access.index];
        match self.defs[access.index].access {
            Access::WriteOnly => 0,
            Access::ClearOnRead(bits) => {
                self.values[access.index] = value & !(bits & access.mask);
                access.extract(value)
            }
            Access::ReadWrite | Access::ReadOnly | Access::WriteOneToClear => {
                access.extract(value)
            }
        }
    }

    /// Bus write of `val` into the lanes in `access`, applying the register's
    /// access rules.
    pub fn write(&mut self, access: &LaneAccess, val: BusData) -> RegisterWrite {
        let old = self.values[access.index];
        let new = match self.defs[access.index].access {
            Access::ReadWrite | Access::WriteOnly => access.merge(old, val),
            Access::WriteOneToClear => old & !access.place(val),
            Access::ReadOnly | Access::ClearOnRead(_) => old,
        };
        self.values[access.index] = new;
        RegisterWrite {
            index: access.index,
            old,
            new,
        }
    }

    /// Decode plus read. None if no register holds `addr`.
    pub fn read_at(&mut self, addr: BusAddr, size: BusSize) -> Option<BusData> {
        let access = self.decode(addr, size)?;
        Some(self.read(&access))
    }

    /// Decode plus write. None if no register holds `addr`.
    pub fn write_at(&mut self, addr: BusAddr, size: BusSize, val: BusData) -> Option<RegisterWrite> {
        let access = self.decode(addr, size)?;
        Some(self.write(&access, val))
    }

    /// Stored values in definition order.
    pub fn values(&self) -> &[BusData] {
        &self.values
    }

    /// Replaces every stored value. Returns false, changing nothing, if
    /// `values` does not hold exactly one value per register.
    pub fn load(&mut self, values: &[BusData]) -> bool {
        if values.len() != self.values.len() {
            return false;
        }
        for (index, val) in values.iter().enumerate() {
            self.set(index, *val);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTRL: usize = 0;
    const STATUS: usize = 1;
    const COUNT: usize = 2;
    const TXB: usize = 3;
    const FLAGS: usize = 4;
    const ID: usize = 5;

    static DEFS: [RegisterDef; 6] = [
        RegisterDef::new("CTRL", 0x0, BusSize::Word, 0x0000_0100, Access::ReadWrite),
        RegisterDef::new("STATUS", 0x4, BusSize::Word, 0, Access::ClearOnRead(0x0000_0003)),
        RegisterDef::new("COUNT", 0x8, BusSize::HalfWord, 0xffff, Access::ReadWrite),
        RegisterDef::new("TXB", 0xc, BusSize::Word, 0, Access::WriteOnly),
        RegisterDef::new("FLAGS", 0x10, BusSize::Word, 0, Access::WriteOneToClear),
        RegisterDef::new("ID", 0x14, BusSize::Word, 0x3208, Access::ReadOnly),
    ];

    fn bank() -> RegisterBank {
        RegisterBank::new(&DEFS)
    }

    #[test]
    fn test_reset_values() {
        let mut regs = bank();
        assert_eq!(regs.read_at(0x0, BusSize::Word), Some(0x100));
        assert_eq!(regs.read_at(0x8, BusSize::HalfWord), Some(0xffff));
        assert_eq!(regs.read_at(0x14, BusSize::Word), Some(0x3208));

        regs.write_at(0x0, BusSize::Word, 0xdead_beef);
        regs.set(COUNT, 7);
        regs.reset();
        assert_eq!(regs.values(), &[0x100, 0, 0xffff, 0, 0, 0x3208]);
    }

    #[test]
    fn test_reset_override() {
        let mut regs = bank().with_reset(ID, 0x0087_9598).with_reset(COUNT, 0x1_0002);
        assert_eq!(regs.get(ID), 0x0087_9598);
        assert_eq!(regs.reset_value(COUNT), 0x0002);
        regs.set(ID, 0);
        regs.reset();
        assert_eq!(regs.read_at(0x14, BusSize::Word), Some(0x0087_9598));
        assert_eq!(regs.reset_value(CTRL), DEFS[CTRL].reset);
    }

    #[test]
    fn test_byte_lanes() {
        let mut regs = bank();
        regs.write_at(0x0, BusSize::Word, 0x4433_2211);
        assert_eq!(regs.read_at(0x1, BusSize::Byte), Some(0x22));
        assert_eq!(regs.read_at(0x2, BusSize::HalfWord), Some(0x4433));

        regs.write_at(0x3, BusSize::Byte, 0xaa);
        assert_eq!(regs.get(CTRL), 0xaa33_2211);
        regs.write_at(0x0, BusSize::HalfWord, 0xffff_5566);
        assert_eq!(regs.get(CTRL), 0xaa33_5566);
    }

    #[test]
    fn test_wide_access_stays_inside_register() {
        let mut regs = bank();
        regs.set(TXB, 0);

        // A word write to a halfword register only lands in its two lanes.
        let write = regs.write_at(0x8, BusSize::Word, 0x1234_5678).unwrap();
        assert_eq!(write.index, COUNT);
        assert_eq!(regs.get(COUNT), 0x5678);
        assert_eq!(regs.get(TXB), 0);

        // A misaligned word access at the top half of CTRL sees only CTRL.
        regs.set(CTRL, 0x8765_4321);
        regs.set(STATUS, 0x3);
        assert_eq!(regs.read_at(0x2, BusSize::Word), Some(0x8765));
        assert_eq!(regs.get(STATUS), 0x3);

        let access = regs.decode(0x2, BusSize::Word).unwrap();
        assert_eq!(access.mask, 0xffff_0000);
        assert!(!access.exact);
        assert!(regs.decode(0x0, BusSize::Word).unwrap().exact);
    }

    #[test]
    fn test_clear_on_read() {
        let mut regs = bank();
        regs.set_bits(STATUS, 0x0000_0101);

        // The read returns the pre-clear value; only listed bits clear.
        assert_eq!(regs.read_at(0x4, BusSize::Word), Some(0x101));
        assert_eq!(regs.read_at(0x4, BusSize::Word), Some(0x100));

        // Writes never touch it.
        regs.write_at(0x4, BusSize::Word, 0);
        assert_eq!(regs.get(STATUS), 0x100);
    }

    #[test]
    fn test_clear_on_read_only_clears_accessed_lanes() {
        static DEFS: [RegisterDef; 1] = [RegisterDef::new(
            "EVT",
            0,
            BusSize::Word,
            0,
            Access::ClearOnRead(0x0001_0001),
        )];
        let mut regs = RegisterBank::new(&DEFS);
        regs.set(0, 0x0001_0001);
        assert_eq!(regs.read_at(0x0, BusSize::Byte), Some(0x01));
        assert_eq!(regs.get(0), 0x0001_0000);
        assert_eq!(regs.read_at(0x2, BusSize::Byte), Some(0x01));
        assert_eq!(regs.get(0), 0);
    }

    #[test]
    fn test_write_only_and_read_only() {
        let mut regs = bank();
        regs.write_at(0xc, BusSize::Word, 0x41);
        assert_eq!(regs.get(TXB), 0x41);
        assert_eq!(regs.read_at(0xc, BusSize::Word), Some(0));

        let write = regs.write_at(0x14, BusSize::Word, 0).unwrap();
        assert_eq!(write.old, write.new);
        assert_eq!(regs.get(ID), 0x3208);
    }

    #[test]
    fn test_write_one_to_clear() {
        let mut regs = bank();
        regs.set(FLAGS, 0b1011);
        let write = regs.write_at(0x10, BusSize::Word, 0b0010).unwrap();
        assert_eq!(regs.get(FLAGS), 0b1001);
        assert_eq!(write.falling(), 0b0010);
        assert_eq!(write.rising(), 0);

        // Only the accessed lane counts.
        regs.set(FLAGS, 0x0101);
        regs.write_at(0x11, BusSize::Byte, 0xff);
        assert_eq!(regs.get(FLAGS), 0x0001);
    }

    #[test]
    fn test_unmapped_and_invalid() {
        let mut regs = bank();
        assert_eq!(regs.read_at(0xa, BusSize::HalfWord), None);
        assert_eq!(regs.read_at(0x18, BusSize::Word), None);
        assert_eq!(regs.write_at(0x40, BusSize::Byte, 1), None);
        assert_eq!(regs.read_at(0x0, BusSize::Invalid), None);
    }

    #[test]
    fn test_index_of_and_load() {
        let mut regs = bank();
        assert_eq!(regs.index_of("STATUS"), Some(STATUS));
        assert_eq!(regs.index_of("NOPE"), None);

        assert!(!regs.load(&[1, 2, 3]));
        assert_eq!(regs.get(CTRL), 0x100);
        assert!(regs.load(&[1, 2, 0x1_0003, 4, 5, 6]));
        assert_eq!(regs.values(), &[1, 2, 3, 4, 5, 6]);
    }
}
