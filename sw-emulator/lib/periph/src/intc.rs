/*++

Licensed under the Apache-2.0 license.

File Name:

    intc.rs

Abstract:

    File contains the interrupt controller that merges every peripheral's
    requests into the single line presented to the CPU core.

--*/

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tock_registers::interfaces::{ReadWriteable, Readable};
use tock_registers::register_bitfields;
use tock_registers::registers::InMemoryRegister;
use vr0_emu_bus::{Access, Bus, BusError, RegisterBank, RegisterDef};
use vr0_emu_types::{BusAddr, BusData, BusSize, IrqId};

use crate::helpers::decode_access;
use crate::PeriphError;

/// Interrupt source numbers. A lower number wins when several are pending.
pub mod irq_source {
    use vr0_emu_types::IrqId;

    pub const TIMER0: IrqId = 0;
    pub const TIMER1: IrqId = 1;
    pub const SOUND: IrqId = 2;
    pub const UART0: IrqId = 4;
    pub const UART1: IrqId = 5;
    pub const DMA0: IrqId = 7;
    pub const DMA1: IrqId = 8;
    pub const TIMER2: IrqId = 9;
    pub const TIMER3: IrqId = 10;
    pub const VBLANK: IrqId = 24;

    pub const TIMERS: [IrqId; 4] = [TIMER0, TIMER1, TIMER2, TIMER3];
    pub const UARTS: [IrqId; 2] = [UART0, UART1];
    pub const DMAS: [IrqId; 2] = [DMA0, DMA1];

    /// Number of distinct sources the controller tracks.
    pub const COUNT: IrqId = 32;
}

register_bitfields! [
    u32,

    /// Interrupt Vector Register
    IntVec [
        VECTOR OFFSET(0) NUMBITS(8) [],
        ACK_SOURCE OFFSET(0) NUMBITS(5) [],
        INT_HIGH OFFSET(8) NUMBITS(8) [],
    ],
];

const INTVEC: usize = 0;
const INTEN: usize = 1;
const INTST: usize = 2;

static INTC_REGS: [RegisterDef; 3] = [
    RegisterDef::new("INTVEC", 0x0, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("INTEN", 0x4, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("INTST", 0x8, BusSize::Word, 0, Access::WriteOneToClear),
];

/// Receives every change of the CPU interrupt line.
pub struct IrqLineCb(Box<dyn FnMut(bool)>);
impl IrqLineCb {
    pub fn new(f: impl FnMut(bool) + 'static) -> Self {
        Self(Box::new(f))
    }
}
impl Default for IrqLineCb {
    fn default() -> Self {
        Self(Box::new(|_| {}))
    }
}
impl std::fmt::Debug for IrqLineCb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IrqLineCb")
            .field(&"<unknown closure>")
            .finish()
    }
}
impl From<Box<dyn FnMut(bool) + 'static>> for IrqLineCb {
    fn from(value: Box<dyn FnMut(bool)>) -> Self {
        Self(value)
    }
}

/// Saved interrupt controller state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IntcSnapshot {
    pub regs: Vec<BusData>,
    pub line: bool,
}

struct IntcImpl {
    regs: RefCell<RegisterBank>,

    /// Last level handed to `line_cb`.
    line: Cell<bool>,

    line_cb: RefCell<IrqLineCb>,
}

impl IntcImpl {
    fn pending(&self) -> BusData {
        self.regs.borrow().get(INTST)
    }

    fn enabled(&self) -> BusData {
        self.regs.borrow().get(INTEN)
    }

    fn highest(&self) -> Option<IrqId> {
        let active = self.pending() & self.enabled();
        (active != 0).then(|| active.trailing_zeros() as IrqId)
    }

    fn post(&self, source: IrqId) {
        self.regs.borrow_mut().set_bits(INTST, source_bit(source));
        self.update_line();
    }

    fn clear(&self, source: IrqId) {
        self.regs.borrow_mut().clear_bits(INTST, source_bit(source));
        self.update_line();
    }

    /// Publishes the line level if it changed. No register borrow may be held
    /// here since the callback may look at the controller.
    fn update_line(&self) {
        let asserted = self.pending() & self.enabled() != 0;
        self.drive_line(asserted);
    }

    fn drive_line(&self, level: bool) {
        if self.line.get() == level {
            return;
        }
        self.line.set(level);
        log::trace!("intc: cpu interrupt line {}", if level { "asserted" } else { "deasserted" });
        (self.line_cb.borrow_mut().0)(level);
    }
}

fn source_bit(source: IrqId) -> BusData {
    1u32.checked_shl(u32::from(source)).unwrap_or(0)
}

/// Interrupt controller. Clones share the same state, so every peripheral
/// can hold an [`Irq`] into it while the bus owns the register view.
#[derive(Clone)]
pub struct Intc {
    inner: Rc<IntcImpl>,
}

impl Intc {
    pub fn new(line_cb: IrqLineCb) -> Self {
        Self {
            inner: Rc::new(IntcImpl {
                regs: RefCell::new(RegisterBank::new(&INTC_REGS)),
                line: Cell::new(false),
                line_cb: RefCell::new(line_cb),
            }),
        }
    }

    /// A handle a peripheral uses to post `source`.
    pub fn register_irq(&self, source: IrqId) -> Irq {
        assert!(source < irq_source::COUNT, "irq source {source} out of range");
        Irq {
            source,
            intc: Rc::clone(&self.inner),
        }
    }

    /// Latches `source` as pending. Latching happens whether or not the
    /// source is enabled; only the line depends on the enable mask.
    pub fn post(&self, source: IrqId) {
        self.inner.post(source)
    }

    pub fn clear(&self, source: IrqId) {
        self.inner.clear(source)
    }

    pub fn set_enable(&self, mask: BusData) {
        self.inner.regs.borrow_mut().set(INTEN, mask);
        self.inner.update_line();
    }

    pub fn pending(&self) -> BusData {
        self.inner.pending()
    }

    pub fn enabled(&self) -> BusData {
        self.inner.enabled()
    }

    /// Level of the CPU interrupt line.
    pub fn line(&self) -> bool {
        self.inner.line.get()
    }

    /// Source number plus one of the highest priority pending and enabled
    /// source, or 0 when there is none.
    pub fn vector(&self) -> u8 {
        self.inner.highest().map_or(0, |source| source + 1)
    }

    pub fn snapshot(&self) -> IntcSnapshot {
        IntcSnapshot {
            regs: self.inner.regs.borrow().values().to_vec(),
            line: self.inner.line.get(),
        }
    }

    pub fn restore(&self, snapshot: &IntcSnapshot) -> Result<(), PeriphError> {
        if !self.inner.regs.borrow_mut().load(&snapshot.regs) {
            return Err(PeriphError::SnapshotMismatch("intc registers"));
        }
        // The line follows the restored registers, not the saved level.
        self.inner.update_line();
        Ok(())
    }

    pub(crate) fn defs(&self) -> &'static [RegisterDef] {
        &INTC_REGS
    }

    fn read_vector(&self, stored: BusData) -> BusData {
        let reg = InMemoryRegister::<u32, IntVec::Register>::new(stored);
        reg.modify(IntVec::VECTOR.val(u32::from(self.vector())));
        reg.get()
    }
}

impl Bus for Intc {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        let mut regs = self.inner.regs.borrow_mut();
        let Some(access) = decode_access(&regs, "intc", addr, size) else {
            return Ok(0);
        };
        if access.index == INTVEC {
            let stored = regs.get(INTVEC);
            drop(regs);
            return Ok(access.extract(self.read_vector(stored)));
        }
        Ok(regs.read(&access))
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        let mut regs = self.inner.regs.borrow_mut();
        let Some(access) = decode_access(&regs, "intc", addr, size) else {
            return Ok(());
        };
        match access.index {
            INTVEC => {
                let placed = InMemoryRegister::<u32, IntVec::Register>::new(access.place(val));
                let write = regs.write(&access, val);
                let keep = IntVec::INT_HIGH.mask << IntVec::INT_HIGH.shift;
                regs.set(INTVEC, write.new & keep);
                drop(regs);
                if access.touches(IntVec::VECTOR.mask) {
                    let source = placed.read(IntVec::ACK_SOURCE) as IrqId;
                    log::trace!("intc: acknowledge source {source}");
                    self.inner.clear(source);
                }
            }
            _ => {
                regs.write(&access, val);
                drop(regs);
                self.inner.update_line();
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.inner.regs.borrow_mut().reset();
        self.inner.update_line();
    }
}

/// Posting handle for one interrupt source.
#[derive(Clone)]
pub struct Irq {
    source: IrqId,
    intc: Rc<IntcImpl>,
}

impl Irq {
    pub fn source(&self) -> IrqId {
        self.source
    }

    pub fn post(&self) {
        self.intc.post(self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vr0_emu_bus::testing::Log;

    fn intc_with_log() -> (Intc, Log) {
        let log = Log::new();
        let cb_log = log.clone();
        let intc = Intc::new(IrqLineCb::new(move |level| {
            cb_log.line(format_args!("line({level})"))
        }));
        (intc, log)
    }

    #[test]
    fn test_pending_latches_without_enable() {
        let (intc, log) = intc_with_log();
        let timer1 = intc.register_irq(irq_source::TIMER1);
        timer1.post();
        assert_eq!(intc.pending(), 1 << 1);
        assert!(!intc.line());
        assert_eq!(intc.vector(), 0);
        assert_eq!(log.take(), "");

        intc.set_enable(1 << 1);
        assert!(intc.line());
        assert_eq!(intc.vector(), 2);
        assert_eq!(log.take(), "line(true)\n");
    }

    #[test]
    fn test_priority() {
        let (intc, _log) = intc_with_log();
        intc.set_enable(0xffff_ffff);
        intc.post(irq_source::VBLANK);
        intc.post(irq_source::DMA0);
        intc.post(irq_source::UART1);
        assert_eq!(intc.vector(), irq_source::UART1 + 1);
        intc.clear(irq_source::UART1);
        assert_eq!(intc.vector(), irq_source::DMA0 + 1);
        intc.clear(irq_source::DMA0);
        assert_eq!(intc.vector(), irq_source::VBLANK + 1);
    }

    #[test]
    fn test_line_changes_reported_once() {
        let (mut intc, log) = intc_with_log();
        intc.set_enable(0x3);
        intc.post(0);
        intc.post(1);
        intc.post(0);
        assert_eq!(log.take(), "line(true)\n");

        // Write-one-to-clear of source 0 leaves source 1 asserting the line.
        intc.write(BusSize::Word, 0x8, 0x1).unwrap();
        assert_eq!(intc.pending(), 0x2);
        assert_eq!(log.take(), "");

        // Masking the remaining source drops the line immediately.
        intc.write(BusSize::Word, 0x4, 0x1).unwrap();
        assert!(!intc.line());
        assert_eq!(log.take(), "line(false)\n");
        assert_eq!(intc.pending(), 0x2);
    }

    #[test]
    fn test_intvec_register() {
        let (mut intc, _log) = intc_with_log();
        intc.write(BusSize::Word, 0x4, 0xffff_ffff).unwrap();
        intc.post(irq_source::TIMER3);
        intc.post(irq_source::VBLANK);
        assert_eq!(intc.read(BusSize::Word, 0x0), Ok(11));

        intc.write(BusSize::Byte, 0x1, 0x5a).unwrap();
        assert_eq!(intc.read(BusSize::Word, 0x0), Ok(0x5a0b));
        assert_eq!(intc.read(BusSize::Byte, 0x1), Ok(0x5a));

        // Acknowledging through the low lane clears that source only.
        intc.write(BusSize::Byte, 0x0, u32::from(irq_source::TIMER3)).unwrap();
        assert_eq!(intc.read(BusSize::Word, 0x0), Ok(0x5a19));
        intc.write(BusSize::Word, 0x0, 0x5a00 | u32::from(irq_source::VBLANK))
            .unwrap();
        assert_eq!(intc.read(BusSize::Word, 0x0), Ok(0x5a00));
        assert_eq!(intc.pending(), 0);
    }

    #[test]
    fn test_unmapped_offsets() {
        let (mut intc, _log) = intc_with_log();
        assert_eq!(intc.read(BusSize::Word, 0xc), Ok(0));
        assert_eq!(intc.write(BusSize::Word, 0x10, 0xffff_ffff), Ok(()));
    }

    #[test]
    fn test_reset_deasserts() {
        let (mut intc, log) = intc_with_log();
        intc.set_enable(1);
        intc.post(0);
        assert_eq!(log.take(), "line(true)\n");
        intc.reset();
        assert_eq!(intc.pending(), 0);
        assert_eq!(intc.enabled(), 0);
        assert_eq!(log.take(), "line(false)\n");
    }

    #[test]
    fn test_snapshot_restore() {
        let (intc, _log) = intc_with_log();
        intc.set_enable(0x10);
        intc.post(irq_source::UART0);
        let snapshot = intc.snapshot();
        assert!(snapshot.line);

        let (other, other_log) = intc_with_log();
        other.restore(&snapshot).unwrap();
        assert_eq!(other.vector(), irq_source::UART0 + 1);
        assert_eq!(other_log.take(), "line(true)\n");

        let bad = IntcSnapshot {
            regs: vec![0],
            line: false,
        };
        assert_eq!(
            other.restore(&bad),
            Err(PeriphError::SnapshotMismatch("intc registers"))
        );
    }

    #[test]
    fn test_restore_line_follows_registers() {
        // A saved level that disagrees with pending & enable is ignored.
        let snapshot = IntcSnapshot {
            regs: vec![0, 0, 1 << irq_source::UART0],
            line: true,
        };
        let (intc, log) = intc_with_log();
        intc.restore(&snapshot).unwrap();
        assert!(!intc.line());
        assert_eq!(log.take(), "");

        intc.set_enable(1 << irq_source::UART0);
        assert_eq!(log.take(), "line(true)\n");
        let snapshot = IntcSnapshot {
            regs: vec![0, 1 << irq_source::UART0, 1 << irq_source::UART0],
            line: false,
        };
        intc.restore(&snapshot).unwrap();
        assert!(intc.line());
        assert_eq!(log.take(), "");
    }
}
