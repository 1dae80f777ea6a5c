/*++

Licensed under the Apache-2.0 license.

File Name:

    dma.rs

Abstract:

    File contains the two-channel DMA controller. Channels copy blocks of
    bytes, halfwords or words across the host address space, either in one
    go or one unit at a time as the clock advances.

--*/

use serde::{Deserialize, Serialize};
use tock_registers::interfaces::Readable;
use tock_registers::register_bitfields;
use tock_registers::registers::InMemoryRegister;
use vr0_emu_bus::{Access, ActionHandle, Bus, BusError, Clock, RegisterBank, RegisterDef, Timer};
use vr0_emu_types::{BusAddr, BusData, BusSize};

use crate::helpers::decode_access;
use crate::intc::Irq;
use crate::PeriphError;

register_bitfields! [
    u32,

    /// DMA Control Register
    DmaCtrl [
        WIDTH OFFSET(0) NUMBITS(2) [
            Byte = 0b00,
            HalfWord = 0b01,
            Word = 0b10,
            Word1 = 0b11,
        ],
        HOLD_SRC OFFSET(4) NUMBITS(1) [],
        HOLD_DST OFFSET(6) NUMBITS(1) [],
        START OFFSET(10) NUMBITS(1) [],
        ERROR OFFSET(15) NUMBITS(1) [],
    ],
];

const DMASA: usize = 0;
const DMADA: usize = 1;
const DMATC: usize = 2;
const DMAC: usize = 3;

static DMA_REGS: [RegisterDef; 4] = [
    RegisterDef::new("DMASA", 0x0, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("DMADA", 0x4, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("DMATC", 0x8, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("DMAC", 0xc, BusSize::Word, 0, Access::ReadWrite),
];

/// Bytes of window each channel occupies.
pub const DMA_STRIDE: BusAddr = 0x10;

pub const DMA_CHANNELS: usize = 2;

const START: BusData = 1 << 10;
const ERROR: BusData = 1 << 15;

/// Progress of a transfer in flight. Addresses and the remaining count live
/// in the channel registers.
struct Transfer {
    unit: BusSize,
    src_step: u32,
    dst_step: u32,
    total: u32,
    moved: u32,
    started_at: u64,
    done: Option<ActionHandle>,
}

/// Saved progress of a transfer in flight.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub total: u32,
    pub moved: u32,

    /// Cycles since the transfer started.
    pub elapsed: u64,
}

/// Saved DMA channel state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DmaSnapshot {
    pub regs: Vec<BusData>,
    pub transfer: Option<TransferSnapshot>,
}

pub struct DmaChannel {
    channel: usize,
    regs: RegisterBank,
    timer: Timer,
    irq: Irq,

    /// Cycles each unit takes. 0 moves the whole block when it starts.
    cycles_per_unit: u64,

    transfer: Option<Transfer>,
}

impl DmaChannel {
    fn new(channel: usize, clock: &Clock, irq: Irq, cycles_per_unit: u64) -> Self {
        Self {
            channel,
            regs: RegisterBank::new(&DMA_REGS),
            timer: clock.timer(),
            irq,
            cycles_per_unit,
            transfer: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.transfer.is_some()
    }

    fn control(&self) -> InMemoryRegister<u32, DmaCtrl::Register> {
        InMemoryRegister::new(self.regs.get(DMAC))
    }

    fn busy_error(&self) -> PeriphError {
        PeriphError::InvalidState(match self.channel {
            0 => "dma0 transfer in progress",
            _ => "dma1 transfer in progress",
        })
    }

    fn start(
        &mut self,
        mem: &mut dyn Bus,
        src: BusAddr,
        dst: BusAddr,
        count: u32,
        control: BusData,
    ) -> Result<(), PeriphError> {
        self.catch_up(mem);
        if self.is_active() {
            return Err(self.busy_error());
        }
        self.regs.set(DMASA, src);
        self.regs.set(DMADA, dst);
        self.regs.set(DMATC, count);
        self.regs.set(DMAC, (control | START) & !ERROR);
        self.begin(mem);
        Ok(())
    }

    /// Starts the transfer DMASA, DMADA, DMATC and DMAC describe.
    fn begin(&mut self, mem: &mut dyn Bus) {
        let control = self.control();
        let unit = match control.read(DmaCtrl::WIDTH) {
            0 => BusSize::Byte,
            1 => BusSize::HalfWord,
            _ => BusSize::Word,
        };
        let step = |hold| if control.is_set(hold) { 0 } else { unit.bytes() };
        let total = self.regs.get(DMATC);
        log::debug!(
            "dma{}: {total} x {unit} from {:#010x} to {:#010x}",
            self.channel,
            self.regs.get(DMASA),
            self.regs.get(DMADA)
        );
        let done = (self.cycles_per_unit != 0 && total != 0).then(|| {
            self.timer
                .schedule_poll_in(u64::from(total).saturating_mul(self.cycles_per_unit))
        });
        let atomic = done.is_none();
        self.transfer = Some(Transfer {
            unit,
            src_step: step(DmaCtrl::HOLD_SRC),
            dst_step: step(DmaCtrl::HOLD_DST),
            total,
            moved: 0,
            started_at: self.timer.now(),
            done,
        });
        if atomic {
            self.advance(mem, total);
        }
    }

    /// Moves units until `target` have been moved in total, finishing the
    /// transfer once every unit is done or a bus access fails.
    fn advance(&mut self, mem: &mut dyn Bus, target: u32) {
        let Some(transfer) = &mut self.transfer else {
            return;
        };
        while transfer.moved < target.min(transfer.total) {
            let src = self.regs.get(DMASA);
            let dst = self.regs.get(DMADA);
            let moved = mem
                .read(transfer.unit, src)
                .and_then(|val| mem.write(transfer.unit, dst, val));
            if let Err(err) = moved {
                log::warn!("dma{}: {err:?} at {src:#010x} -> {dst:#010x}", self.channel);
                self.finish(true);
                return;
            }
            self.regs.set(DMASA, src.wrapping_add(transfer.src_step));
            self.regs.set(DMADA, dst.wrapping_add(transfer.dst_step));
            self.regs.set(DMATC, self.regs.get(DMATC).wrapping_sub(1));
            transfer.moved += 1;
        }
        if transfer.moved == transfer.total {
            self.finish(false);
        }
    }

    /// Brings an incremental transfer up to date with the clock.
    fn catch_up(&mut self, mem: &mut dyn Bus) {
        if self.cycles_per_unit == 0 {
            return;
        }
        let Some(transfer) = &self.transfer else {
            return;
        };
        let elapsed = self.timer.now().wrapping_sub(transfer.started_at);
        let due = elapsed / self.cycles_per_unit;
        let target = u32::try_from(due).unwrap_or(u32::MAX);
        self.advance(mem, target);
    }

    fn finish(&mut self, error: bool) {
        if let Some(done) = self.transfer.take().and_then(|t| t.done) {
            self.timer.cancel(done);
        }
        self.regs.clear_bits(DMAC, START);
        if error {
            self.regs.set_bits(DMAC, ERROR);
        } else {
            self.regs.set(DMATC, 0);
        }
        log::trace!("dma{}: done{}", self.channel, if error { " with error" } else { "" });
        self.irq.post();
    }

    fn read(&mut self, mem: &mut dyn Bus, size: BusSize, addr: BusAddr) -> BusData {
        self.catch_up(mem);
        match decode_access(&self.regs, "dma", addr, size) {
            Some(access) => self.regs.read(&access),
            None => 0,
        }
    }

    fn write(&mut self, mem: &mut dyn Bus, size: BusSize, addr: BusAddr, val: BusData) {
        self.catch_up(mem);
        let Some(access) = decode_access(&self.regs, "dma", addr, size) else {
            return;
        };
        if self.is_active() {
            log::warn!("dma{}: {}, write to {:#x} ignored", self.channel, self.busy_error(), addr);
            return;
        }
        let write = self.regs.write(&access, val);
        if write.index != DMAC {
            return;
        }
        // ERROR only changes when a transfer starts or fails.
        let kept = (write.new & !ERROR) | (write.old & ERROR);
        self.regs.set(DMAC, kept);
        if write.rising() & START != 0 {
            self.regs.clear_bits(DMAC, ERROR);
            self.begin(mem);
        }
    }

    fn poll(&mut self, mem: &mut dyn Bus) {
        let Some(transfer) = &mut self.transfer else {
            return;
        };
        if self.timer.fired(&mut transfer.done) {
            self.catch_up(mem);
        }
    }

    fn reset(&mut self) {
        if let Some(done) = self.transfer.take().and_then(|t| t.done) {
            self.timer.cancel(done);
        }
        self.regs.reset();
    }

    fn snapshot(&self) -> DmaSnapshot {
        DmaSnapshot {
            regs: self.regs.values().to_vec(),
            transfer: self.transfer.as_ref().map(|t| TransferSnapshot {
                total: t.total,
                moved: t.moved,
                elapsed: self.timer.now().wrapping_sub(t.started_at),
            }),
        }
    }

    fn restore(&mut self, snapshot: &DmaSnapshot) -> Result<(), PeriphError> {
        if snapshot.regs.len() != DMA_REGS.len() {
            return Err(PeriphError::SnapshotMismatch("dma registers"));
        }
        if snapshot.transfer.is_some() && self.cycles_per_unit == 0 {
            return Err(PeriphError::SnapshotMismatch("dma transfer timing"));
        }
        self.reset();
        self.regs.load(&snapshot.regs);
        let Some(saved) = &snapshot.transfer else {
            return Ok(());
        };
        let control = self.control();
        let unit = match control.read(DmaCtrl::WIDTH) {
            0 => BusSize::Byte,
            1 => BusSize::HalfWord,
            _ => BusSize::Word,
        };
        let step = |hold| if control.is_set(hold) { 0 } else { unit.bytes() };
        let duration = u64::from(saved.total).saturating_mul(self.cycles_per_unit);
        self.transfer = Some(Transfer {
            unit,
            src_step: step(DmaCtrl::HOLD_SRC),
            dst_step: step(DmaCtrl::HOLD_DST),
            total: saved.total,
            moved: saved.moved,
            started_at: self.timer.now().wrapping_sub(saved.elapsed),
            done: Some(
                self.timer
                    .schedule_poll_in(duration.saturating_sub(saved.elapsed)),
            ),
        });
        Ok(())
    }
}

/// DMA controller: both channels plus the address space they move data in.
pub struct Dma {
    channels: [DmaChannel; DMA_CHANNELS],
    mem: Box<dyn Bus>,
}

impl Dma {
    pub fn new(clock: &Clock, mem: Box<dyn Bus>, irqs: [Irq; DMA_CHANNELS], cycles_per_unit: u64) -> Self {
        let [irq0, irq1] = irqs;
        Self {
            channels: [
                DmaChannel::new(0, clock, irq0, cycles_per_unit),
                DmaChannel::new(1, clock, irq1, cycles_per_unit),
            ],
            mem,
        }
    }

    /// Starts a transfer of `count` units on `channel`, as if firmware had
    /// programmed the registers and set DMAC.START.
    pub fn start(
        &mut self,
        channel: usize,
        src: BusAddr,
        dst: BusAddr,
        count: u32,
        control: BusData,
    ) -> Result<(), PeriphError> {
        let ch = self
            .channels
            .get_mut(channel)
            .ok_or(PeriphError::InvalidState("no such dma channel"))?;
        ch.start(self.mem.as_mut(), src, dst, count, control)
    }

    pub fn is_active(&self, channel: usize) -> bool {
        self.channels.get(channel).is_some_and(DmaChannel::is_active)
    }

    pub(crate) fn defs(&self) -> &'static [RegisterDef] {
        &DMA_REGS
    }

    pub fn snapshot(&self) -> Vec<DmaSnapshot> {
        self.channels.iter().map(DmaChannel::snapshot).collect()
    }

    pub fn restore(&mut self, snapshots: &[DmaSnapshot]) -> Result<(), PeriphError> {
        if snapshots.len() != DMA_CHANNELS {
            return Err(PeriphError::SnapshotMismatch("dma channel count"));
        }
        for (channel, snapshot) in self.channels.iter_mut().zip(snapshots) {
            channel.restore(snapshot)?;
        }
        Ok(())
    }

    fn route(addr: BusAddr) -> Option<(usize, BusAddr)> {
        let channel = (addr / DMA_STRIDE) as usize;
        (channel < DMA_CHANNELS).then_some((channel, addr % DMA_STRIDE))
    }
}

impl Bus for Dma {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        let Some((channel, offset)) = Self::route(addr) else {
            log::debug!("dma: no register at offset {addr:#x}");
            return Ok(0);
        };
        Ok(self.channels[channel].read(self.mem.as_mut(), size, offset))
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        let Some((channel, offset)) = Self::route(addr) else {
            log::debug!("dma: no register at offset {addr:#x}");
            return Ok(());
        };
        self.channels[channel].write(self.mem.as_mut(), size, offset, val);
        Ok(())
    }

    fn poll(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.poll(self.mem.as_mut());
        }
    }

    fn reset(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intc::{Intc, IrqLineCb};
    use std::cell::RefCell;
    use std::rc::Rc;
    use vr0_emu_bus::Ram;

    const SA: BusAddr = 0x0;
    const DA: BusAddr = 0x4;
    const TC: BusAddr = 0x8;
    const CTRL: BusAddr = 0xc;

    const WORD: BusData = 0b10;
    const HALF: BusData = 0b01;
    const HOLD_SRC: BusData = 1 << 4;

    struct Setup {
        clock: Clock,
        intc: Intc,
        ram: Rc<RefCell<Ram>>,
        dma: Dma,
    }

    fn setup(cycles_per_unit: u64) -> Setup {
        let clock = Clock::new();
        let intc = Intc::new(IrqLineCb::default());
        let ram = Rc::new(RefCell::new(Ram::new((0..=255).collect())));
        let dma = Dma::new(
            &clock,
            Box::new(ram.clone()),
            [intc.register_irq(7), intc.register_irq(8)],
            cycles_per_unit,
        );
        Setup {
            clock,
            intc,
            ram,
            dma,
        }
    }

    #[test]
    fn test_atomic_word_copy() {
        let mut s = setup(0);
        s.dma.write(BusSize::Word, SA, 0x00).unwrap();
        s.dma.write(BusSize::Word, DA, 0x80).unwrap();
        s.dma.write(BusSize::Word, TC, 2).unwrap();
        s.dma.write(BusSize::Word, CTRL, START | WORD).unwrap();

        assert!(!s.dma.is_active(0));
        assert_eq!(&s.ram.borrow().data()[0x80..0x88], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(s.intc.pending(), 1 << 7);
        assert_eq!(s.dma.read(BusSize::Word, SA), Ok(0x08));
        assert_eq!(s.dma.read(BusSize::Word, DA), Ok(0x88));
        assert_eq!(s.dma.read(BusSize::Word, TC), Ok(0));
        assert_eq!(s.dma.read(BusSize::Word, CTRL), Ok(WORD));
    }

    #[test]
    fn test_hold_source_fills() {
        let mut s = setup(0);
        s.dma
            .start(1, 0x10, 0x40, 4, HALF | HOLD_SRC)
            .unwrap();
        assert_eq!(
            &s.ram.borrow().data()[0x40..0x48],
            &[0x10, 0x11, 0x10, 0x11, 0x10, 0x11, 0x10, 0x11]
        );
        assert_eq!(s.intc.pending(), 1 << 8);
        assert_eq!(s.dma.read(BusSize::Word, DMA_STRIDE + SA), Ok(0x10));
    }

    #[test]
    fn test_zero_count_completes_at_once() {
        let mut s = setup(4);
        s.dma.start(0, 0, 0x80, 0, WORD).unwrap();
        assert!(!s.dma.is_active(0));
        assert_eq!(s.intc.pending(), 1 << 7);
        assert_eq!(s.clock.next_deadline(), None);
    }

    #[test]
    fn test_incremental_transfer() {
        let mut s = setup(4);
        s.dma.start(0, 0x00, 0x80, 4, 0).unwrap();
        assert!(s.dma.is_active(0));
        assert_eq!(s.clock.next_deadline(), Some(16));

        s.clock.increment(9);
        // Reading brings the channel up to date.
        assert_eq!(s.dma.read(BusSize::Word, TC), Ok(2));
        assert_eq!(&s.ram.borrow().data()[0x80..0x84], &[0, 1, 0x82, 0x83]);
        assert_eq!(s.intc.pending(), 0);

        s.clock.increment_and_process_timer_actions(7, &mut s.dma);
        assert!(!s.dma.is_active(0));
        assert_eq!(&s.ram.borrow().data()[0x80..0x84], &[0, 1, 2, 3]);
        assert_eq!(s.intc.pending(), 1 << 7);
    }

    #[test]
    fn test_start_while_active() {
        let mut s = setup(10);
        s.dma.start(0, 0x00, 0x80, 8, 0).unwrap();
        s.clock.increment(35);
        assert_eq!(
            s.dma.start(0, 0x20, 0xa0, 2, 0),
            Err(PeriphError::InvalidState("dma0 transfer in progress"))
        );
        assert_eq!(s.dma.read(BusSize::Word, SA), Ok(0x03));
        assert_eq!(s.dma.read(BusSize::Word, TC), Ok(5));

        // Register writes are ignored too, including a second START.
        s.dma.write(BusSize::Word, SA, 0x40).unwrap();
        s.dma.write(BusSize::Word, CTRL, START | WORD).unwrap();
        assert_eq!(s.dma.read(BusSize::Word, SA), Ok(0x03));
        assert_eq!(s.dma.read(BusSize::Word, CTRL), Ok(START));

        // The other channel is independent.
        s.dma.start(1, 0x20, 0xa0, 1, 0).unwrap();
        assert!(s.dma.is_active(1));

        s.clock.increment_and_process_timer_actions(45, &mut s.dma);
        assert!(!s.dma.is_active(0));
        assert_eq!(&s.ram.borrow().data()[0x80..0x88], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(s.ram.borrow().data()[0xa0], 0x20);
    }

    #[test]
    fn test_bus_fault_sets_error() {
        let mut s = setup(0);
        s.dma.start(0, 0xf8, 0x10, 4, WORD).unwrap();
        assert!(!s.dma.is_active(0));
        assert_eq!(s.intc.pending(), 1 << 7);
        let ctrl = s.dma.read(BusSize::Word, CTRL).unwrap();
        assert_eq!(ctrl & (START | ERROR), ERROR);
        // Two units moved before the fault.
        assert_eq!(s.dma.read(BusSize::Word, TC), Ok(2));
        assert_eq!(s.dma.read(BusSize::Word, SA), Ok(0x100));

        // Software cannot clear ERROR; a new start does.
        s.dma.write(BusSize::Word, CTRL, 0).unwrap();
        assert_eq!(s.dma.read(BusSize::Word, CTRL), Ok(ERROR));
        s.dma.start(0, 0, 0x10, 1, WORD).unwrap();
        assert_eq!(s.dma.read(BusSize::Word, CTRL), Ok(WORD));
    }

    #[test]
    fn test_unmapped() {
        let mut s = setup(0);
        assert_eq!(s.dma.read(BusSize::Word, 0x20), Ok(0));
        assert_eq!(s.dma.write(BusSize::Word, 0x24, 1), Ok(()));
        assert_eq!(
            s.dma.start(2, 0, 0, 1, 0),
            Err(PeriphError::InvalidState("no such dma channel"))
        );
    }

    #[test]
    fn test_snapshot_restore() {
        let mut s = setup(4);
        s.dma.start(0, 0x00, 0x80, 4, 0).unwrap();
        s.clock.increment(6);
        let snapshot = s.dma.snapshot();
        assert_eq!(
            snapshot[0].transfer,
            Some(TransferSnapshot {
                total: 4,
                moved: 0,
                elapsed: 6
            })
        );

        let mut other = setup(4);
        other.dma.restore(&snapshot).unwrap();
        assert!(other.dma.is_active(0));
        assert_eq!(other.dma.read(BusSize::Word, TC), Ok(3));
        other.clock.increment_and_process_timer_actions(10, &mut other.dma);
        assert!(!other.dma.is_active(0));
        assert_eq!(&other.ram.borrow().data()[0x80..0x84], &[0, 1, 2, 3]);

        let mut atomic = setup(0);
        assert_eq!(
            atomic.dma.restore(&snapshot),
            Err(PeriphError::SnapshotMismatch("dma transfer timing"))
        );
    }
}
