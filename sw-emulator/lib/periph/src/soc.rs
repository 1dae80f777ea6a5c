/*++

Licensed under the Apache-2.0 license.

File Name:

    soc.rs

Abstract:

    File contains the VRender0 peripheral block: identification registers,
    interrupt controller, timers, UARTs and DMA behind one bus window.

--*/

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use vr0_emu_bus::{Access, Bus, BusError, Clock, Ram, RegisterBank, RegisterDef};
use vr0_emu_types::{BusAddr, BusData, BusSize, IrqId};

use crate::dma::{Dma, DmaSnapshot, DMA_CHANNELS, DMA_STRIDE};
use crate::helpers::{decode_access, not_before};
use crate::intc::{irq_source, Intc, IntcSnapshot, IrqLineCb};
use crate::timer::{TimerChannel, TimerSnapshot, TIMER_STRIDE};
use crate::uart::{Uart, UartSnapshot, UartTxCb, UART_FIFO_DEPTH, UART_STRIDE};
use crate::PeriphError;

/// Size of the bus window the block decodes.
pub const SOC_WINDOW: BusAddr = 0x2000;

pub const SOC_TIMERS: usize = 4;
pub const SOC_UARTS: usize = 2;

/// SYSID value of a VRender0 with no board-specific override.
pub const DEFAULT_SYSID: BusData = 0x0087_9598;

const MISC_BASE: BusAddr = 0x0000;
const MISC_END: BusAddr = MISC_BASE + 0x8 - 1;
const INTC_BASE: BusAddr = 0x0800;
const INTC_END: BusAddr = INTC_BASE + 0xc - 1;
const DMA_BASE: BusAddr = 0x1000;
const DMA_END: BusAddr = DMA_BASE + DMA_STRIDE * DMA_CHANNELS as BusAddr - 1;
const TIMER_BASE: BusAddr = 0x1400;
const TIMER_END: BusAddr = TIMER_BASE + TIMER_STRIDE * SOC_TIMERS as BusAddr - 1;
const UART_BASE: BusAddr = 0x1800;
const UART_END: BusAddr = UART_BASE + UART_STRIDE * SOC_UARTS as BusAddr - 1;

const SYSID: usize = 0;
const CFGR: usize = 1;

static MISC_REGS: [RegisterDef; 2] = [
    RegisterDef::new("SYSID", 0x0, BusSize::Word, DEFAULT_SYSID, Access::ReadOnly),
    RegisterDef::new("CFGR", 0x4, BusSize::Word, 0, Access::ReadOnly),
];

pub struct SocArgs {
    pub clock: Rc<Clock>,

    /// SYSID power-on value.
    pub sysid: BusData,

    /// CFGR power-on value (board strapping).
    pub cfgr: BusData,

    pub uart_fifo_depth: usize,

    /// Cycles per DMA unit; 0 moves a whole block inside the starting write.
    pub dma_cycles_per_unit: u64,

    pub irq_line_cb: IrqLineCb,
    pub uart_tx_cb: [UartTxCb; SOC_UARTS],

    /// Host address space the DMA channels read and write.
    pub dma_bus: Box<dyn Bus>,
}
impl Default for SocArgs {
    fn default() -> Self {
        Self {
            clock: Rc::new(Clock::new()),
            sysid: DEFAULT_SYSID,
            cfgr: 0,
            uart_fifo_depth: UART_FIFO_DEPTH,
            dma_cycles_per_unit: 0,
            irq_line_cb: IrqLineCb::default(),
            uart_tx_cb: Default::default(),
            dma_bus: Box::new(Ram::zeroed(0)),
        }
    }
}

/// Saved state of the whole block, sub-devices in a fixed order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SocSnapshot {
    pub misc: Vec<BusData>,
    pub intc: IntcSnapshot,
    pub timers: Vec<TimerSnapshot>,
    pub uarts: Vec<UartSnapshot>,
    pub dma: Vec<DmaSnapshot>,
}

/// One register as seen from the block's bus window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterInfo {
    pub addr: BusAddr,
    pub name: &'static str,
    pub size: BusSize,
    pub reset: BusData,
    pub access: Access,
}

enum Block {
    Misc,
    Intc,
    Dma,
    Timer(usize),
    Uart(usize),
}

/// The peripheral block. Hosts map it at its base address and forward bus
/// accesses with window-relative addresses.
pub struct Vr0Soc {
    clock: Rc<Clock>,
    misc: RegisterBank,
    intc: Intc,
    timers: [TimerChannel; SOC_TIMERS],
    uarts: [Uart; SOC_UARTS],
    dma: Dma,
}

impl Vr0Soc {
    pub fn new(args: SocArgs) -> Self {
        let clock = args.clock;
        let intc = Intc::new(args.irq_line_cb);
        let timers = std::array::from_fn(|i| {
            TimerChannel::new(i, &clock, intc.register_irq(irq_source::TIMERS[i]))
        });
        let [tx0, tx1] = args.uart_tx_cb;
        let uarts = [
            Uart::new(0, &clock, intc.register_irq(irq_source::UART0), args.uart_fifo_depth, tx0),
            Uart::new(1, &clock, intc.register_irq(irq_source::UART1), args.uart_fifo_depth, tx1),
        ];
        let dma = Dma::new(
            &clock,
            args.dma_bus,
            irq_source::DMAS.map(|source| intc.register_irq(source)),
            args.dma_cycles_per_unit,
        );
        Self {
            misc: RegisterBank::new(&MISC_REGS)
                .with_reset(SYSID, args.sysid)
                .with_reset(CFGR, args.cfgr),
            clock,
            intc,
            timers,
            uarts,
            dma,
        }
    }

    pub fn clock(&self) -> &Rc<Clock> {
        &self.clock
    }

    /// Advances the clock by `cycles`, stopping at every deadline on the way
    /// so each one is handled at its own cycle. Returns whether anything
    /// came due.
    pub fn advance(&mut self, cycles: u64) -> bool {
        let clock = Rc::clone(&self.clock);
        let end = clock.now().wrapping_add(cycles);
        let mut polled = false;
        loop {
            let now = clock.now();
            let left = end.wrapping_sub(now);
            let step = clock
                .next_deadline()
                .map_or(left, |deadline| not_before(deadline, now).wrapping_sub(now).min(left));
            polled |= clock.increment_and_process_timer_actions(step, self);
            if clock.now() == end {
                return polled;
            }
        }
    }

    /// Posts `source`, for companion blocks such as sound and video that live
    /// outside this block but share its controller.
    pub fn raise_irq(&self, source: IrqId) {
        self.intc.post(source)
    }

    /// Level of the CPU interrupt line.
    pub fn is_interrupt_pending(&self) -> bool {
        self.intc.line()
    }

    /// Vector the CPU fetches on interrupt acknowledge: highest priority
    /// source + 1, or 0.
    pub fn irq_vector(&self) -> u8 {
        self.intc.vector()
    }

    pub fn intc(&self) -> &Intc {
        &self.intc
    }

    pub fn timer(&self, index: usize) -> Option<&TimerChannel> {
        self.timers.get(index)
    }

    pub fn uart(&self, port: usize) -> Option<&Uart> {
        self.uarts.get(port)
    }

    fn uart_mut(&mut self, port: usize) -> Result<&mut Uart, PeriphError> {
        self.uarts
            .get_mut(port)
            .ok_or(PeriphError::InvalidState("no such uart"))
    }

    /// A byte arriving on the receive line of `port`.
    pub fn receive(&mut self, port: usize, byte: u8) -> Result<(), PeriphError> {
        self.uart_mut(port)?.receive(byte);
        Ok(())
    }

    pub fn set_rx_line(&mut self, port: usize, high: bool) -> Result<(), PeriphError> {
        self.uart_mut(port)?.set_rx_line(high);
        Ok(())
    }

    /// Starts a DMA transfer on behalf of the host.
    pub fn dma_start(
        &mut self,
        channel: usize,
        src: BusAddr,
        dst: BusAddr,
        count: u32,
        control: BusData,
    ) -> Result<(), PeriphError> {
        self.dma.start(channel, src, dst, count, control)
    }

    pub fn dma_active(&self, channel: usize) -> bool {
        self.dma.is_active(channel)
    }

    /// Every register in the window with its power-on value.
    pub fn register_map(&self) -> Vec<RegisterInfo> {
        let mut map = vec![];
        let mut add = |base: BusAddr, defs: &'static [RegisterDef]| {
            map.extend(defs.iter().map(|d| RegisterInfo {
                addr: base + d.offset,
                name: d.name,
                size: d.size,
                reset: d.reset,
                access: d.access,
            }))
        };
        add(MISC_BASE, &MISC_REGS);
        add(INTC_BASE, self.intc.defs());
        for channel in 0..DMA_CHANNELS {
            add(DMA_BASE + DMA_STRIDE * channel as BusAddr, self.dma.defs());
        }
        for (i, timer) in self.timers.iter().enumerate() {
            add(TIMER_BASE + TIMER_STRIDE * i as BusAddr, timer.defs());
        }
        for (i, uart) in self.uarts.iter().enumerate() {
            add(UART_BASE + UART_STRIDE * i as BusAddr, uart.defs());
        }
        map[SYSID].reset = self.misc.reset_value(SYSID);
        map[CFGR].reset = self.misc.reset_value(CFGR);
        map
    }

    pub fn snapshot(&self) -> SocSnapshot {
        SocSnapshot {
            misc: self.misc.values().to_vec(),
            intc: self.intc.snapshot(),
            timers: self.timers.iter().map(TimerChannel::snapshot).collect(),
            uarts: self.uarts.iter().map(Uart::snapshot).collect(),
            dma: self.dma.snapshot(),
        }
    }

    /// Replaces the block's state with `snapshot`. Pending deadlines are
    /// rescheduled relative to this block's clock. The shape of the snapshot
    /// is checked before anything changes; a sub-device that still rejects
    /// its part leaves the block partially restored.
    pub fn restore(&mut self, snapshot: &SocSnapshot) -> Result<(), PeriphError> {
        if snapshot.misc.len() != MISC_REGS.len() {
            return Err(PeriphError::SnapshotMismatch("misc registers"));
        }
        if snapshot.timers.len() != SOC_TIMERS {
            return Err(PeriphError::SnapshotMismatch("timer count"));
        }
        if snapshot.uarts.len() != SOC_UARTS {
            return Err(PeriphError::SnapshotMismatch("uart count"));
        }
        if snapshot.dma.len() != DMA_CHANNELS {
            return Err(PeriphError::SnapshotMismatch("dma channel count"));
        }
        self.misc.load(&snapshot.misc);
        self.intc.restore(&snapshot.intc)?;
        for (timer, saved) in self.timers.iter_mut().zip(&snapshot.timers) {
            timer.restore(saved)?;
        }
        for (uart, saved) in self.uarts.iter_mut().zip(&snapshot.uarts) {
            uart.restore(saved)?;
        }
        self.dma.restore(&snapshot.dma)
    }

    fn route(addr: BusAddr) -> Option<(Block, BusAddr)> {
        match addr {
            MISC_BASE..=MISC_END => Some((Block::Misc, addr - MISC_BASE)),
            INTC_BASE..=INTC_END => Some((Block::Intc, addr - INTC_BASE)),
            DMA_BASE..=DMA_END => Some((Block::Dma, addr - DMA_BASE)),
            TIMER_BASE..=TIMER_END => {
                let offset = addr - TIMER_BASE;
                Some((
                    Block::Timer((offset / TIMER_STRIDE) as usize),
                    offset % TIMER_STRIDE,
                ))
            }
            UART_BASE..=UART_END => {
                let offset = addr - UART_BASE;
                Some((
                    Block::Uart((offset / UART_STRIDE) as usize),
                    offset % UART_STRIDE,
                ))
            }
            _ => None,
        }
    }
}

impl Bus for Vr0Soc {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        if addr >= SOC_WINDOW {
            log::warn!("soc: read {}", PeriphError::OutOfRangeAccess { addr });
            return Err(BusError::LoadAccessFault);
        }
        match Self::route(addr) {
            Some((Block::Misc, offset)) => Ok(decode_access(&self.misc, "misc", offset, size)
                .map_or(0, |access| self.misc.read(&access))),
            Some((Block::Intc, offset)) => self.intc.read(size, offset),
            Some((Block::Dma, offset)) => self.dma.read(size, offset),
            Some((Block::Timer(i), offset)) => self.timers[i].read(size, offset),
            Some((Block::Uart(i), offset)) => self.uarts[i].read(size, offset),
            None => {
                log::debug!("soc: read of unmapped offset {addr:#x}");
                Ok(0)
            }
        }
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        if addr >= SOC_WINDOW {
            log::warn!("soc: write {}", PeriphError::OutOfRangeAccess { addr });
            return Err(BusError::StoreAccessFault);
        }
        match Self::route(addr) {
            Some((Block::Misc, offset)) => {
                if let Some(access) = decode_access(&self.misc, "misc", offset, size) {
                    self.misc.write(&access, val);
                }
                Ok(())
            }
            Some((Block::Intc, offset)) => self.intc.write(size, offset, val),
            Some((Block::Dma, offset)) => self.dma.write(size, offset, val),
            Some((Block::Timer(i), offset)) => self.timers[i].write(size, offset, val),
            Some((Block::Uart(i), offset)) => self.uarts[i].write(size, offset, val),
            None => {
                log::debug!("soc: write of unmapped offset {addr:#x}");
                Ok(())
            }
        }
    }

    fn poll(&mut self) {
        for timer in self.timers.iter_mut() {
            timer.poll();
        }
        for uart in self.uarts.iter_mut() {
            uart.poll();
        }
        self.dma.poll();
    }

    fn reset(&mut self) {
        for timer in self.timers.iter_mut() {
            timer.reset();
        }
        for uart in self.uarts.iter_mut() {
            uart.reset();
        }
        self.dma.reset();
        self.misc.reset();
        self.intc.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identification() {
        let mut soc = Vr0Soc::new(SocArgs {
            cfgr: 0x0000_1234,
            ..Default::default()
        });
        assert_eq!(soc.read(BusSize::Word, 0x0), Ok(DEFAULT_SYSID));
        assert_eq!(soc.read(BusSize::Word, 0x4), Ok(0x1234));
        soc.write(BusSize::Word, 0x0, 0).unwrap();
        assert_eq!(soc.read(BusSize::HalfWord, 0x2), Ok(0x0087));
    }

    #[test]
    fn test_window_bounds() {
        let mut soc = Vr0Soc::new(SocArgs::default());
        assert_eq!(
            soc.read(BusSize::Word, SOC_WINDOW),
            Err(BusError::LoadAccessFault)
        );
        assert_eq!(
            soc.write(BusSize::Word, 0xffff_fffc, 0),
            Err(BusError::StoreAccessFault)
        );
        assert_eq!(soc.read(BusSize::Word, 0x0400), Ok(0));
        assert_eq!(soc.read(BusSize::Word, 0x1ffc), Ok(0));
        assert_eq!(soc.write(BusSize::Word, 0x1c00, 0xffff_ffff), Ok(()));
        // Past the last channel of each block.
        assert_eq!(soc.read(BusSize::Word, 0x1020), Ok(0));
        assert_eq!(soc.read(BusSize::Word, 0x1420), Ok(0));
        assert_eq!(soc.read(BusSize::Word, 0x1840), Ok(0));
    }

    #[test]
    fn test_routing() {
        let mut soc = Vr0Soc::new(SocArgs::default());
        soc.write(BusSize::HalfWord, 0x141c, 0x1234).unwrap();
        assert_eq!(soc.timer(3).map(TimerChannel::count), Some(0x1234));
        soc.write(BusSize::Word, 0x1824, 0x7).unwrap();
        assert_eq!(soc.read(BusSize::Word, 0x1824), Ok(0x7));
        assert_eq!(soc.read(BusSize::Word, 0x1804), Ok(0));
        soc.write(BusSize::Word, 0x1014, 0x40).unwrap();
        assert_eq!(soc.read(BusSize::Word, 0x1014), Ok(0x40));
        assert_eq!(soc.read(BusSize::Word, 0x1004), Ok(0));
    }

    #[test]
    fn test_register_map() {
        let soc = Vr0Soc::new(SocArgs {
            sysid: 0xdead_0001,
            ..Default::default()
        });
        let map = soc.register_map();
        assert_eq!(map.len(), 2 + 3 + 4 * DMA_CHANNELS + 2 * SOC_TIMERS + 5 * SOC_UARTS);
        assert_eq!(map[0].reset, 0xdead_0001);
        let find = |name: &str| map.iter().filter(|r| r.name == name).map(|r| r.addr).collect::<Vec<_>>();
        assert_eq!(find("INTST"), vec![0x0808]);
        assert_eq!(find("DMAC"), vec![0x100c, 0x101c]);
        assert_eq!(find("TMCNT"), vec![0x1404, 0x140c, 0x1414, 0x141c]);
        assert_eq!(find("URXB"), vec![0x1810, 0x1830]);
    }

    #[test]
    fn test_bad_port() {
        let mut soc = Vr0Soc::new(SocArgs::default());
        assert_eq!(
            soc.receive(2, 0),
            Err(PeriphError::InvalidState("no such uart"))
        );
        assert_eq!(
            soc.set_rx_line(5, false),
            Err(PeriphError::InvalidState("no such uart"))
        );
    }
}
