/*++

Licensed under the Apache-2.0 license.

File Name:

    uart.rs

Abstract:

    File contains the serial ports. Transmitted bytes go to a host callback
    after one frame time; received bytes come from the host and wait in a
    bounded FIFO until firmware reads them.

--*/

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::InMemoryRegister;
use vr0_emu_bus::{
    Access, ActionHandle, Bus, BusError, Clock, RegisterBank, RegisterDef, RegisterWrite, Timer,
};
use vr0_emu_types::{BusAddr, BusData, BusSize};

use crate::helpers::{decode_access, remaining};
use crate::intc::Irq;
use crate::PeriphError;

register_bitfields! [
    u32,

    /// UART Control Register
    UCon [
        WORD8 OFFSET(0) NUMBITS(1) [],
        STOP2 OFFSET(2) NUMBITS(1) [],
        PARITY OFFSET(3) NUMBITS(2) [
            Disabled = 0b00,
            Disabled1 = 0b01,
            Odd = 0b10,
            Even = 0b11,
        ],
        TX_IRQ_EN OFFSET(5) NUMBITS(1) [],
        RX_IRQ_EN OFFSET(6) NUMBITS(1) [],
        ENABLE OFFSET(8) NUMBITS(1) [],
    ],

    /// UART Baud Divisor Register
    UBdr [
        DIVISOR OFFSET(0) NUMBITS(16) [],
    ],

    /// UART Status Register
    UStat [
        RX_READY OFFSET(0) NUMBITS(1) [],
        OVERRUN OFFSET(1) NUMBITS(1) [],
        BREAK OFFSET(2) NUMBITS(1) [],
        TX_EMPTY OFFSET(5) NUMBITS(1) [],
        RX_COUNT OFFSET(8) NUMBITS(5) [],
    ],
];

const UCON: usize = 0;
const UBDR: usize = 1;
const USTAT: usize = 2;
const UTXB: usize = 3;

/// USTAT bits latched by hardware and cleared when firmware reads them.
/// The other USTAT bits are computed on every read.
const USTAT_STICKY: BusData = 0b110;

static UART_REGS: [RegisterDef; 5] = [
    RegisterDef::new("UCON", 0x00, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("UBDR", 0x04, BusSize::Word, 0, Access::ReadWrite),
    RegisterDef::new("USTAT", 0x08, BusSize::Word, 0, Access::ClearOnRead(USTAT_STICKY)),
    RegisterDef::new("UTXB", 0x0c, BusSize::Word, 0, Access::WriteOnly),
    RegisterDef::new("URXB", 0x10, BusSize::Word, 0, Access::ReadOnly),
];

/// Bytes of window each UART occupies.
pub const UART_STRIDE: BusAddr = 0x20;

/// Default receive FIFO depth.
pub const UART_FIFO_DEPTH: usize = 16;

/// Receives every byte a UART finishes transmitting.
pub struct UartTxCb(Box<dyn FnMut(u8)>);
impl UartTxCb {
    pub fn new(f: impl FnMut(u8) + 'static) -> Self {
        Self(Box::new(f))
    }
}
impl Default for UartTxCb {
    fn default() -> Self {
        Self(Box::new(|_| {}))
    }
}
impl std::fmt::Debug for UartTxCb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UartTxCb")
            .field(&"<unknown closure>")
            .finish()
    }
}
impl From<Box<dyn FnMut(u8) + 'static>> for UartTxCb {
    fn from(value: Box<dyn FnMut(u8)>) -> Self {
        Self(value)
    }
}

/// Saved UART state. Scheduling is kept relative to the clock.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UartSnapshot {
    pub regs: Vec<BusData>,
    pub rx_fifo: Vec<u8>,

    /// Byte in the transmit shifter and the cycles until it is delivered.
    pub tx: Option<(u8, u64)>,

    pub rx_line_low: bool,

    /// Cycles until a held-low line is reported as a break.
    pub break_remaining: Option<u64>,
}

pub struct Uart {
    channel: usize,
    regs: RegisterBank,
    timer: Timer,
    irq: Irq,

    rx_fifo: VecDeque<u8>,
    rx_capacity: usize,

    /// Byte being shifted out, and when it finishes.
    tx_byte: Option<u8>,
    tx_done: Option<ActionHandle>,

    rx_line_low: bool,
    break_detect: Option<ActionHandle>,

    tx_cb: UartTxCb,
}

impl Uart {
    pub fn new(channel: usize, clock: &Clock, irq: Irq, rx_capacity: usize, tx_cb: UartTxCb) -> Self {
        Self {
            channel,
            regs: RegisterBank::new(&UART_REGS),
            timer: clock.timer(),
            irq,
            rx_fifo: VecDeque::with_capacity(rx_capacity),
            rx_capacity,
            tx_byte: None,
            tx_done: None,
            rx_line_low: false,
            break_detect: None,
            tx_cb,
        }
    }

    fn control(&self) -> InMemoryRegister<u32, UCon::Register> {
        InMemoryRegister::new(self.regs.get(UCON))
    }

    pub fn is_enabled(&self) -> bool {
        self.control().is_set(UCon::ENABLE)
    }

    /// Bits per frame: start, data, optional parity, stop.
    pub fn frame_bits(&self) -> u64 {
        let control = self.control();
        let data = if control.is_set(UCon::WORD8) { 8 } else { 7 };
        let parity: Option<UCon::PARITY::Value> = control.read_as_enum(UCon::PARITY);
        let parity = match parity {
            Some(UCon::PARITY::Value::Odd) | Some(UCon::PARITY::Value::Even) => 1,
            _ => 0,
        };
        let stop = if control.is_set(UCon::STOP2) { 2 } else { 1 };
        1 + data + parity + stop
    }

    pub fn cycles_per_bit(&self) -> u64 {
        let ubdr = InMemoryRegister::<u32, UBdr::Register>::new(self.regs.get(UBDR));
        32 * (u64::from(ubdr.read(UBdr::DIVISOR)) + 1)
    }

    pub fn frame_cycles(&self) -> u64 {
        self.frame_bits() * self.cycles_per_bit()
    }

    /// Baud rate the current divisor gives at `clock_hz`.
    pub fn baud_rate(&self, clock_hz: u64) -> u64 {
        clock_hz / self.cycles_per_bit()
    }

    pub fn is_transmitting(&self) -> bool {
        self.tx_done.is_some()
    }

    pub fn rx_len(&self) -> usize {
        self.rx_fifo.len()
    }

    /// Status bits derived from the current state rather than stored.
    fn live_status(&self) -> BusData {
        let status = InMemoryRegister::<u32, UStat::Register>::new(0);
        let count = self.rx_fifo.len().min(0x1f) as u32;
        status.write(
            UStat::RX_READY.val(u32::from(count != 0))
                + UStat::TX_EMPTY.val(u32::from(!self.is_transmitting()))
                + UStat::RX_COUNT.val(count),
        );
        status.get()
    }

    fn raise_rx_irq(&self) {
        if self.control().is_set(UCon::RX_IRQ_EN) {
            self.irq.post();
        }
    }

    fn set_status(&mut self, bits: BusData) {
        self.regs.set_bits(USTAT, bits);
    }

    /// A byte arriving from the host side of the line. A byte that finds the
    /// FIFO full is dropped and only shows up as USTAT.OVERRUN.
    pub fn receive(&mut self, byte: u8) {
        if !self.is_enabled() {
            log::debug!("uart{}: disabled, dropping rx {byte:#04x}", self.channel);
            return;
        }
        self.regs
            .clear_bits(USTAT, UStat::BREAK.mask << UStat::BREAK.shift);
        if self.rx_fifo.len() >= self.rx_capacity {
            self.set_status(UStat::OVERRUN.mask << UStat::OVERRUN.shift);
            self.raise_rx_irq();
            let err = PeriphError::QueueOverrun {
                channel: self.channel,
            };
            log::warn!("{err}, dropping {byte:#04x}");
            return;
        }
        self.rx_fifo.push_back(byte);
        self.raise_rx_irq();
    }

    /// Level of the receive line as driven by the host. A line held low for
    /// a whole frame is reported as a break.
    pub fn set_rx_line(&mut self, high: bool) {
        if high {
            self.rx_line_low = false;
            self.cancel_break_detect();
        } else if !self.rx_line_low {
            self.rx_line_low = true;
            if self.is_enabled() {
                self.break_detect = Some(self.timer.schedule_poll_in(self.frame_cycles()));
            }
        }
    }

    fn cancel_break_detect(&mut self) {
        if let Some(action) = self.break_detect.take() {
            self.timer.cancel(action);
        }
    }

    fn cancel_tx(&mut self) {
        self.tx_byte = None;
        if let Some(action) = self.tx_done.take() {
            self.timer.cancel(action);
        }
    }

    fn transmit(&mut self, byte: u8) {
        if !self.is_enabled() {
            log::debug!("uart{}: disabled, dropping tx {byte:#04x}", self.channel);
            return;
        }
        if self.is_transmitting() {
            log::warn!("uart{}: transmitter busy, dropping tx {byte:#04x}", self.channel);
            return;
        }
        self.tx_byte = Some(byte);
        self.tx_done = Some(self.timer.schedule_poll_in(self.frame_cycles()));
    }

    fn write_control(&mut self, write: &RegisterWrite) {
        let enable = UCon::ENABLE.mask << UCon::ENABLE.shift;
        if write.falling() & enable != 0 {
            log::debug!("uart{}: disabled", self.channel);
            self.cancel_tx();
            self.cancel_break_detect();
        } else if write.rising() & enable != 0 && self.rx_line_low {
            // The line was already low when the port came up.
            self.cancel_break_detect();
            self.break_detect = Some(self.timer.schedule_poll_in(self.frame_cycles()));
        }
    }

    pub(crate) fn defs(&self) -> &'static [RegisterDef] {
        &UART_REGS
    }

    pub fn snapshot(&self) -> UartSnapshot {
        UartSnapshot {
            regs: self.regs.values().to_vec(),
            rx_fifo: self.rx_fifo.iter().copied().collect(),
            tx: self
                .tx_byte
                .zip(remaining(&self.timer, &self.tx_done)),
            rx_line_low: self.rx_line_low,
            break_remaining: remaining(&self.timer, &self.break_detect),
        }
    }

    pub fn restore(&mut self, snapshot: &UartSnapshot) -> Result<(), PeriphError> {
        if snapshot.regs.len() != UART_REGS.len() {
            return Err(PeriphError::SnapshotMismatch("uart registers"));
        }
        if snapshot.rx_fifo.len() > self.rx_capacity {
            return Err(PeriphError::SnapshotMismatch("uart receive fifo"));
        }
        self.cancel_tx();
        self.cancel_break_detect();
        self.regs.load(&snapshot.regs);
        self.rx_fifo = snapshot.rx_fifo.iter().copied().collect();
        if let Some((byte, cycles)) = snapshot.tx {
            self.tx_byte = Some(byte);
            self.tx_done = Some(self.timer.schedule_poll_in(cycles));
        }
        self.rx_line_low = snapshot.rx_line_low;
        if let Some(cycles) = snapshot.break_remaining {
            self.break_detect = Some(self.timer.schedule_poll_in(cycles));
        }
        Ok(())
    }
}

impl Bus for Uart {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        let Some(access) = decode_access(&self.regs, "uart", addr, size) else {
            return Ok(0);
        };
        match access.index {
            USTAT => Ok(self.regs.read(&access) | access.extract(self.live_status())),
            UCON | UBDR | UTXB => Ok(self.regs.read(&access)),
            _ => {
                // URXB: only a read covering the data lane consumes a byte.
                if !access.touches(0xff) {
                    return Ok(0);
                }
                let byte = self.rx_fifo.pop_front().unwrap_or(0);
                Ok(access.extract(BusData::from(byte)))
            }
        }
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        let Some(access) = decode_access(&self.regs, "uart", addr, size) else {
            return Ok(());
        };
        let write = self.regs.write(&access, val);
        match write.index {
            UCON => self.write_control(&write),
            UTXB if access.touches(0xff) => self.transmit(write.new as u8),
            _ => {}
        }
        Ok(())
    }

    fn poll(&mut self) {
        if self.timer.fired(&mut self.tx_done) {
            if let Some(byte) = self.tx_byte.take() {
                log::trace!("uart{}: tx {byte:#04x}", self.channel);
                (self.tx_cb.0)(byte);
            }
            if self.control().is_set(UCon::TX_IRQ_EN) {
                self.irq.post();
            }
        }
        if self.timer.fired(&mut self.break_detect) {
            log::debug!("uart{}: break", self.channel);
            self.set_status(UStat::BREAK.mask << UStat::BREAK.shift);
            self.raise_rx_irq();
        }
    }

    fn reset(&mut self) {
        self.cancel_tx();
        self.cancel_break_detect();
        self.rx_fifo.clear();
        self.rx_line_low = false;
        self.regs.reset();
    }
}
