/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the VRender0 Emulator Peripheral library.

--*/

mod dma;
mod error;
mod helpers;
mod intc;
mod soc;
mod timer;
mod uart;

pub use dma::{Dma, DmaChannel, DmaSnapshot, TransferSnapshot, DMA_CHANNELS, DMA_STRIDE};
pub use error::PeriphError;
pub use intc::{irq_source, Intc, IntcSnapshot, Irq, IrqLineCb};
pub use soc::{
    RegisterInfo, SocArgs, SocSnapshot, Vr0Soc, DEFAULT_SYSID, SOC_TIMERS, SOC_UARTS, SOC_WINDOW,
};
pub use timer::{TimerChannel, TimerSnapshot, TIMER_STRIDE};
pub use uart::{Uart, UartSnapshot, UartTxCb, UART_FIFO_DEPTH, UART_STRIDE};
