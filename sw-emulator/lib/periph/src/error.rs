/*++

Licensed under the Apache-2.0 license.

File Name:

    error.rs

Abstract:

    File contains the errors reported by the peripheral block.

--*/

use thiserror::Error;
use vr0_emu_types::{BusAddr, BusSize};

/// Conditions the peripherals report to the host or the log. Bus accesses
/// themselves only ever fail with a [`vr0_emu_bus::BusError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum PeriphError {
    #[error("access at {addr:#x} is outside the peripheral window")]
    OutOfRangeAccess { addr: BusAddr },

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("uart{channel} receive queue overrun")]
    QueueOverrun { channel: usize },

    #[error("{size} access at {addr:#x} does not match the register width")]
    UnsupportedWidth { addr: BusAddr, size: BusSize },

    #[error("snapshot does not fit this device: {0}")]
    SnapshotMismatch(&'static str),
}
