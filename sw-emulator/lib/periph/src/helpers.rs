/*++

Licensed under the Apache-2.0 license.

File Name:

    helpers.rs

Abstract:

    File contains helper functions

--*/

use crate::PeriphError;
use vr0_emu_bus::{ActionHandle, LaneAccess, RegisterBank, Timer};
use vr0_emu_types::{BusAddr, BusSize};

/// Decodes a bus access against `regs`, logging holes and width mismatches.
pub(crate) fn decode_access(
    regs: &RegisterBank,
    device: &str,
    addr: BusAddr,
    size: BusSize,
) -> Option<LaneAccess> {
    let access = regs.decode(addr, size);
    match &access {
        None => log::debug!("{device}: no register at offset {addr:#x}"),
        Some(a) if !a.exact => {
            log::debug!("{device}: {}", PeriphError::UnsupportedWidth { addr, size })
        }
        Some(_) => {}
    }
    access
}

/// Cycles left before `action` fires, if it is pending.
pub(crate) fn remaining(timer: &Timer, action: &Option<ActionHandle>) -> Option<u64> {
    action.as_ref().map(|a| timer.remaining(a))
}

/// `time`, or `now` if `time` has already gone by.
pub(crate) fn not_before(time: u64, now: u64) -> u64 {
    if time.wrapping_sub(now) > u64::MAX >> 1 {
        now
    } else {
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_before() {
        assert_eq!(not_before(10, 5), 10);
        assert_eq!(not_before(5, 10), 10);
        assert_eq!(not_before(7, 7), 7);
        assert_eq!(not_before(2, u64::MAX - 3), 2);
    }
}
