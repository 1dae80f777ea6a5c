/*++

Licensed under the Apache-2.0 license.

File Name:

    bus.rs

Abstract:

    File contains definition of the Bus trait.

--*/

use std::cell::RefCell;
use std::rc::Rc;

use vr0_emu_types::{BusAddr, BusData, BusSize};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusError {
    /// Load address misaligned
    LoadAddrMisaligned,

    /// Load from an address nothing responds to
    LoadAccessFault,

    /// Store address misaligned
    StoreAddrMisaligned,

    /// Store to an address nothing responds to
    StoreAccessFault,
}

/// Represents an abstract memory bus. Used to read and write from RAM and
/// peripheral addresses.
///
/// Peripherals implement this trait over their own register window; `addr`
/// is always relative to the start of that window.
pub trait Bus {
    /// Read data of specified size from given address
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the read
    /// * `addr` - Address to read from
    ///
    /// # Error
    ///
    /// * `BusError` - `BusError::LoadAccessFault` or `BusError::LoadAddrMisaligned`
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError>;

    /// Write data of specified size to given address
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the write
    /// * `addr` - Address to write
    /// * `val` - Data to write
    ///
    /// # Error
    ///
    /// * `BusError` - `BusError::StoreAccessFault` or `BusError::StoreAddrMisaligned`
    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError>;

    /// Notifies the device of the passage of time. The owner of this bus MAY
    /// call this function periodically, and MUST call it after any action
    /// scheduled through a [`crate::Timer`] fires.
    fn poll(&mut self) {
        // By default, do nothing
    }

    /// Returns every register to its power-on value.
    fn reset(&mut self) {
        // By default, do nothing
    }
}

impl<T: Bus + ?Sized> Bus for Box<T> {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        T::read(self, size, addr)
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        T::write(self, size, addr, val)
    }

    fn poll(&mut self) {
        T::poll(self)
    }

    fn reset(&mut self) {
        T::reset(self)
    }
}

/// Lets the host CPU and a bus master (e.g. a DMA engine) share one address
/// space.
///
/// # Panics
///
/// Panics if the inner bus is already borrowed, which means a device tried to
/// access the address space from inside its own access.
impl<T: Bus + ?Sized> Bus for Rc<RefCell<T>> {
    fn read(&mut self, size: BusSize, addr: BusAddr) -> Result<BusData, BusError> {
        self.borrow_mut().read(size, addr)
    }

    fn write(&mut self, size: BusSize, addr: BusAddr, val: BusData) -> Result<(), BusError> {
        self.borrow_mut().write(size, addr, val)
    }

    fn poll(&mut self) {
        self.borrow_mut().poll()
    }

    fn reset(&mut self) {
        self.borrow_mut().reset()
    }
}
