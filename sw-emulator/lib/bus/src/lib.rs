/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the VRender0 Emulator Bus library.

--*/
mod bus;
mod clock;
mod ram;
mod register_bank;
pub mod testing;

pub use crate::bus::{Bus, BusError};
pub use crate::clock::{ActionHandle, Clock, Timer};
pub use crate::ram::Ram;
pub use crate::register_bank::{Access, LaneAccess, RegisterBank, RegisterDef, RegisterWrite};
