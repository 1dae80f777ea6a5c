/*++

Licensed under the Apache-2.0 license.

File Name:

    mod.rs

Abstract:

    File contains helpers for testing Bus implementations.

--*/
mod fake_bus;
mod log;

pub use fake_bus::FakeBus;
pub use log::Log;
