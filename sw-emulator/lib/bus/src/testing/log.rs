/*++

Licensed under the Apache-2.0 license.

File Name:

    log.rs

Abstract:

    File contains a shared text buffer for recording device activity in tests.

--*/
use std::{
    cell::{Ref, RefCell, RefMut},
    fmt::Display,
    rc::Rc,
};

/// Records activity as text without needing `&mut self`, so fake devices and
/// callbacks handed to a peripheral can report what happened to them.
///
/// Clones share one buffer: a test keeps one clone and moves the others into
/// closures.
///
/// * Example
///
/// ```
/// use vr0_emu_bus::testing::Log;
/// use std::fmt::Write;
///
/// let log = Log::new();
/// let cb_log = log.clone();
/// writeln!(cb_log.w(), "irq(true)").unwrap();
/// log.line("irq(false)");
/// assert_eq!("irq(true)\nirq(false)\n", &*log.as_str());
/// assert_eq!("irq(true)\nirq(false)\n", log.take());
/// assert_eq!("", log.take());
/// ```
#[derive(Clone, Default)]
pub struct Log {
    buf: Rc<RefCell<String>>,
}
impl Log {
    /// Construct an empty `Log`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current contents, left in place.
    pub fn as_str(&self) -> Ref<'_, str> {
        Ref::map(self.buf.borrow(), String::as_str)
    }

    /// Empties the log and returns what it held.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.buf.borrow_mut())
    }

    /// Appends `entry` followed by a newline.
    pub fn line(&self, entry: impl Display) {
        let mut buf = self.buf.borrow_mut();
        buf.push_str(&entry.to_string());
        buf.push('\n');
    }

    /// A writer for use with `write!()` or `writeln!()`. Drop it before
    /// reading the log back.
    pub fn w(&self) -> RefMut<'_, String> {
        self.buf.borrow_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_write_and_take() {
        let log = Log::new();
        writeln!(log.w(), "tx(0x41)").unwrap();
        log.line(format_args!("tx({:#x})", 0x42));
        assert_eq!("tx(0x41)\ntx(0x42)\n", &*log.as_str());
        assert_eq!("tx(0x41)\ntx(0x42)\n", log.take());
        assert_eq!("", log.take());
    }

    #[test]
    fn test_clones_share_buffer() {
        let log = Log::new();
        let cb = {
            let log = log.clone();
            move |level: bool| log.line(format_args!("irq({level})"))
        };
        cb(true);
        cb(false);
        assert_eq!("irq(true)\nirq(false)\n", log.take());
    }
}
