/*++

Licensed under the Apache-2.0 license.

File Name:

    log.rs

Abstract:

    File contains code useful for logging inside unit tests.

--*/
use std::{
    cell::{Ref, RefCell},
    fmt::Write,
    ops::Deref,
    rc::Rc,
};

/// A shared append-only string buffer. Cloning a `Log` produces a handle
/// to the same buffer, so a test can hand one end to a fake device and
/// keep the other end for assertions.
///
/// * Example
///
/// ```
/// use ot_emu_bus::testing::Log;
/// use std::fmt::Write;
///
/// let log = Log::new();
/// writeln!(log.w(), "first").unwrap();
/// writeln!(log.w(), "second").unwrap();
/// assert_eq!("first\nsecond\n", &*log.as_str());
/// assert_eq!("first\nsecond\n", log.take());
/// assert_eq!("", log.take());
/// ```
#[derive(Clone, Default)]
pub struct Log {
    log: Rc<RefCell<String>>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the current contents.
    pub fn as_str(&self) -> impl Deref<Target = str> + '_ {
        Ref::map(self.log.borrow(), String::as_str)
    }

    /// Drain the log, returning everything written since the last call.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.log.borrow_mut())
    }

    /// A writer usable with write!() and writeln!(). Writing does not
    /// require `&mut self`, so fakes can log from `&self` methods.
    pub fn w(&self) -> impl Write + '_ {
        LogWriter { log: &self.log }
    }
}

struct LogWriter<'a> {
    log: &'a RefCell<String>,
}

impl Write for LogWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.log.borrow_mut().push_str(s);
        Ok(())
    }
}
