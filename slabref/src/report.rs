//! Diagnostic sink for recoverable-but-suspicious conditions
//!
//! Nothing in here is ever used for fatal conditions. Every report carries a
//! [BugTag] with a stable integer code so a harness can assert on which
//! violation happened without parsing the message.

use std::{cell::RefCell, fmt::Debug};

use tracing::Level;

/// Category of a reported violation
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BugTag {
    /// Temporary reference used after its target was destroyed (or while null)
    TempRef = 1,
    /// Weak reference used after its target was destroyed (or while null)
    WeakRef = 2,
    /// Shared reference misuse, e.g. destroying an object that still has shared owners
    SharedRef = 3,
    /// Monitor pointer accessed after destroy, or leaked
    MonitorPtr = 4,
    /// Allocator corruption guard or unservable request
    MemPool = 5,
    /// Object destroyed while still registered as externally retained
    ExternRetain = 6,
    /// Factory bookkeeping misuse, e.g. deleting an object twice
    Factory = 7,
}

impl BugTag {
    /// Stable integer code of this tag
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Receiver of violation reports
pub trait BugReporter {
    fn report(&self, tag: BugTag, message: &str);
}

/// Default sink, forwards every report to `tracing` at WARN level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl BugReporter for TracingReporter {
    fn report(&self, tag: BugTag, message: &str) {
        tracing::event!(Level::WARN, tag = tag.code(), "bug[{}] {}", tag.code(), message);
    }
}

/// Sink that keeps every report, for tests and tooling
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: RefCell<Vec<(BugTag, String)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything reported so far
    pub fn reports(&self) -> Vec<(BugTag, String)> {
        self.reports.borrow().clone()
    }

    /// Tags reported so far, in order
    pub fn tags(&self) -> Vec<BugTag> {
        self.reports.borrow().iter().map(|(tag, _)| *tag).collect()
    }

    pub fn count(&self, tag: BugTag) -> usize {
        self.reports.borrow().iter().filter(|(t, _)| *t == tag).count()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.borrow().is_empty()
    }

    /// Drain the recorded reports
    pub fn take(&self) -> Vec<(BugTag, String)> {
        self.reports.take()
    }
}

impl BugReporter for RecordingReporter {
    fn report(&self, tag: BugTag, message: &str) {
        tracing::event!(Level::DEBUG, tag = tag.code(), "{}", message);
        self.reports.borrow_mut().push((tag, message.to_owned()));
    }
}
