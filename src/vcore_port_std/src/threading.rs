//! Blocking threads on alarms
use spin::Mutex as SpinMutex;
use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, Thread},
};

/// The set of threads blocked on an alarm.
#[derive(Debug)]
pub struct WaitSet {
    waiters: SpinMutex<Vec<Arc<Waiter>>>,
}

/// A thread registered in a [`WaitSet`].
#[derive(Debug)]
pub(crate) struct Waiter {
    thread: Thread,
    /// Set by [`WaitSet::resume_all`]. Protects against spurious wake-ups.
    resumed: AtomicBool,
}

thread_local! {
    /// The registration created by `suspend_current_on` and consumed by the
    /// next `reschedule`.
    static PENDING_WAIT: RefCell<Option<Arc<Waiter>>> = RefCell::new(None);
}

impl WaitSet {
    pub const fn new() -> Self {
        Self {
            waiters: SpinMutex::new(Vec::new()),
        }
    }

    /// Get the number of threads currently registered.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake up every registered thread and empty the set.
    pub(crate) fn resume_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        if !waiters.is_empty() {
            log::trace!("resuming {} thread(s)", waiters.len());
        }
        for waiter in waiters {
            waiter.resumed.store(true, Ordering::Release);
            waiter.thread.unpark();
        }
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    /// Park the current thread until [`WaitSet::resume_all`] picks this
    /// waiter.
    pub(crate) fn park(&self) {
        debug_assert_eq!(self.thread.id(), thread::current().id());
        while !self.resumed.load(Ordering::Acquire) {
            thread::park();
        }
    }
}

/// Register the current thread in `wait_set`. A wake-up issued after this
/// point is remembered until the thread parks.
pub(crate) fn suspend_current_on(wait_set: &WaitSet) {
    let waiter = Arc::new(Waiter {
        thread: thread::current(),
        resumed: AtomicBool::new(false),
    });
    wait_set.waiters.lock().push(Arc::clone(&waiter));

    PENDING_WAIT.with(|pending| {
        let old = pending.borrow_mut().replace(waiter);
        assert!(old.is_none(), "the current thread is already suspended");
    });
}

/// Take the registration made by [`suspend_current_on`], if any.
pub(crate) fn take_pending_wait() -> Option<Arc<Waiter>> {
    PENDING_WAIT.with(|pending| pending.borrow_mut().take())
}
