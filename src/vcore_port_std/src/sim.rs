//! The simulated machine
use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Instant,
};
use vcore_alarm::{CoreId, PortThreading, PortTimer};

use crate::{
    bind_current_thread, current_core, ClockSource, InterruptedContext, PortConfig, StdPort,
    System, TimerCmd,
};

/// A simulated machine: an alarm facility on [`StdPort`], the timer threads
/// delivering its timer interrupts, and the threads running on its cores.
///
/// Dropping it stops the timer threads. Threads spawned by
/// [`Self::spawn_on_core`] are not waited for.
#[derive(Debug)]
pub struct Simulator {
    system: Arc<System>,
    timer_threads: Vec<JoinHandle<()>>,
    core_threads: Arc<SpinMutex<Slab<CoreThread>>>,
}

/// An entry of the thread registry.
#[derive(Debug)]
struct CoreThread {
    core: CoreId,
    name: String,
}

/// Removes the entry from the thread registry when the thread exits.
struct Registration {
    registry: Arc<SpinMutex<Slab<CoreThread>>>,
    key: usize,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let entry = self.registry.lock().remove(self.key);
        log::trace!("thread {:?} exited", entry.name);
    }
}

impl Simulator {
    /// Create a port and an alarm facility and start delivering timer
    /// interrupts.
    pub fn new(config: PortConfig) -> Self {
        let system = Arc::new(System::new(StdPort::new(&config)));

        let timer_threads = match config.clock {
            ClockSource::Host => (0..config.num_cores)
                .map(|core| start_timer_thread(Arc::clone(&system), core))
                .collect(),
            ClockSource::Manual => Vec::new(),
        };

        Self {
            system,
            timer_threads,
            core_threads: Arc::new(SpinMutex::new(Slab::new())),
        }
    }

    #[inline]
    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    #[inline]
    pub fn port(&self) -> &StdPort {
        self.system.port()
    }

    /// Spawn a thread running on `core`.
    ///
    /// # Panics
    ///
    /// Panics if `core` does not exist.
    pub fn spawn_on_core<T, F>(&self, core: CoreId, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        assert!(core < self.port().num_cores(), "core {core} does not exist");

        let registration = {
            let mut registry = self.core_threads.lock();
            let entry = registry.vacant_entry();
            let name = format!("core{core}-{}", entry.key());
            let key = entry.key();
            entry.insert(CoreThread { core, name });
            Registration {
                registry: Arc::clone(&self.core_threads),
                key,
            }
        };

        thread::spawn(move || {
            let _registration = registration;
            bind_current_thread(core);
            f()
        })
    }

    /// Get the number of threads spawned by [`Self::spawn_on_core`] on `core`
    /// that haven't exited yet.
    pub fn live_threads(&self, core: CoreId) -> usize {
        (self.core_threads.lock())
            .iter()
            .filter(|(_, thread)| thread.core == core)
            .count()
    }

    /// Move the manual clock forward by `ticks`. Expired timers are not
    /// delivered until [`Self::fire_due_timers`] is called.
    ///
    /// # Panics
    ///
    /// Panics if the simulator uses the host clock.
    #[track_caller]
    pub fn advance(&self, ticks: u64) {
        self.port().advance(ticks);
    }

    /// Deliver a timer interrupt to every core whose virtual timer has
    /// expired. Returns the number of interrupts delivered.
    ///
    /// Each core is examined once. An alarm armed by a callback for a time
    /// that has already passed fires on the next call.
    pub fn fire_due_timers(&self) -> usize {
        let now = self.port().now();
        let mut num_fired = 0;

        for core in 0..self.port().num_cores() {
            let is_due = self.port().armed_timer(core).map_or(false, |at| at <= now);
            if is_due {
                deliver_timer_interrupt(&self.system, core);
                num_fired += 1;
            }
        }

        num_fired
    }

    /// Stop the timer threads. Called automatically on drop.
    pub fn shutdown(&mut self) {
        if self.timer_threads.is_empty() {
            return;
        }

        // Dropping the senders makes `recv` in the timer threads fail
        log::debug!("stopping {} timer thread(s)", self.timer_threads.len());
        for core in 0..self.port().num_cores() {
            self.port().detach_timer_thread(core);
        }

        let mut panic = None;
        for join_handle in self.timer_threads.drain(..) {
            if let Err(e) = join_handle.join() {
                panic.get_or_insert(e);
            }
        }
        log::debug!("stopped the timer threads");

        for (_, thread) in self.core_threads.lock().iter() {
            log::debug!("{:?} (core {}) is still running", thread.name, thread.core);
        }

        // Propagate any panic that occured in a timer thread
        if let Some(e) = panic {
            if !thread::panicking() {
                std::panic::resume_unwind(e);
            }
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start a thread that calls `check_alarms` for `core` whenever the virtual
/// timer of `core` expires.
fn start_timer_thread(system: Arc<System>, core: CoreId) -> JoinHandle<()> {
    let (timer_cmd_send, timer_cmd_recv) = mpsc::channel();
    system.port().attach_timer_thread(core, timer_cmd_send);

    log::debug!("starting the timer thread of core {core}");
    thread::spawn(move || {
        bind_current_thread(core);

        let mut next_deadline: Option<Instant> = None;
        loop {
            let recv_result = if let Some(next_deadline) = next_deadline {
                timer_cmd_recv.recv_timeout(next_deadline.saturating_duration_since(Instant::now()))
            } else {
                timer_cmd_recv
                    .recv()
                    .map_err(|_| mpsc::RecvTimeoutError::Disconnected)
            };
            match recv_result {
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    next_deadline = None;
                    deliver_timer_interrupt(&system, core);
                }
                Ok(TimerCmd::SetTimeout { at }) => {
                    // An unrepresentable deadline is as good as never
                    next_deadline = at.and_then(|at| system.port().host_instant(at));
                }
            }
        }
        log::trace!("the timer thread of core {core} is exiting");
    })
}

/// Run the trigger engine of `core` as if the current thread was interrupted
/// on that core.
fn deliver_timer_interrupt(system: &System, core: CoreId) {
    let context = InterruptedContext {
        core,
        time: system.port().now(),
    };
    log::trace!("timer interrupt: {context:?}");

    let saved_core = current_core();
    bind_current_thread(core);
    system.check_alarms(core, context);
    if let Some(saved_core) = saved_core {
        bind_current_thread(saved_core);
    } else {
        crate::unbind_current_thread();
    }
}
