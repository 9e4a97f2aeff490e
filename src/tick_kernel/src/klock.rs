//! Kernel state locking mechanism
//!
//! Two nesting counters guard the kernel state:
//!
//!  - **CPU Lock** is taken around every multi-step list mutation. Its
//!    outermost acquisition and release are forwarded to the port, which
//!    masks the interrupts that may call into the kernel.
//!
//!  - The **scheduler lock** is taken by the application to suppress
//!    dispatching across several kernel calls. While it's held, blocking
//!    operations fail with `SchedulerLocked` and interrupt-context posts are
//!    deferred to the service request queue.
//!
//! Work deferred while either lock is held is serviced when both counters
//! return to zero.
use crate::{
    error::{BadContextError, LockError},
    utils::Init,
    Kernel, Port, TaskId,
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct LockState {
    cpu_lock_nesting: u8,
    sched_lock_nesting: u8,
    interrupt_nesting: u8,
    /// The delay list has expired entries that haven't been dispatched.
    pub(crate) time_req: bool,
    /// The timer list has expired entries that haven't been dispatched.
    pub(crate) timer_req: bool,
    /// Set while deferred work is being serviced to prevent reentry.
    servicing: bool,
}

impl Init for LockState {
    const INIT: Self = Self {
        cpu_lock_nesting: 0,
        sched_lock_nesting: 0,
        interrupt_nesting: 0,
        time_req: false,
        timer_req: false,
        servicing: false,
    };
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    /// Run `f` in a CPU Lock state.
    pub(crate) fn with_cpu_lock<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.enter_cpu_lock();
        let ret = f(self);
        self.leave_cpu_lock();
        ret
    }

    fn enter_cpu_lock(&mut self) {
        if self.lock.cpu_lock_nesting == 0 {
            self.port.enter_cpu_lock();
        }
        self.lock.cpu_lock_nesting += 1;
    }

    fn leave_cpu_lock(&mut self) {
        debug_assert_ne!(self.lock.cpu_lock_nesting, 0);
        self.lock.cpu_lock_nesting -= 1;
        if self.lock.cpu_lock_nesting == 0 {
            self.port.leave_cpu_lock();
            self.service_deferred_work();
        }
    }

    /// Get a flag indicating whether interrupt-context requests must be
    /// deferred.
    pub(crate) fn is_locked(&self) -> bool {
        self.lock.cpu_lock_nesting > 0 || self.lock.sched_lock_nesting > 0
    }

    /// Acquire the scheduler lock. The lock nests; each call must be paired
    /// with [`Self::unlock_scheduler`]. Fails with `BadContext` if the
    /// nesting limit is reached.
    pub fn lock_scheduler(&mut self) -> Result<(), LockError> {
        self.lock.sched_lock_nesting = self
            .lock
            .sched_lock_nesting
            .checked_add(1)
            .ok_or(LockError::BadContext)?;
        Ok(())
    }

    /// Release the scheduler lock. Releasing the outermost level services
    /// the requests made by interrupt handlers in the meantime.
    pub fn unlock_scheduler(&mut self) -> Result<(), LockError> {
        if self.lock.sched_lock_nesting == 0 {
            return Err(LockError::BadContext);
        }
        self.lock.sched_lock_nesting -= 1;
        if self.lock.sched_lock_nesting == 0 {
            self.service_deferred_work();
        }
        Ok(())
    }

    /// Get a flag indicating whether the scheduler lock is held.
    pub fn is_scheduler_locked(&self) -> bool {
        self.lock.sched_lock_nesting > 0
    }

    /// Mark the entry to an interrupt handler. Fails with `BadContext` if the
    /// nesting limit is reached.
    pub fn enter_interrupt(&mut self) -> Result<(), LockError> {
        self.lock.interrupt_nesting = self
            .lock
            .interrupt_nesting
            .checked_add(1)
            .ok_or(LockError::BadContext)?;
        Ok(())
    }

    /// Mark the exit from an interrupt handler.
    pub fn exit_interrupt(&mut self) -> Result<(), LockError> {
        if self.lock.interrupt_nesting == 0 {
            return Err(LockError::BadContext);
        }
        self.lock.interrupt_nesting -= 1;
        Ok(())
    }

    /// Get a flag indicating whether the kernel is being called from an
    /// interrupt handler.
    pub fn is_interrupt_context(&self) -> bool {
        self.lock.interrupt_nesting > 0
    }

    /// Fail with `CalledFromInterrupt` if the current context is an interrupt
    /// context.
    pub(crate) fn expect_task_context(&self) -> Result<(), BadContextError> {
        if self.is_interrupt_context() {
            Err(BadContextError::CalledFromInterrupt)
        } else {
            Ok(())
        }
    }

    /// Get the running task if the current context can block.
    ///
    /// A task that is already waiting can't start another wait; its wait
    /// link is in use.
    pub(crate) fn expect_waitable_context(&self) -> Result<TaskId, BadContextError> {
        self.expect_task_context()?;
        if self.is_scheduler_locked() {
            return Err(BadContextError::SchedulerLocked);
        }
        let task = self
            .port
            .running_task()
            .ok_or(BadContextError::CalledFromInterrupt)?;
        if self.is_task_waiting(task) {
            return Err(BadContextError::BadContext);
        }
        Ok(task)
    }

    /// Service the work deferred while the kernel was locked: expired delays,
    /// then expired timers, then the service request queue.
    fn service_deferred_work(&mut self) {
        if self.is_locked() || self.lock.servicing {
            return;
        }
        self.lock.servicing = true;

        // Stop if a timer callback leaves the kernel locked; the final unlock
        // picks up the rest.
        while !self.is_locked() {
            if core::mem::take(&mut self.lock.time_req) {
                self.dispose_delays();
            } else if core::mem::take(&mut self.lock.timer_req) {
                self.dispose_timers();
            } else if !self.respond_service_request() {
                break;
            }
        }

        self.lock.servicing = false;
    }
}
