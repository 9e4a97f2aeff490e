//! A tick-driven coordination kernel for small real-time systems.
//!
//! The kernel provides the parts of an RTOS that decide *when* a task may
//! run: software timers and task delays on a relative-delta queue,
//! semaphores, mailboxes, message queues, and priority-inheritance mutexes
//! on a shared wait-list abstraction, a 32-bit event flag group, and a fixed arena allocator that
//! backs dynamically sized objects. Context switching and the ready list
//! belong to the [`Port`].
//!
//! All state is owned by a [`Kernel`] value. Nothing is global, so any
//! number of independent kernels can coexist (which is what the tests do).
//!
//! # Blocking
//!
//! Operations that may block return <code>Result&lt;[Poll]&lt;T&gt;, E&gt;</code>.
//! `Ready` means the operation completed without waiting. `Pending` means
//! the running task has been parked; the port must not resume it until the
//! kernel calls [`Port::make_ready`], after which the task collects the
//! outcome with [`Kernel::take_wait_result`].
//!
//! # Interrupts
//!
//! Interrupt handlers bracket their body with [`Kernel::enter_interrupt`] and
//! [`Kernel::exit_interrupt`] and use the `isr_*` entry points. While the
//! scheduler lock is held, these entry points queue the request and the
//! kernel services it when the lock is released.
//!
//! # Cargo features
//!
//!  - **`check_params`** (default): validate object identifiers and heap
//!    pointers and report [`ResultCode::InvalidId`] /
//!    [`ResultCode::InvalidPointer`]. Without it, the checks are reduced to
//!    `debug_assert!`s.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_code)]

pub use core::task::Poll;

mod error;
mod event;
mod flag;
pub mod heap;
mod klock;
mod mailbox;
mod mutex;
mod partition;
mod queue;
mod semaphore;
mod service_req;
mod task;
mod timer;
pub mod utils;
mod wait;

#[cfg(test)]
mod test_utils;

pub use self::{
    error::*,
    event::{DeleteOption, MailboxId, MutexId, QueueId, SemaphoreId},
    flag::{FlagId, FlagWaitMode, MAX_FLAGS},
    heap::ArenaPtr,
    partition::{PartitionId, MAX_PARTITIONS},
    service_req::SERVICE_QUEUE_LEN,
    task::{Priority, TaskId},
    timer::{TimerCallback, TimerId, TimerKind, TimerState},
    wait::{QueueOrder, WaitPayload},
};

/// A message passed through a mailbox or a queue.
pub type Message = usize;

/// The number of ticks to wait. `0` means "wait forever" for wait
/// operations.
pub type Ticks = u32;

/// The interface to the scheduler and the interrupt controller, implemented
/// by a port.
pub trait Port {
    /// Insert `task` into the ready list. The kernel has already removed
    /// `task` from every wait list and the delay list.
    fn make_ready(&mut self, task: TaskId);

    /// Get the currently running task. `None` if the processor is idle.
    fn running_task(&self) -> Option<TaskId>;

    /// Mask interrupts that may call into the kernel. Called when the
    /// kernel's CPU Lock nesting count goes from 0 to 1.
    fn enter_cpu_lock(&mut self) {}

    /// Undo [`Self::enter_cpu_lock`]. Called when the nesting count goes back
    /// to 0.
    fn leave_cpu_lock(&mut self) {}

    /// Called when the effective priority of `task` changes because of
    /// mutex priority inheritance. A port that orders its ready list by
    /// priority must reposition `task` if it's ready.
    fn set_priority(&mut self, _task: TaskId, _priority: Priority) {}
}

/// Build-time configuration that doesn't affect the kernel's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// The order in which tasks waiting on flags are examined by
    /// [`Kernel::set_flag`].
    pub flag_wait_order: QueueOrder,
}

impl utils::Init for KernelConfig {
    const INIT: Self = Self {
        flag_wait_order: QueueOrder::Fifo,
    };
}

impl Default for KernelConfig {
    fn default() -> Self {
        <Self as utils::Init>::INIT
    }
}

/// The kernel state.
///
///  - `TASKS` is the capacity of the task table.
///  - `TIMERS` is the capacity of the software timer table.
///  - `EVENTS` is the capacity of the control block pool shared by
///    semaphores, mailboxes, and queues.
///  - `HEAP_WORDS` is the size of the arena in `usize` words.
pub struct Kernel<
    P,
    const TASKS: usize,
    const TIMERS: usize,
    const EVENTS: usize,
    const HEAP_WORDS: usize,
> {
    port: P,
    config: KernelConfig,
    lock: klock::LockState,
    tick_count: u64,
    pub(crate) tasks: [task::TaskCb; TASKS],
    pub(crate) delay_list: utils::intrusive_list::ListHead<usize>,
    pub(crate) timers: timer::TimerTable<Self, TIMERS>,
    pub(crate) events: event::EventTable<EVENTS>,
    pub(crate) flags: flag::FlagGroup,
    pub(crate) heap: heap::Arena<HEAP_WORDS>,
    pub(crate) partitions: partition::PartitionTable,
    pub(crate) service_queue: service_req::ServiceQueue,
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    /// Construct a kernel with the default configuration.
    pub fn new(port: P) -> Self {
        Self::with_config(port, KernelConfig::default())
    }

    /// Construct a kernel.
    pub fn with_config(port: P, config: KernelConfig) -> Self {
        use utils::Init;
        Self {
            port,
            config,
            lock: klock::LockState::INIT,
            tick_count: 0,
            tasks: [task::TaskCb::INIT; TASKS],
            delay_list: utils::intrusive_list::ListHead::INIT,
            timers: timer::TimerTable::new(),
            events: event::EventTable::new(),
            flags: flag::FlagGroup::INIT,
            heap: heap::Arena::new(),
            partitions: partition::PartitionTable::INIT,
            service_queue: service_req::ServiceQueue::INIT,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Get the number of ticks elapsed since the kernel was created.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Get a reference to the arena allocator.
    pub fn heap(&self) -> &heap::Arena<HEAP_WORDS> {
        &self.heap
    }

    /// Get a mutable reference to the arena allocator.
    pub fn heap_mut(&mut self) -> &mut heap::Arena<HEAP_WORDS> {
        &mut self.heap
    }

    /// Advance the system time by one tick. This is the tick interrupt
    /// handler.
    ///
    /// Only the first entries of the delay list and the timer list are
    /// updated here. Expired entries are dispatched immediately unless the
    /// kernel is locked, in which case they are dispatched when the lock is
    /// released.
    pub fn advance_one_tick(&mut self) {
        let expired = self.with_cpu_lock(|k| {
            k.tick_count += 1;
            let delays = k.tick_delay_list();
            let timers = k.tick_timer_list();
            (delays, timers)
        });

        match expired {
            (false, false) => {}
            (delays, timers) if self.is_locked() => {
                log::trace!("tick {}: dispatch deferred", self.tick_count);
                self.lock.time_req |= delays;
                self.lock.timer_req |= timers;
            }
            (delays, timers) => {
                if delays {
                    self.dispose_delays();
                }
                if timers {
                    self.dispose_timers();
                }
            }
        }
    }
}
