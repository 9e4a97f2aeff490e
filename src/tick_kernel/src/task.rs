//! Task control blocks and the delay list
use crate::{
    error::{BadIdError, CreateTaskError, DelayError, ResetDelayError, WaitError},
    utils::{delta_list::DeltaListAccessor, intrusive_list::Link, Init},
    wait::{TaskWait, WaitObject, WaitPayload},
    Kernel, Poll, Port, Ticks,
};

/// Identifies a task in the kernel's task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    /// Construct a `TaskId` from a task table index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the task table index.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Task priority. Lower values have higher priorities.
pub type Priority = u8;

/// *Task control block*.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskCb {
    pub(crate) active: bool,
    /// The priority the task was created with.
    pub(crate) base_priority: Priority,
    /// The base priority, raised by the waiters of the mutexes the task
    /// owns.
    pub(crate) priority: Priority,
    pub(crate) wait: TaskWait,
    /// Links the task into the wait list of the object it's waiting on.
    pub(crate) wait_link: Option<Link<usize>>,
    /// Links the task into the delay list.
    pub(crate) delay_link: Option<Link<usize>>,
    pub(crate) delay_delta: u32,
}

impl Init for TaskCb {
    const INIT: Self = Self {
        active: false,
        base_priority: 0,
        priority: 0,
        wait: TaskWait::INIT,
        wait_link: None,
        delay_link: None,
        delay_delta: 0,
    };
}

macro_rules! delay_list_accessor {
    ($kernel:expr) => {
        DeltaListAccessor::new(
            &mut $kernel.delay_list,
            &mut $kernel.tasks[..],
            |cb| &mut cb.delay_link,
            |cb| &mut cb.delay_delta,
        )
    };
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    /// Validate a task identifier and get its index.
    pub(crate) fn check_task(&self, task: TaskId) -> Result<usize, BadIdError> {
        let i = task.index();
        if cfg!(feature = "check_params") {
            if self.tasks.get(i).map_or(true, |cb| !cb.active) {
                return Err(BadIdError::InvalidId);
            }
        } else {
            debug_assert!(self.tasks[i].active, "invalid task {:?}", task);
        }
        Ok(i)
    }

    /// Allocate a task control block.
    pub fn create_task(&mut self, priority: Priority) -> Result<TaskId, CreateTaskError> {
        self.with_cpu_lock(|k| {
            let i = k
                .tasks
                .iter()
                .position(|cb| !cb.active)
                .ok_or(CreateTaskError::Exhausted)?;
            k.tasks[i] = TaskCb {
                active: true,
                base_priority: priority,
                priority,
                ..TaskCb::INIT
            };
            Ok(TaskId::new(i))
        })
    }

    /// Release a task control block. If the task is waiting, it's silently
    /// removed from the wait list and the delay list. Mutexes owned by the
    /// task are handed over to their next waiters.
    pub fn delete_task(&mut self, task: TaskId) -> Result<(), BadIdError> {
        self.with_cpu_lock(|k| {
            let i = k.check_task(task)?;
            if k.tasks[i].wait.object.is_some() {
                k.unlink_waiter(i);
                k.remove_delay(i);
            }
            k.release_mutexes_of(i);
            k.tasks[i] = TaskCb::INIT;
            Ok(())
        })
    }

    /// Get the effective priority of a task, which includes the priority
    /// inherited through the mutexes it owns.
    pub fn task_priority(&self, task: TaskId) -> Result<Priority, BadIdError> {
        let i = self.check_task(task)?;
        Ok(self.tasks[i].priority)
    }

    /// Get a flag indicating whether the task is blocked in a wait operation
    /// or a delay.
    pub fn is_task_waiting(&self, task: TaskId) -> bool {
        self.tasks
            .get(task.index())
            .map_or(false, |cb| cb.wait.object.is_some())
    }

    /// Put the running task to sleep for `ticks` ticks.
    ///
    /// The task is woken with [`WaitPayload::Elapsed`]. `ticks == 0` returns
    /// `Ready` immediately.
    pub fn delay(&mut self, ticks: Ticks) -> Result<Poll<()>, DelayError> {
        let task = self.expect_waitable_context()?;
        if ticks == 0 {
            return Ok(Poll::Ready(()));
        }
        self.with_cpu_lock(|k| k.block(task.index(), WaitObject::Sleep, ticks));
        Ok(Poll::Pending)
    }

    /// Change the remaining ticks of a task in the delay list. This applies
    /// to sleeping tasks and to tasks in a wait with a timeout.
    ///
    /// `ticks == 0` expires the delay immediately.
    pub fn reset_delay(&mut self, task: TaskId, ticks: Ticks) -> Result<(), ResetDelayError> {
        self.with_cpu_lock(|k| {
            let i = k.check_task(task)?;
            if !k.remove_delay(i) {
                return Err(ResetDelayError::NotInDelayList);
            }

            if ticks == 0 {
                k.expire_wait(i);
            } else {
                delay_list_accessor!(k).insert(i, ticks);
            }
            Ok(())
        })
    }

    /// Get the number of ticks until the task's delay expires.
    pub fn remaining_delay(&mut self, task: TaskId) -> Option<Ticks> {
        let i = task.index();
        if i >= TASKS {
            return None;
        }
        delay_list_accessor!(self).remaining(i).ok()
    }

    /// Insert a task into the delay list.
    pub(crate) fn insert_delay(&mut self, task: usize, ticks: Ticks) {
        delay_list_accessor!(self).insert(task, ticks);
    }

    /// Remove a task from the delay list. Returns `false` if the task wasn't
    /// in the delay list.
    pub(crate) fn remove_delay(&mut self, task: usize) -> bool {
        delay_list_accessor!(self).remove(task).is_ok()
    }

    /// Decrement the first entry of the delay list. Returns `true` if it has
    /// expired.
    pub(crate) fn tick_delay_list(&mut self) -> bool {
        let mut accessor = delay_list_accessor!(self);
        accessor.tick();
        accessor.is_front_expired()
    }

    fn pop_expired_delay(&mut self) -> Option<usize> {
        delay_list_accessor!(self).pop_expired()
    }

    /// Wake up every task whose delay has expired.
    pub(crate) fn dispose_delays(&mut self) {
        self.with_cpu_lock(|k| {
            while let Some(i) = k.pop_expired_delay() {
                k.expire_wait(i);
            }
        });
    }

    /// Complete the wait of a task that has just been removed from the delay
    /// list.
    fn expire_wait(&mut self, task: usize) {
        let result = match self.tasks[task].wait.object {
            Some(WaitObject::Sleep) => Ok(WaitPayload::Elapsed),
            Some(_) => {
                self.unlink_waiter(task);
                Err(WaitError::Timeout)
            }
            None => {
                debug_assert!(false, "task {} is in the delay list but not waiting", task);
                return;
            }
        };
        log::trace!("task {} delay expired: {:?}", task, result);
        self.complete_wait(task, result);
    }
}
