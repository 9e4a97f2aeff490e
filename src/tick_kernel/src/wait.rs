//! Wait lists
//!
//! A task blocked on a semaphore, a mailbox, a queue, a mutex, or the flag
//! group is
//! linked into that object's wait list through [`TaskCb::wait_link`]. If the
//! wait has a timeout, the task is also in the delay list. Whichever of the
//! two wake-up paths runs first removes the task from both lists before
//! handing it to [`Port::make_ready`].
use crate::{
    error::WaitError,
    event::EventBody,
    flag::FlagWaitMode,
    task::{TaskCb, TaskId},
    utils::{intrusive_list::ListHead, Init},
    Kernel, Message, Port, Ticks,
};

/// Specifies the order in which a wait list is sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOrder {
    /// Tasks are woken in the order they started waiting.
    Fifo,
    /// Tasks with higher priorities are woken first. Tasks with the same
    /// priority are woken in the order they started waiting.
    TaskPriority,
}

/// The value delivered to a task whose wait completed normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPayload {
    /// A semaphore permit was handed over.
    Semaphore,
    /// A message was delivered by a mailbox or a queue.
    Message(Message),
    /// The flag wait was satisfied by the contained flags.
    Flags(u32),
    /// The ownership of a mutex was handed over.
    Mutex,
    /// The delay elapsed.
    Elapsed,
}

/// The object a task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitObject {
    /// [`Kernel::delay`]. The task is only in the delay list.
    Sleep,
    /// A semaphore, a mailbox, a queue, or a mutex.
    Event(usize),
    /// The flag group.
    Flags { mask: u32, mode: FlagWaitMode },
}

/// The wait state of a task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskWait {
    /// `Some(_)` while the task is blocked.
    pub(crate) object: Option<WaitObject>,
    /// The outcome of the last completed wait, not yet collected by
    /// [`Kernel::take_wait_result`].
    pub(crate) result: Option<Result<WaitPayload, WaitError>>,
}

impl Init for TaskWait {
    const INIT: Self = Self {
        object: None,
        result: None,
    };
}

/// Construct a `ListAccessor` for a wait list.
macro_rules! wait_list_accessor {
    ($head:expr, $tasks:expr) => {
        $crate::utils::intrusive_list::ListAccessor::new($head, $tasks, |cb| &mut cb.wait_link)
    };
}

pub(crate) use wait_list_accessor;

/// Link `task` into the wait list `head` according to `order`.
pub(crate) fn enqueue_waiter(
    head: &mut ListHead<usize>,
    tasks: &mut [TaskCb],
    task: usize,
    order: QueueOrder,
) {
    let priority = tasks[task].priority;
    let mut accessor = wait_list_accessor!(head, tasks);

    let at = match order {
        QueueOrder::Fifo => None,
        QueueOrder::TaskPriority => {
            // Insert before the first task with a strictly lower priority
            let mut cursor = accessor.front();
            while let Some(i) = cursor {
                if accessor[i].priority > priority {
                    break;
                }
                cursor = accessor.next(i).ok().flatten();
            }
            cursor
        }
    };

    let result = accessor.insert(task, at);
    debug_assert!(result.is_ok(), "task {} is already in a wait list", task);
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    /// Park `task` on `object`. A non-zero `timeout` also puts the task in
    /// the delay list.
    pub(crate) fn block(&mut self, task: usize, object: WaitObject, timeout: Ticks) {
        debug_assert!(self.tasks[task].wait.object.is_none());

        match object {
            WaitObject::Sleep => {}
            WaitObject::Event(i) => {
                let order = self.events.cbs[i].order;
                enqueue_waiter(&mut self.events.cbs[i].waiters, &mut self.tasks, task, order);
            }
            WaitObject::Flags { .. } => {
                let order = self.config.flag_wait_order;
                enqueue_waiter(&mut self.flags.waiters, &mut self.tasks, task, order);
            }
        }

        let wait = &mut self.tasks[task].wait;
        wait.object = Some(object);
        wait.result = None;

        if timeout > 0 {
            self.insert_delay(task, timeout);
        }
        log::trace!("task {} waits on {:?} (timeout = {})", task, object, timeout);
    }

    /// Remove `task` from the wait list of the object it's waiting on. The
    /// task is left in the delay list.
    pub(crate) fn unlink_waiter(&mut self, task: usize) {
        let head = match self.tasks[task].wait.object {
            Some(WaitObject::Event(i)) => &mut self.events.cbs[i].waiters,
            Some(WaitObject::Flags { .. }) => &mut self.flags.waiters,
            Some(WaitObject::Sleep) | None => return,
        };
        let result = wait_list_accessor!(head, &mut self.tasks[..]).remove(task);
        debug_assert!(result.is_ok());

        // The owner of a mutex may have inherited the priority of `task`
        if let Some(WaitObject::Event(i)) = self.tasks[task].wait.object {
            if let EventBody::Mutex { owner: Some(owner) } = self.events.cbs[i].body {
                self.update_effective_priority(owner);
            }
        }
    }

    /// Move a waiting task to the position its current priority calls for.
    /// Only priority-ordered wait lists are affected.
    pub(crate) fn requeue_waiter(&mut self, task: usize) {
        let (head, order) = match self.tasks[task].wait.object {
            Some(WaitObject::Event(i)) => {
                let cb = &mut self.events.cbs[i];
                (&mut cb.waiters, cb.order)
            }
            Some(WaitObject::Flags { .. }) => (&mut self.flags.waiters, self.config.flag_wait_order),
            Some(WaitObject::Sleep) | None => return,
        };
        if order == QueueOrder::Fifo {
            return;
        }
        let result = wait_list_accessor!(&mut *head, &mut self.tasks[..]).remove(task);
        debug_assert!(result.is_ok());
        enqueue_waiter(head, &mut self.tasks, task, order);
    }

    /// Remove the first task from the wait list of the event object `event`.
    pub(crate) fn pop_event_waiter(&mut self, event: usize) -> Option<usize> {
        wait_list_accessor!(&mut self.events.cbs[event].waiters, &mut self.tasks[..]).pop_front()
    }

    /// Finish the wait of `task`, which must have been removed from the wait
    /// list already, and hand it over to the port.
    pub(crate) fn complete_wait(&mut self, task: usize, result: Result<WaitPayload, WaitError>) {
        self.remove_delay(task);

        let wait = &mut self.tasks[task].wait;
        debug_assert!(wait.object.is_some());
        wait.object = None;
        wait.result = Some(result);

        log::trace!("task {} woken: {:?}", task, result);
        self.port.make_ready(TaskId::new(task));
    }

    /// [`Self::unlink_waiter`] followed by [`Self::complete_wait`].
    pub(crate) fn wake_waiter(&mut self, task: usize, result: Result<WaitPayload, WaitError>) {
        self.unlink_waiter(task);
        self.complete_wait(task, result);
    }

    /// Collect the outcome of the last wait operation of `task` that returned
    /// `Pending`. Returns `None` if the wait hasn't completed yet (or the
    /// outcome was already taken).
    pub fn take_wait_result(&mut self, task: TaskId) -> Option<Result<WaitPayload, WaitError>> {
        self.tasks.get_mut(task.index())?.wait.result.take()
    }
}
