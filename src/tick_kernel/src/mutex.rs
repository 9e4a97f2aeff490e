//! Mutexes with priority inheritance
//!
//! A mutex is an event control block whose body records the owning task.
//! While tasks are waiting on a mutex, its owner runs at the highest
//! priority among them (or its own base priority if that's higher). The
//! raise propagates along chains of owners waiting on other mutexes.
//!
//! The effective priority of a task is always recomputed from scratch: its
//! base priority combined with the waiters of every mutex it owns. This is
//! done whenever a waiter arrives or leaves and whenever the ownership of a
//! mutex changes.
use crate::{
    error::{
        BadIdError, CreateEventError, DeleteEventError, LockMutexError, TryLockMutexError,
        UnlockMutexError,
    },
    event::{DeleteOption, EventBody, MutexId},
    task::{Priority, TaskId},
    wait::{wait_list_accessor, QueueOrder, WaitObject, WaitPayload},
    Kernel, Poll, Port, Ticks,
};

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    fn check_mutex(&self, id: MutexId) -> Result<usize, BadIdError> {
        self.check_event(id.0, |body| matches!(body, EventBody::Mutex { .. }))
    }

    fn mutex_owner_index(&self, i: usize) -> Option<usize> {
        match self.events.cbs[i].body {
            EventBody::Mutex { owner } => owner,
            _ => None,
        }
    }

    fn set_mutex_owner(&mut self, i: usize, task: Option<usize>) {
        if let EventBody::Mutex { owner } = &mut self.events.cbs[i].body {
            *owner = task;
        }
    }

    /// Create an unowned mutex. `order` decides which waiter receives the
    /// mutex when it's unlocked.
    pub fn create_mutex(&mut self, order: QueueOrder) -> Result<MutexId, CreateEventError> {
        self.with_cpu_lock(|k| {
            let i = k.create_event(EventBody::Mutex { owner: None }, order)?;
            Ok(MutexId(i))
        })
    }

    /// Delete a mutex. The owner, if any, loses the priority it inherited
    /// through the mutex.
    pub fn delete_mutex(&mut self, id: MutexId, option: DeleteOption) -> Result<(), DeleteEventError> {
        self.with_cpu_lock(|k| {
            let i = k.check_mutex(id)?;
            if let EventBody::Mutex { owner: Some(owner) } = k.delete_event(i, option)? {
                k.update_effective_priority(owner);
            }
            Ok(())
        })
    }

    /// Acquire a mutex, blocking the running task if another task owns it.
    ///
    /// `timeout == 0` waits forever. On `Pending`, the owner inherits the
    /// running task's priority if it's higher, and the outcome is
    /// [`WaitPayload::Mutex`] (the mutex now belongs to the task) or an
    /// error.
    pub fn lock_mutex(&mut self, id: MutexId, timeout: Ticks) -> Result<Poll<()>, LockMutexError> {
        self.expect_task_context()?;
        self.with_cpu_lock(|k| {
            let i = k.check_mutex(id)?;
            let task = k
                .port
                .running_task()
                .ok_or(LockMutexError::CalledFromInterrupt)?
                .index();

            match k.mutex_owner_index(i) {
                None => {
                    k.set_mutex_owner(i, Some(task));
                    log::trace!("task {} locked mutex {}", task, i);
                    Ok(Poll::Ready(()))
                }
                Some(owner) if owner == task => Err(LockMutexError::BadContext),
                Some(owner) => {
                    k.wait_event::<LockMutexError>(i, timeout)?;
                    k.update_effective_priority(owner);
                    Ok(Poll::Pending)
                }
            }
        })
    }

    /// Acquire a mutex if no task owns it.
    pub fn try_lock_mutex(&mut self, id: MutexId) -> Result<(), TryLockMutexError> {
        self.expect_task_context()
            .map_err(|_| TryLockMutexError::CalledFromInterrupt)?;
        self.with_cpu_lock(|k| {
            let i = k.check_mutex(id)?;
            let task = k
                .port
                .running_task()
                .ok_or(TryLockMutexError::CalledFromInterrupt)?
                .index();

            match k.mutex_owner_index(i) {
                None => {
                    k.set_mutex_owner(i, Some(task));
                    Ok(())
                }
                Some(owner) if owner == task => Err(TryLockMutexError::BadContext),
                Some(_) => Err(TryLockMutexError::NotReady),
            }
        })
    }

    /// Release a mutex owned by the running task. The first waiter, if any,
    /// becomes the new owner. The running task drops back to the priority
    /// its other mutexes call for.
    pub fn unlock_mutex(&mut self, id: MutexId) -> Result<(), UnlockMutexError> {
        self.expect_task_context()
            .map_err(|_| UnlockMutexError::CalledFromInterrupt)?;
        self.with_cpu_lock(|k| {
            let i = k.check_mutex(id)?;
            let task = k
                .port
                .running_task()
                .ok_or(UnlockMutexError::CalledFromInterrupt)?
                .index();
            if k.mutex_owner_index(i) != Some(task) {
                return Err(UnlockMutexError::BadContext);
            }

            k.hand_over_mutex(i);
            k.update_effective_priority(task);
            Ok(())
        })
    }

    /// Get the task owning a mutex.
    pub fn mutex_owner(&self, id: MutexId) -> Result<Option<TaskId>, BadIdError> {
        let i = self.check_mutex(id)?;
        Ok(self.mutex_owner_index(i).map(TaskId::new))
    }

    /// Give a mutex to its first waiter, or leave it unowned if there's none.
    fn hand_over_mutex(&mut self, i: usize) {
        let next = self.pop_event_waiter(i);
        self.set_mutex_owner(i, next);
        if let Some(next) = next {
            log::trace!("mutex {} handed over to task {}", i, next);
            self.complete_wait(next, Ok(WaitPayload::Mutex));
            // Inherit from the remaining waiters
            self.update_effective_priority(next);
        }
    }

    /// Hand over every mutex owned by `task`, which is being deleted.
    pub(crate) fn release_mutexes_of(&mut self, task: usize) {
        for i in 0..EVENTS {
            if self.mutex_owner_index(i) == Some(task) {
                self.hand_over_mutex(i);
            }
        }
    }

    /// Compute the priority `task` should run at: its base priority, raised
    /// to that of the most urgent waiter of any mutex it owns.
    fn inherited_priority(&mut self, task: usize) -> Priority {
        let mut priority = self.tasks[task].base_priority;
        for i in 0..EVENTS {
            if self.mutex_owner_index(i) != Some(task) {
                continue;
            }
            let mut accessor =
                wait_list_accessor!(&mut self.events.cbs[i].waiters, &mut self.tasks[..]);
            let mut cursor = accessor.front();
            while let Some(waiter) = cursor {
                priority = priority.min(accessor[waiter].priority);
                cursor = accessor.next(waiter).ok().flatten();
            }
        }
        priority
    }

    /// Bring the effective priority of `task` up to date and propagate the
    /// change to the owner of the mutex `task` is waiting on, if any.
    pub(crate) fn update_effective_priority(&mut self, task: usize) {
        let mut cursor = Some(task);
        // A chain can't be longer than the task table, even if the
        // application has deadlocked a cycle of tasks
        for _ in 0..TASKS {
            let Some(task) = cursor.take() else {
                break;
            };
            let priority = self.inherited_priority(task);
            if priority == self.tasks[task].priority {
                break;
            }

            log::trace!(
                "task {} priority {} -> {}",
                task,
                self.tasks[task].priority,
                priority
            );
            self.tasks[task].priority = priority;
            self.requeue_waiter(task);
            self.port.set_priority(TaskId::new(task), priority);

            if let Some(WaitObject::Event(i)) = self.tasks[task].wait.object {
                cursor = self.mutex_owner_index(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use crate::*;

    #[test]
    fn ownership_is_handed_over() {
        let mut k = new_kernel();
        let mutex = k.create_mutex(QueueOrder::Fifo).unwrap();
        let a = k.create_task(2).unwrap();
        let b = k.create_task(2).unwrap();
        let c = k.create_task(2).unwrap();

        assert_eq!(k.run(a).lock_mutex(mutex, 0), Ok(Poll::Ready(())));
        assert_eq!(k.mutex_owner(mutex), Ok(Some(a)));
        assert_eq!(k.run(b).lock_mutex(mutex, 0), Ok(Poll::Pending));
        assert_eq!(k.run(c).lock_mutex(mutex, 0), Ok(Poll::Pending));

        k.run(a).unlock_mutex(mutex).unwrap();
        assert_eq!(k.drain_ready(), [b]);
        assert_eq!(k.take_wait_result(b), Some(Ok(WaitPayload::Mutex)));
        assert_eq!(k.mutex_owner(mutex), Ok(Some(b)));

        k.run(b).unlock_mutex(mutex).unwrap();
        assert_eq!(k.drain_ready(), [c]);
        k.run(c).unlock_mutex(mutex).unwrap();
        assert_eq!(k.mutex_owner(mutex), Ok(None));
        assert!(k.drain_ready().is_empty());
    }

    #[test]
    fn owner_inherits_and_restores_priority() {
        let mut k = new_kernel();
        let mutex = k.create_mutex(QueueOrder::TaskPriority).unwrap();
        let low = k.create_task(5).unwrap();
        let mid = k.create_task(3).unwrap();
        let high = k.create_task(1).unwrap();

        k.run(low).lock_mutex(mutex, 0).unwrap();
        assert_eq!(k.run(mid).lock_mutex(mutex, 0), Ok(Poll::Pending));
        assert_eq!(k.task_priority(low), Ok(3));
        assert_eq!(k.run(high).lock_mutex(mutex, 0), Ok(Poll::Pending));
        assert_eq!(k.task_priority(low), Ok(1));
        assert_eq!(k.port().priorities, [(low, 3), (low, 1)]);

        // `high` is first in line and takes over the inheritance from `mid`
        k.run(low).unlock_mutex(mutex).unwrap();
        assert_eq!(k.task_priority(low), Ok(5));
        assert_eq!(k.drain_ready(), [high]);
        assert_eq!(k.mutex_owner(mutex), Ok(Some(high)));
        assert_eq!(k.task_priority(high), Ok(1));

        k.run(high).unlock_mutex(mutex).unwrap();
        assert_eq!(k.drain_ready(), [mid]);
        assert_eq!(k.task_priority(mid), Ok(3));
    }

    #[test]
    fn waiter_timeout_lowers_owner() {
        let mut k = new_kernel();
        let mutex = k.create_mutex(QueueOrder::Fifo).unwrap();
        let low = k.create_task(5).unwrap();
        let high = k.create_task(1).unwrap();

        k.run(low).lock_mutex(mutex, 0).unwrap();
        assert_eq!(k.run(high).lock_mutex(mutex, 3), Ok(Poll::Pending));
        assert_eq!(k.task_priority(low), Ok(1));

        k.advance(3);
        assert_eq!(k.drain_ready(), [high]);
        assert_eq!(k.take_wait_result(high), Some(Err(WaitError::Timeout)));
        assert_eq!(k.task_priority(low), Ok(5));
        assert_eq!(k.mutex_owner(mutex), Ok(Some(low)));
    }

    #[test]
    fn inheritance_follows_chains() {
        let mut k = new_kernel();
        let m1 = k.create_mutex(QueueOrder::Fifo).unwrap();
        let m2 = k.create_mutex(QueueOrder::Fifo).unwrap();
        let a = k.create_task(6).unwrap();
        let b = k.create_task(4).unwrap();
        let c = k.create_task(1).unwrap();

        // `b` owns `m2` and waits on `m1`, which `a` owns
        k.run(a).lock_mutex(m1, 0).unwrap();
        k.run(b).lock_mutex(m2, 0).unwrap();
        assert_eq!(k.run(b).lock_mutex(m1, 0), Ok(Poll::Pending));
        assert_eq!(k.task_priority(a), Ok(4));

        assert_eq!(k.run(c).lock_mutex(m2, 0), Ok(Poll::Pending));
        assert_eq!(k.task_priority(b), Ok(1));
        assert_eq!(k.task_priority(a), Ok(1));

        k.run(a).unlock_mutex(m1).unwrap();
        assert_eq!(k.task_priority(a), Ok(6));
        assert_eq!(k.drain_ready(), [b]);
        assert_eq!(k.task_priority(b), Ok(1));
    }

    #[test]
    fn ownership_rules() {
        let mut k = new_kernel();
        let mutex = k.create_mutex(QueueOrder::Fifo).unwrap();
        let a = k.create_task(2).unwrap();
        let b = k.create_task(2).unwrap();

        assert_eq!(k.run(a).unlock_mutex(mutex), Err(UnlockMutexError::BadContext));
        k.run(a).try_lock_mutex(mutex).unwrap();
        assert_eq!(k.run(a).try_lock_mutex(mutex), Err(TryLockMutexError::BadContext));
        assert_eq!(k.run(a).lock_mutex(mutex, 0), Err(LockMutexError::BadContext));
        assert_eq!(k.run(b).try_lock_mutex(mutex), Err(TryLockMutexError::NotReady));
        assert_eq!(k.run(b).unlock_mutex(mutex), Err(UnlockMutexError::BadContext));

        k.enter_interrupt().unwrap();
        assert_eq!(
            k.lock_mutex(mutex, 0),
            Err(LockMutexError::CalledFromInterrupt)
        );
        assert_eq!(
            k.unlock_mutex(mutex),
            Err(UnlockMutexError::CalledFromInterrupt)
        );
        k.exit_interrupt().unwrap();

        k.lock_scheduler().unwrap();
        assert_eq!(k.run(b).lock_mutex(mutex, 0), Err(LockMutexError::SchedulerLocked));
        k.unlock_scheduler().unwrap();
    }

    #[test]
    fn deleting_owner_hands_over() {
        let mut k = new_kernel();
        let mutex = k.create_mutex(QueueOrder::Fifo).unwrap();
        let a = k.create_task(5).unwrap();
        let b = k.create_task(1).unwrap();

        k.run(a).lock_mutex(mutex, 0).unwrap();
        assert_eq!(k.run(b).lock_mutex(mutex, 0), Ok(Poll::Pending));
        k.delete_task(a).unwrap();

        assert_eq!(k.drain_ready(), [b]);
        assert_eq!(k.mutex_owner(mutex), Ok(Some(b)));
        assert_eq!(k.take_wait_result(b), Some(Ok(WaitPayload::Mutex)));
    }

    #[test]
    fn delete_wakes_waiters_and_restores_owner() {
        let mut k = new_kernel();
        let mutex = k.create_mutex(QueueOrder::Fifo).unwrap();
        let low = k.create_task(5).unwrap();
        let high = k.create_task(1).unwrap();

        k.run(low).lock_mutex(mutex, 0).unwrap();
        let _ = k.run(high).lock_mutex(mutex, 0);
        assert_eq!(
            k.delete_mutex(mutex, DeleteOption::ErrorIfPending),
            Err(DeleteEventError::TasksWaiting)
        );
        k.delete_mutex(mutex, DeleteOption::ForceWakeAll).unwrap();

        assert_eq!(k.drain_ready(), [high]);
        assert_eq!(k.take_wait_result(high), Some(Err(WaitError::Deleted)));
        assert_eq!(k.task_priority(low), Ok(5));
        #[cfg(feature = "check_params")]
        assert_eq!(k.mutex_owner(mutex), Err(BadIdError::InvalidId));
    }

    #[test]
    fn raised_waiter_moves_up_in_priority_lists() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 1, QueueOrder::TaskPriority).unwrap();
        let mutex = k.create_mutex(QueueOrder::Fifo).unwrap();
        let owner = k.create_task(6).unwrap();
        let other = k.create_task(4).unwrap();
        let high = k.create_task(1).unwrap();

        // `owner` takes the mutex, then waits on the semaphore behind `other`
        k.run(owner).lock_mutex(mutex, 0).unwrap();
        assert_eq!(k.run(other).wait_semaphore(sem, 0), Ok(Poll::Pending));
        assert_eq!(k.run(owner).wait_semaphore(sem, 0), Ok(Poll::Pending));

        // Inheriting priority 1 puts `owner` ahead of `other`
        assert_eq!(k.run(high).lock_mutex(mutex, 0), Ok(Poll::Pending));
        k.signal_semaphore(sem).unwrap();
        assert_eq!(k.drain_ready(), [owner]);
    }
}
