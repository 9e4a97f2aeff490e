//! Counting semaphores
use crate::{
    error::{AcceptError, BadIdError, CreateEventError, DeleteEventError, SignalError, WaitEventError},
    event::{DeleteOption, EventBody, SemaphoreId},
    wait::{QueueOrder, WaitPayload},
    Kernel, Poll, Port, Ticks,
};

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    fn check_semaphore(&self, id: SemaphoreId) -> Result<usize, BadIdError> {
        self.check_event(id.0, |body| matches!(body, EventBody::Semaphore { .. }))
    }

    /// Create a semaphore holding `initial` permits, up to `max`.
    pub fn create_semaphore(
        &mut self,
        initial: u32,
        max: u32,
        order: QueueOrder,
    ) -> Result<SemaphoreId, CreateEventError> {
        if initial > max {
            return Err(CreateEventError::BadParam);
        }
        self.with_cpu_lock(|k| {
            let i = k.create_event(EventBody::Semaphore { count: initial, max }, order)?;
            Ok(SemaphoreId(i))
        })
    }

    /// Delete a semaphore.
    pub fn delete_semaphore(
        &mut self,
        id: SemaphoreId,
        option: DeleteOption,
    ) -> Result<(), DeleteEventError> {
        self.with_cpu_lock(|k| {
            let i = k.check_semaphore(id)?;
            k.delete_event(i, option)?;
            Ok(())
        })
    }

    /// Release a permit. If tasks are waiting, the permit is handed over to
    /// the first one directly and the count doesn't change.
    pub fn signal_semaphore(&mut self, id: SemaphoreId) -> Result<(), SignalError> {
        self.with_cpu_lock(|k| {
            let i = k.check_semaphore(id)?;
            if let Some(task) = k.pop_event_waiter(i) {
                k.complete_wait(task, Ok(WaitPayload::Semaphore));
                return Ok(());
            }

            match &mut k.events.cbs[i].body {
                EventBody::Semaphore { count, max } if *count < *max => {
                    *count += 1;
                    Ok(())
                }
                EventBody::Semaphore { .. } => Err(SignalError::Full),
                _ => Err(SignalError::InvalidId),
            }
        })
    }

    /// Take a permit if one is available.
    pub fn accept_semaphore(&mut self, id: SemaphoreId) -> Result<(), AcceptError> {
        self.with_cpu_lock(|k| {
            let i = k.check_semaphore(id)?;
            if k.take_permit(i) {
                Ok(())
            } else {
                Err(AcceptError::Empty)
            }
        })
    }

    /// Take a permit, blocking the running task if none is available.
    ///
    /// `timeout == 0` waits forever. On `Pending`, the outcome is
    /// [`WaitPayload::Semaphore`], [`WaitError::Timeout`], or
    /// [`WaitError::Deleted`].
    ///
    /// [`WaitError::Timeout`]: crate::WaitError::Timeout
    /// [`WaitError::Deleted`]: crate::WaitError::Deleted
    pub fn wait_semaphore(
        &mut self,
        id: SemaphoreId,
        timeout: Ticks,
    ) -> Result<Poll<()>, WaitEventError> {
        self.expect_task_context()?;
        self.with_cpu_lock(|k| {
            let i = k.check_semaphore(id)?;
            if k.take_permit(i) {
                return Ok(Poll::Ready(()));
            }
            k.wait_event::<WaitEventError>(i, timeout)?;
            Ok(Poll::Pending)
        })
    }

    /// Get the number of available permits.
    pub fn semaphore_count(&self, id: SemaphoreId) -> Result<u32, BadIdError> {
        let i = self.check_semaphore(id)?;
        match self.events.cbs[i].body {
            EventBody::Semaphore { count, .. } => Ok(count),
            _ => Err(BadIdError::InvalidId),
        }
    }

    fn take_permit(&mut self, i: usize) -> bool {
        match &mut self.events.cbs[i].body {
            EventBody::Semaphore { count, .. } if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use crate::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn signal_wakes_highest_priority_first() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 10, QueueOrder::TaskPriority).unwrap();
        let low = k.create_task(3).unwrap();
        let high = k.create_task(1).unwrap();

        assert_eq!(k.run(low).wait_semaphore(sem, 0), Ok(Poll::Pending));
        assert_eq!(k.run(high).wait_semaphore(sem, 0), Ok(Poll::Pending));

        k.signal_semaphore(sem).unwrap();
        assert_eq!(k.drain_ready(), [high]);
        assert_eq!(k.take_wait_result(high), Some(Ok(WaitPayload::Semaphore)));
        assert_eq!(k.take_wait_result(low), None);
        // The permit was handed over
        assert_eq!(k.semaphore_count(sem), Ok(0));

        k.signal_semaphore(sem).unwrap();
        assert_eq!(k.drain_ready(), [low]);
    }

    #[test]
    fn fifo_ignores_priority() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 10, QueueOrder::Fifo).unwrap();
        let low = k.create_task(3).unwrap();
        let high = k.create_task(1).unwrap();
        let _ = k.run(low).wait_semaphore(sem, 0);
        let _ = k.run(high).wait_semaphore(sem, 0);

        k.signal_semaphore(sem).unwrap();
        assert_eq!(k.drain_ready(), [low]);
    }

    #[test]
    fn count_limits() {
        let mut k = new_kernel();
        assert_eq!(
            k.create_semaphore(3, 2, QueueOrder::Fifo),
            Err(CreateEventError::BadParam)
        );

        let sem = k.create_semaphore(1, 2, QueueOrder::Fifo).unwrap();
        k.signal_semaphore(sem).unwrap();
        assert_eq!(k.signal_semaphore(sem), Err(SignalError::Full));
        assert_eq!(k.semaphore_count(sem), Ok(2));

        let task = k.create_task(1).unwrap();
        assert_eq!(k.run(task).wait_semaphore(sem, 0), Ok(Poll::Ready(())));
        k.accept_semaphore(sem).unwrap();
        assert_eq!(k.accept_semaphore(sem), Err(AcceptError::Empty));
    }

    #[test]
    fn timeout_removes_waiter() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 1, QueueOrder::Fifo).unwrap();
        let a = k.create_task(1).unwrap();
        let b = k.create_task(1).unwrap();
        let _ = k.run(a).wait_semaphore(sem, 3);
        let _ = k.run(b).wait_semaphore(sem, 0);

        k.advance(3);
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Err(WaitError::Timeout)));

        // `a` is gone from the wait list, so the permit goes to `b`
        k.signal_semaphore(sem).unwrap();
        assert_eq!(k.drain_ready(), [b]);
        assert_eq!(k.take_wait_result(b), Some(Ok(WaitPayload::Semaphore)));
    }

    #[test]
    fn signal_cancels_timeout() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 1, QueueOrder::Fifo).unwrap();
        let a = k.create_task(1).unwrap();
        let _ = k.run(a).wait_semaphore(sem, 3);
        k.signal_semaphore(sem).unwrap();
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.remaining_delay(a), None);

        // The expiry of the old timeout must not wake `a` again
        k.advance(5);
        assert!(k.drain_ready().is_empty());
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Semaphore)));
    }

    #[test]
    fn wait_rejected_outside_task_context() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 1, QueueOrder::Fifo).unwrap();
        assert_eq!(
            k.wait_semaphore(sem, 0),
            Err(WaitEventError::CalledFromInterrupt)
        );

        let a = k.create_task(1).unwrap();
        k.run(a).lock_scheduler().unwrap();
        assert_eq!(
            k.wait_semaphore(sem, 0),
            Err(WaitEventError::SchedulerLocked)
        );
        k.unlock_scheduler().unwrap();
    }

    /// Every successful take is backed by an initial permit or a signal.
    #[quickcheck]
    fn qc_conservation(initial: u8, cmds: Vec<u8>) {
        let mut k = new_kernel();
        let initial = u32::from(initial % 4);
        let sem = k
            .create_semaphore(initial, u32::MAX, QueueOrder::TaskPriority)
            .unwrap();
        let tasks: Vec<_> = (0..8).map(|i| k.create_task(i % 3).unwrap()).collect();
        let mut blocked = Vec::new();
        let mut signals = 0u32;
        let mut takes = 0u32;

        for cmd in cmds {
            let task = tasks[usize::from(cmd) % tasks.len()];
            if cmd & 0x80 != 0 {
                log::trace!("signal");
                k.signal_semaphore(sem).unwrap();
                signals += 1;
                for woken in k.drain_ready() {
                    assert_eq!(k.take_wait_result(woken), Some(Ok(WaitPayload::Semaphore)));
                    blocked.retain(|&t| t != woken);
                    takes += 1;
                }
            } else if !blocked.contains(&task) {
                log::trace!("{:?} waits", task);
                match k.run(task).wait_semaphore(sem, 0).unwrap() {
                    Poll::Ready(()) => takes += 1,
                    Poll::Pending => blocked.push(task),
                }
            }

            assert!(takes <= signals + initial);
            let count = k.semaphore_count(sem).unwrap();
            assert_eq!(takes + count, signals + initial);
            if count > 0 {
                assert!(blocked.is_empty());
            }
        }
    }
}
