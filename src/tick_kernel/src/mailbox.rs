//! Single-slot mailboxes
use crate::{
    error::{AcceptError, BadIdError, CreateEventError, DeleteEventError, SignalError, WaitEventError},
    event::{DeleteOption, EventBody, MailboxId},
    wait::{QueueOrder, WaitPayload},
    Kernel, Message, Poll, Port, Ticks,
};

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    fn check_mailbox(&self, id: MailboxId) -> Result<usize, BadIdError> {
        self.check_event(id.0, |body| matches!(body, EventBody::Mailbox { .. }))
    }

    /// Create an empty mailbox.
    pub fn create_mailbox(&mut self, order: QueueOrder) -> Result<MailboxId, CreateEventError> {
        self.with_cpu_lock(|k| {
            let i = k.create_event(EventBody::Mailbox { message: None }, order)?;
            Ok(MailboxId(i))
        })
    }

    /// Delete a mailbox. A message left in the mailbox is discarded.
    pub fn delete_mailbox(
        &mut self,
        id: MailboxId,
        option: DeleteOption,
    ) -> Result<(), DeleteEventError> {
        self.with_cpu_lock(|k| {
            let i = k.check_mailbox(id)?;
            k.delete_event(i, option)?;
            Ok(())
        })
    }

    /// Post a message. If tasks are waiting, the message is delivered to the
    /// first one directly. Fails with `Full` if the mailbox already holds a
    /// message.
    pub fn post_mail(&mut self, id: MailboxId, message: Message) -> Result<(), SignalError> {
        self.with_cpu_lock(|k| {
            let i = k.check_mailbox(id)?;
            if let Some(task) = k.pop_event_waiter(i) {
                k.complete_wait(task, Ok(WaitPayload::Message(message)));
                return Ok(());
            }

            match &mut k.events.cbs[i].body {
                EventBody::Mailbox { message: slot @ None } => {
                    *slot = Some(message);
                    Ok(())
                }
                EventBody::Mailbox { .. } => Err(SignalError::Full),
                _ => Err(SignalError::InvalidId),
            }
        })
    }

    /// Take the message if there's one.
    pub fn accept_mail(&mut self, id: MailboxId) -> Result<Message, AcceptError> {
        self.with_cpu_lock(|k| {
            let i = k.check_mailbox(id)?;
            k.take_mail(i).ok_or(AcceptError::Empty)
        })
    }

    /// Take the message, blocking the running task if the mailbox is empty.
    ///
    /// `timeout == 0` waits forever. On `Pending`, the outcome is
    /// [`WaitPayload::Message`] or an error.
    pub fn wait_mail(
        &mut self,
        id: MailboxId,
        timeout: Ticks,
    ) -> Result<Poll<Message>, WaitEventError> {
        self.expect_task_context()?;
        self.with_cpu_lock(|k| {
            let i = k.check_mailbox(id)?;
            if let Some(message) = k.take_mail(i) {
                return Ok(Poll::Ready(message));
            }
            k.wait_event::<WaitEventError>(i, timeout)?;
            Ok(Poll::Pending)
        })
    }

    fn take_mail(&mut self, i: usize) -> Option<Message> {
        match &mut self.events.cbs[i].body {
            EventBody::Mailbox { message } => message.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use crate::*;

    #[test]
    fn single_slot() {
        let mut k = new_kernel();
        let mbox = k.create_mailbox(QueueOrder::Fifo).unwrap();
        assert_eq!(k.accept_mail(mbox), Err(AcceptError::Empty));

        k.post_mail(mbox, 0x1234).unwrap();
        assert_eq!(k.post_mail(mbox, 0x5678), Err(SignalError::Full));

        let task = k.create_task(1).unwrap();
        assert_eq!(k.run(task).wait_mail(mbox, 0), Ok(Poll::Ready(0x1234)));
        assert_eq!(k.accept_mail(mbox), Err(AcceptError::Empty));
    }

    #[test]
    fn post_delivers_to_waiter() {
        let mut k = new_kernel();
        let mbox = k.create_mailbox(QueueOrder::TaskPriority).unwrap();
        let a = k.create_task(2).unwrap();
        let b = k.create_task(0).unwrap();
        assert_eq!(k.run(a).wait_mail(mbox, 0), Ok(Poll::Pending));
        assert_eq!(k.run(b).wait_mail(mbox, 0), Ok(Poll::Pending));

        k.post_mail(mbox, 7).unwrap();
        k.post_mail(mbox, 8).unwrap();
        assert_eq!(k.drain_ready(), [b, a]);
        assert_eq!(k.take_wait_result(b), Some(Ok(WaitPayload::Message(7))));
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Message(8))));

        // Both messages went straight to the waiters
        assert_eq!(k.accept_mail(mbox), Err(AcceptError::Empty));
    }

    #[test]
    fn timed_wait_expires() {
        let mut k = new_kernel();
        let mbox = k.create_mailbox(QueueOrder::Fifo).unwrap();
        let a = k.create_task(1).unwrap();
        assert_eq!(k.run(a).wait_mail(mbox, 2), Ok(Poll::Pending));
        k.advance(2);
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Err(WaitError::Timeout)));

        // Nobody is waiting anymore
        k.post_mail(mbox, 1).unwrap();
        assert!(k.drain_ready().is_empty());
        assert_eq!(k.delete_mailbox(mbox, DeleteOption::ErrorIfPending), Ok(()));
    }
}
