//! Service requests from interrupt handlers
//!
//! An interrupt handler may post to a semaphore, a mailbox, a queue, or a
//! flag at any time. If the kernel isn't locked, the operation is performed
//! right away. Otherwise it's recorded in a bounded queue and performed when
//! the lock is released.
use arrayvec::ArrayVec;

use crate::{
    error::{IsrFlagError, IsrPostError, ResultCode},
    event::{EventBody, MailboxId, QueueId, SemaphoreId},
    flag::FlagId,
    utils::Init,
    Kernel, Message, Port,
};

/// The capacity of the service request queue.
pub const SERVICE_QUEUE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceRequest {
    SignalSemaphore(SemaphoreId),
    PostMail(MailboxId, Message),
    PostQueue(QueueId, Message),
    SetFlag(FlagId),
}

#[derive(Debug)]
pub(crate) struct ServiceQueue {
    requests: ArrayVec<ServiceRequest, SERVICE_QUEUE_LEN>,
}

impl Init for ServiceQueue {
    const INIT: Self = Self {
        requests: ArrayVec::INIT,
    };
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    /// Queue `request` for later. Fails if the queue is full.
    fn defer_request(&mut self, request: ServiceRequest) -> bool {
        log::trace!("deferring {:?}", request);
        self.service_queue.requests.try_push(request).is_ok()
    }

    /// Perform the oldest queued request. Returns `false` if the queue was
    /// empty.
    pub(crate) fn respond_service_request(&mut self) -> bool {
        if self.service_queue.requests.is_empty() {
            return false;
        }
        let request = self.service_queue.requests.remove(0);

        let result = match request {
            ServiceRequest::SignalSemaphore(id) => {
                self.signal_semaphore(id).map_err(ResultCode::from)
            }
            ServiceRequest::PostMail(id, message) => {
                self.post_mail(id, message).map_err(ResultCode::from)
            }
            ServiceRequest::PostQueue(id, message) => {
                self.post_queue(id, message).map_err(ResultCode::from)
            }
            ServiceRequest::SetFlag(id) => self.set_flag(id).map_err(ResultCode::from),
        };
        if let Err(e) = result {
            log::warn!("deferred {:?} failed: {:?}", request, e);
        }
        true
    }

    /// Get the number of requests waiting in the service request queue.
    pub fn pending_service_requests(&self) -> usize {
        self.service_queue.requests.len()
    }

    /// [`Self::signal_semaphore`] for interrupt handlers.
    ///
    /// The identifier is validated right away, but a deferred request can
    /// still fail with `Full` when it's performed. Such failures are only
    /// logged.
    pub fn isr_signal_semaphore(&mut self, id: SemaphoreId) -> Result<(), IsrPostError> {
        if !self.is_locked() {
            return Ok(self.signal_semaphore(id)?);
        }
        self.check_event(id.0, |body| matches!(body, EventBody::Semaphore { .. }))
            .map_err(IsrPostError::from)?;
        if self.defer_request(ServiceRequest::SignalSemaphore(id)) {
            Ok(())
        } else {
            Err(IsrPostError::ServiceQueueFull)
        }
    }

    /// [`Self::post_mail`] for interrupt handlers.
    pub fn isr_post_mail(&mut self, id: MailboxId, message: Message) -> Result<(), IsrPostError> {
        if !self.is_locked() {
            return Ok(self.post_mail(id, message)?);
        }
        self.check_event(id.0, |body| matches!(body, EventBody::Mailbox { .. }))
            .map_err(IsrPostError::from)?;
        if self.defer_request(ServiceRequest::PostMail(id, message)) {
            Ok(())
        } else {
            Err(IsrPostError::ServiceQueueFull)
        }
    }

    /// [`Self::post_queue`] for interrupt handlers.
    pub fn isr_post_queue(&mut self, id: QueueId, message: Message) -> Result<(), IsrPostError> {
        if !self.is_locked() {
            return Ok(self.post_queue(id, message)?);
        }
        self.check_event(id.0, |body| matches!(body, EventBody::Queue { .. }))
            .map_err(IsrPostError::from)?;
        if self.defer_request(ServiceRequest::PostQueue(id, message)) {
            Ok(())
        } else {
            Err(IsrPostError::ServiceQueueFull)
        }
    }

    /// [`Self::set_flag`] for interrupt handlers.
    pub fn isr_set_flag(&mut self, id: FlagId) -> Result<(), IsrFlagError> {
        if !self.is_locked() {
            return Ok(self.set_flag(id)?);
        }
        self.is_flag_set(id)?;
        if self.defer_request(ServiceRequest::SetFlag(id)) {
            Ok(())
        } else {
            Err(IsrFlagError::ServiceQueueFull)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use crate::*;

    #[test]
    fn immediate_when_unlocked() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 1, QueueOrder::Fifo).unwrap();
        k.enter_interrupt().unwrap();
        k.isr_signal_semaphore(sem).unwrap();
        assert_eq!(k.isr_signal_semaphore(sem), Err(IsrPostError::Full));
        k.exit_interrupt().unwrap();
        assert_eq!(k.semaphore_count(sem), Ok(1));
        assert_eq!(k.pending_service_requests(), 0);
    }

    #[test]
    fn deferred_while_scheduler_locked() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 5, QueueOrder::Fifo).unwrap();
        let mbox = k.create_mailbox(QueueOrder::Fifo).unwrap();
        let queue = k.create_queue(2, QueueOrder::Fifo).unwrap();
        let flag = k.create_flag(false, false).unwrap();
        let a = k.create_task(1).unwrap();
        assert_eq!(k.run(a).wait_mail(mbox, 0), Ok(Poll::Pending));

        k.lock_scheduler().unwrap();
        k.enter_interrupt().unwrap();
        k.isr_signal_semaphore(sem).unwrap();
        k.isr_post_mail(mbox, 42).unwrap();
        k.isr_post_queue(queue, 1).unwrap();
        k.isr_post_queue(queue, 2).unwrap();
        k.isr_set_flag(flag).unwrap();
        k.exit_interrupt().unwrap();

        assert_eq!(k.pending_service_requests(), 5);
        assert!(k.drain_ready().is_empty());
        assert_eq!(k.semaphore_count(sem), Ok(0));

        k.unlock_scheduler().unwrap();
        assert_eq!(k.pending_service_requests(), 0);
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Message(42))));
        assert_eq!(k.semaphore_count(sem), Ok(1));
        assert_eq!(k.queue_len(queue), Ok(2));
        assert_eq!(k.is_flag_set(flag), Ok(true));
    }

    #[test]
    fn queue_overflow() {
        let mut k = new_kernel();
        let sem = k.create_semaphore(0, 100, QueueOrder::Fifo).unwrap();
        let flag = k.create_flag(false, false).unwrap();

        k.lock_scheduler().unwrap();
        for _ in 0..SERVICE_QUEUE_LEN {
            k.isr_signal_semaphore(sem).unwrap();
        }
        assert_eq!(
            k.isr_signal_semaphore(sem),
            Err(IsrPostError::ServiceQueueFull)
        );
        assert_eq!(k.isr_set_flag(flag), Err(IsrFlagError::ServiceQueueFull));
        k.unlock_scheduler().unwrap();

        assert_eq!(k.semaphore_count(sem), Ok(SERVICE_QUEUE_LEN as u32));
    }

    #[test]
    fn deferred_failures_are_dropped() {
        let mut k = new_kernel();
        let mbox = k.create_mailbox(QueueOrder::Fifo).unwrap();
        k.lock_scheduler().unwrap();
        k.isr_post_mail(mbox, 1).unwrap();
        // Accepted now, fails with `Full` when performed
        k.isr_post_mail(mbox, 2).unwrap();
        k.unlock_scheduler().unwrap();

        assert_eq!(k.pending_service_requests(), 0);
        assert_eq!(k.accept_mail(mbox), Ok(1));
    }

    #[cfg(feature = "check_params")]
    #[test]
    fn invalid_ids_rejected_before_deferral() {
        let mut k = new_kernel();
        k.lock_scheduler().unwrap();
        assert_eq!(
            k.isr_signal_semaphore(SemaphoreId::new(3)),
            Err(IsrPostError::InvalidId)
        );
        assert_eq!(k.isr_set_flag(FlagId::new(3)), Err(IsrFlagError::InvalidId));
        assert_eq!(k.pending_service_requests(), 0);
        k.unlock_scheduler().unwrap();
    }
}
