//! Bounded message queues
//!
//! A queue is a ring buffer of `capacity` messages whose storage is
//! allocated from the kernel's arena when the queue is created and released
//! when it's deleted.
use core::mem::size_of;

use crate::{
    error::{AcceptError, BadIdError, CreateEventError, DeleteEventError, SignalError, WaitEventError},
    event::{DeleteOption, EventBody, QueueId},
    wait::{QueueOrder, WaitPayload},
    Kernel, Message, Poll, Port, Ticks,
};

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    fn check_queue(&self, id: QueueId) -> Result<usize, BadIdError> {
        self.check_event(id.0, |body| matches!(body, EventBody::Queue { .. }))
    }

    /// Create an empty queue that can hold `capacity` messages.
    pub fn create_queue(
        &mut self,
        capacity: usize,
        order: QueueOrder,
    ) -> Result<QueueId, CreateEventError> {
        if capacity == 0 {
            return Err(CreateEventError::BadParam);
        }
        let bytes = capacity
            .checked_mul(size_of::<Message>())
            .ok_or(CreateEventError::OutOfMemory)?;

        self.with_cpu_lock(|k| {
            if k.events.free_count() == 0 {
                return Err(CreateEventError::Exhausted);
            }
            let storage = k.heap.alloc(bytes)?;
            let body = EventBody::Queue {
                storage,
                capacity,
                head: 0,
                len: 0,
            };
            let i = k.create_event(body, order)?;
            Ok(QueueId(i))
        })
    }

    /// Delete a queue and release its storage. Messages left in the queue are
    /// discarded.
    pub fn delete_queue(&mut self, id: QueueId, option: DeleteOption) -> Result<(), DeleteEventError> {
        self.with_cpu_lock(|k| {
            let i = k.check_queue(id)?;
            if let EventBody::Queue { storage, .. } = k.delete_event(i, option)? {
                let result = k.heap.free(storage);
                debug_assert!(result.is_ok(), "queue storage {:?} was freed", storage);
            }
            Ok(())
        })
    }

    /// Append a message. If tasks are waiting, the message is delivered to
    /// the first one directly.
    pub fn post_queue(&mut self, id: QueueId, message: Message) -> Result<(), SignalError> {
        self.with_cpu_lock(|k| {
            let i = k.check_queue(id)?;
            if let Some(task) = k.pop_event_waiter(i) {
                k.complete_wait(task, Ok(WaitPayload::Message(message)));
                return Ok(());
            }

            let EventBody::Queue {
                storage,
                capacity,
                head,
                len,
            } = k.events.cbs[i].body
            else {
                return Err(SignalError::InvalidId);
            };
            if len == capacity {
                return Err(SignalError::Full);
            }

            // Store the message before the ring accounts for it
            let words = k
                .heap
                .payload_mut(storage)
                .map_err(|_| SignalError::InvalidId)?;
            words[(head + len) % capacity] = message;
            if let EventBody::Queue { len, .. } = &mut k.events.cbs[i].body {
                *len += 1;
            }
            Ok(())
        })
    }

    /// Take the oldest message if there's one.
    pub fn accept_queue(&mut self, id: QueueId) -> Result<Message, AcceptError> {
        self.with_cpu_lock(|k| {
            let i = k.check_queue(id)?;
            k.take_message(i).ok_or(AcceptError::Empty)
        })
    }

    /// Take the oldest message, blocking the running task if the queue is
    /// empty.
    ///
    /// `timeout == 0` waits forever. On `Pending`, the outcome is
    /// [`WaitPayload::Message`] or an error.
    pub fn wait_queue(&mut self, id: QueueId, timeout: Ticks) -> Result<Poll<Message>, WaitEventError> {
        self.expect_task_context()?;
        self.with_cpu_lock(|k| {
            let i = k.check_queue(id)?;
            if let Some(message) = k.take_message(i) {
                return Ok(Poll::Ready(message));
            }
            k.wait_event::<WaitEventError>(i, timeout)?;
            Ok(Poll::Pending)
        })
    }

    /// Get the number of messages in a queue.
    pub fn queue_len(&self, id: QueueId) -> Result<usize, BadIdError> {
        let i = self.check_queue(id)?;
        match self.events.cbs[i].body {
            EventBody::Queue { len, .. } => Ok(len),
            _ => Err(BadIdError::InvalidId),
        }
    }

    fn take_message(&mut self, i: usize) -> Option<Message> {
        let EventBody::Queue {
            storage,
            capacity,
            head,
            len,
        } = self.events.cbs[i].body
        else {
            return None;
        };
        if len == 0 {
            return None;
        }
        let message = self.heap.payload(storage).ok()?[head];

        if let EventBody::Queue { head, len, .. } = &mut self.events.cbs[i].body {
            *head = (*head + 1) % capacity;
            *len -= 1;
        }
        Some(message)
    }
}
