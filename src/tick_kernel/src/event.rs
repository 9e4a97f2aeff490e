//! Event control blocks
//!
//! Semaphores, mailboxes, queues, and mutexes share one pool of control
//! blocks. An
//! unused control block stores the index of the next unused one in its body,
//! forming an intrusive free list.
use crate::{
    error::{BadIdError, CreateEventError, DeleteEventError, WaitError},
    heap::ArenaPtr,
    utils::{intrusive_list::ListHead, Init},
    wait::{QueueOrder, WaitObject},
    Kernel, Message, Port, Ticks,
};

macro_rules! define_event_id {
    ($( $( #[$meta:meta] )* $name:ident ),* $(,)?) => {$(
        $( #[$meta] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) usize);

        impl $name {
            /// Construct an identifier from a control block index.
            pub const fn new(index: usize) -> Self {
                Self(index)
            }

            /// Get the control block index.
            pub const fn index(self) -> usize {
                self.0
            }
        }
    )*};
}

define_event_id! {
    /// Identifies a semaphore.
    SemaphoreId,
    /// Identifies a mailbox.
    MailboxId,
    /// Identifies a message queue.
    QueueId,
    /// Identifies a mutex.
    MutexId,
}

/// Specifies what the deletion of an object does when tasks are waiting on
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteOption {
    /// Fail with `TasksWaiting`.
    ErrorIfPending,
    /// Wake up every waiting task with [`WaitError::Deleted`].
    ForceWakeAll,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum EventBody {
    Free {
        next_free: Option<usize>,
    },
    Semaphore {
        count: u32,
        max: u32,
    },
    Mailbox {
        message: Option<Message>,
    },
    Queue {
        /// A block of `capacity` words in the arena.
        storage: ArenaPtr,
        capacity: usize,
        /// The index of the oldest message in `storage`.
        head: usize,
        len: usize,
    },
    Mutex {
        /// The task holding the mutex.
        owner: Option<usize>,
    },
}

/// *Event control block*.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EventCb {
    pub(crate) body: EventBody,
    pub(crate) order: QueueOrder,
    pub(crate) waiters: ListHead<usize>,
}

impl Init for EventCb {
    const INIT: Self = Self {
        body: EventBody::Free { next_free: None },
        order: QueueOrder::Fifo,
        waiters: ListHead::INIT,
    };
}

pub(crate) struct EventTable<const N: usize> {
    pub(crate) cbs: [EventCb; N],
    free_head: Option<usize>,
}

impl<const N: usize> EventTable<N> {
    pub(crate) fn new() -> Self {
        Self {
            cbs: core::array::from_fn(|i| EventCb {
                body: EventBody::Free {
                    next_free: (i + 1 < N).then(|| i + 1),
                },
                ..EventCb::INIT
            }),
            free_head: (N > 0).then(|| 0),
        }
    }

    fn alloc(&mut self, body: EventBody, order: QueueOrder) -> Option<usize> {
        let i = self.free_head?;
        self.free_head = match self.cbs[i].body {
            EventBody::Free { next_free } => next_free,
            _ => unreachable!("event {} is in the free list but in use", i),
        };
        self.cbs[i] = EventCb {
            body,
            order,
            waiters: ListHead::INIT,
        };
        Some(i)
    }

    fn free(&mut self, i: usize) {
        debug_assert!(self.cbs[i].waiters.is_empty());
        self.cbs[i].body = EventBody::Free {
            next_free: self.free_head,
        };
        self.free_head = Some(i);
    }

    /// Get the number of unused control blocks.
    pub(crate) fn free_count(&self) -> usize {
        core::iter::successors(self.free_head, |&i| match self.cbs[i].body {
            EventBody::Free { next_free } => next_free,
            _ => None,
        })
        .count()
    }
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    /// Validate an event control block index. `is_kind` checks that the
    /// control block is of the kind the identifier refers to.
    pub(crate) fn check_event(
        &self,
        i: usize,
        is_kind: impl FnOnce(&EventBody) -> bool,
    ) -> Result<usize, BadIdError> {
        if cfg!(feature = "check_params") {
            match self.events.cbs.get(i) {
                Some(cb) if is_kind(&cb.body) => Ok(i),
                _ => Err(BadIdError::InvalidId),
            }
        } else {
            debug_assert!(is_kind(&self.events.cbs[i].body), "invalid event {}", i);
            Ok(i)
        }
    }

    pub(crate) fn create_event(
        &mut self,
        body: EventBody,
        order: QueueOrder,
    ) -> Result<usize, CreateEventError> {
        let i = self
            .events
            .alloc(body, order)
            .ok_or(CreateEventError::Exhausted)?;
        log::trace!("created event {}: {:?}", i, body);
        Ok(i)
    }

    /// Release an event control block, waking up the waiting tasks according
    /// to `option`. Returns the body the control block had, so that the
    /// caller can release the resources it refers to.
    pub(crate) fn delete_event(
        &mut self,
        i: usize,
        option: DeleteOption,
    ) -> Result<EventBody, DeleteEventError> {
        if !self.events.cbs[i].waiters.is_empty() {
            if option == DeleteOption::ErrorIfPending {
                return Err(DeleteEventError::TasksWaiting);
            }
            while let Some(task) = self.pop_event_waiter(i) {
                self.complete_wait(task, Err(WaitError::Deleted));
            }
        }

        let body = self.events.cbs[i].body;
        self.events.free(i);
        log::trace!("deleted event {}", i);
        Ok(body)
    }

    /// Block the running task on an event. The caller has checked that the
    /// event has nothing to take.
    pub(crate) fn wait_event<E>(&mut self, i: usize, timeout: Ticks) -> Result<(), E>
    where
        E: From<crate::error::BadContextError>,
    {
        let task = self.expect_waitable_context()?;
        self.block(task.index(), WaitObject::Event(i), timeout);
        Ok(())
    }

    /// Get the number of unused event control blocks.
    pub fn free_event_count(&self) -> usize {
        self.events.free_count()
    }
}
