//! Result codes and per-operation error types
use core::fmt;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use tick_kernel::ResultCode;
            /// assert_eq!(ResultCode::TasksWaiting.as_str(), "TasksWaiting");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Display for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that kernel operations can
    /// produce.
    ///
    /// Every per-operation error type shares its discriminants with this type,
    /// so an operation error can be converted to a `ResultCode` and compared
    /// numerically.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// A parameter is invalid in a way that is not covered by any other
        /// error codes.
        BadParam = -17,
        /// The specified object identifier is out of range or refers to an
        /// object that is not currently created.
        InvalidId = -18,
        /// The pointer does not refer to a block handed out by the allocator.
        InvalidPointer = -19,
        /// The kernel is not in a state that allows the operation, e.g.,
        /// releasing a lock that is not held.
        BadContext = -24,
        /// A blocking operation was invoked from an interrupt context (or from
        /// a context without a running task).
        CalledFromInterrupt = -25,
        /// A blocking operation was invoked while the scheduler lock is held.
        SchedulerLocked = -26,
        /// The allocator couldn't find a free block large enough.
        OutOfMemory = -33,
        /// A fixed pool has no free slot.
        Exhausted = -34,
        /// The task is not in the delay list.
        NotInDelayList = -41,
        /// The object cannot be deleted because tasks are waiting on it.
        TasksWaiting = -42,
        /// The object has reached its capacity.
        Full = -43,
        /// The object holds nothing to take.
        Empty = -44,
        /// The requested flags are not set, or the mutex is owned by another
        /// task.
        NotReady = -45,
        /// The deferred service request queue has no room for the request.
        ServiceQueueFull = -46,
        /// The wait operation timed out.
        Timeout = -50,
        /// The object being waited on was deleted.
        Deleted = -51,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Debug::fmt(&ResultCode::from(*self), f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $(
                        $name::$vname => Self::$vname,
                    )*
                }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname as i8,
                        $name::$vname as i8,
                    );
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

// Sub-errors first; `define_error!` can only refer to macros defined above it.

define_error! {
    mod bad_id_error {}
    /// The object identifier is invalid.
    pub enum BadIdError {
        InvalidId,
    }
}

define_error! {
    mod bad_context_error {}
    /// A blocking operation was invoked from a context that cannot block.
    pub enum BadContextError {
        /// The running task is already waiting.
        BadContext,
        CalledFromInterrupt,
        SchedulerLocked,
    }
}

define_error! {
    mod create_task_error {}
    /// Error type for [`Kernel::create_task`].
    ///
    /// [`Kernel::create_task`]: crate::Kernel::create_task
    pub enum CreateTaskError {
        /// All task control blocks are in use.
        Exhausted,
    }
}

define_error! {
    mod lock_error {}
    /// Error type for [`Kernel::lock_scheduler`], [`Kernel::unlock_scheduler`],
    /// [`Kernel::enter_interrupt`], and [`Kernel::exit_interrupt`].
    ///
    /// [`Kernel::lock_scheduler`]: crate::Kernel::lock_scheduler
    /// [`Kernel::unlock_scheduler`]: crate::Kernel::unlock_scheduler
    /// [`Kernel::enter_interrupt`]: crate::Kernel::enter_interrupt
    /// [`Kernel::exit_interrupt`]: crate::Kernel::exit_interrupt
    pub enum LockError {
        /// The lock (or the interrupt nesting level) is not held, or its
        /// nesting limit is reached.
        BadContext,
    }
}

define_error! {
    mod create_timer_error {}
    /// Error type for [`Kernel::create_timer`].
    ///
    /// [`Kernel::create_timer`]: crate::Kernel::create_timer
    pub enum CreateTimerError {
        /// The initial count is zero.
        BadParam,
        /// The timer pool is full.
        Exhausted,
    }
}

define_error! {
    mod timer_error {}
    /// Error type for [`Kernel::stop_timer`], [`Kernel::delete_timer`], and
    /// [`Kernel::timer_count`].
    ///
    /// [`Kernel::stop_timer`]: crate::Kernel::stop_timer
    /// [`Kernel::delete_timer`]: crate::Kernel::delete_timer
    /// [`Kernel::timer_count`]: crate::Kernel::timer_count
    pub enum TimerError: BadIdError {
        InvalidId,
    }
}

define_error! {
    mod set_timer_error {}
    /// Error type for [`Kernel::start_timer`] and [`Kernel::set_timer_count`].
    ///
    /// [`Kernel::start_timer`]: crate::Kernel::start_timer
    /// [`Kernel::set_timer_count`]: crate::Kernel::set_timer_count
    pub enum SetTimerError: BadIdError {
        InvalidId,
        /// The count is zero, or the timer has nothing left to count down.
        BadParam,
    }
}

define_error! {
    mod delay_error {}
    /// Error type for [`Kernel::delay`].
    ///
    /// [`Kernel::delay`]: crate::Kernel::delay
    pub enum DelayError: BadContextError {
        BadContext,
        CalledFromInterrupt,
        SchedulerLocked,
    }
}

define_error! {
    mod reset_delay_error {}
    /// Error type for [`Kernel::reset_delay`].
    ///
    /// [`Kernel::reset_delay`]: crate::Kernel::reset_delay
    pub enum ResetDelayError: BadIdError {
        InvalidId,
        /// The task is not sleeping and not in a timed wait.
        NotInDelayList,
    }
}

define_error! {
    mod create_event_error {}
    /// Error type for the creation of semaphores, mailboxes, and queues.
    pub enum CreateEventError {
        /// The initial count exceeds the maximum count, or the capacity is
        /// zero.
        BadParam,
        /// The control block pool is full.
        Exhausted,
        /// The queue storage couldn't be allocated.
        OutOfMemory,
    }
}

define_error! {
    mod signal_error {}
    /// Error type for signaling a semaphore or posting to a mailbox or a
    /// queue.
    pub enum SignalError: BadIdError {
        InvalidId,
        /// The semaphore is at its maximum count, or the mailbox or queue has
        /// no room.
        Full,
    }
}

define_error! {
    mod accept_error {}
    /// Error type for the non-blocking take operations.
    pub enum AcceptError: BadIdError {
        InvalidId,
        /// Nothing is available.
        Empty,
    }
}

define_error! {
    mod wait_event_error {}
    /// Error type for the blocking take operations. These are the errors
    /// that are detected before the calling task starts waiting; the
    /// outcome of the wait itself is reported as [`WaitError`].
    pub enum WaitEventError: BadIdError, BadContextError {
        InvalidId,
        BadContext,
        CalledFromInterrupt,
        SchedulerLocked,
    }
}

define_error! {
    mod wait_error {}
    /// The outcome of a wait that did not complete normally.
    pub enum WaitError {
        /// The timeout expired before the wait condition was satisfied.
        Timeout,
        /// The object was deleted while the task was waiting on it.
        Deleted,
    }
}

define_error! {
    mod delete_event_error {}
    /// Error type for the deletion of semaphores, mailboxes, and queues.
    pub enum DeleteEventError: BadIdError {
        InvalidId,
        /// Tasks are waiting and [`DeleteOption::ErrorIfPending`] was
        /// specified.
        ///
        /// [`DeleteOption::ErrorIfPending`]: crate::DeleteOption::ErrorIfPending
        TasksWaiting,
    }
}

define_error! {
    mod isr_post_error {}
    /// Error type for the interrupt-context post operations.
    pub enum IsrPostError: BadIdError, SignalError {
        InvalidId,
        Full,
        /// The kernel is locked and the deferred request queue is full.
        ServiceQueueFull,
    }
}

define_error! {
    mod create_flag_error {}
    /// Error type for [`Kernel::create_flag`].
    ///
    /// [`Kernel::create_flag`]: crate::Kernel::create_flag
    pub enum CreateFlagError {
        /// All 32 flags are in use.
        Exhausted,
    }
}

define_error! {
    mod flag_error {}
    /// Error type for [`Kernel::set_flag`] and [`Kernel::clear_flag`].
    ///
    /// [`Kernel::set_flag`]: crate::Kernel::set_flag
    /// [`Kernel::clear_flag`]: crate::Kernel::clear_flag
    pub enum FlagError: BadIdError {
        InvalidId,
    }
}

define_error! {
    mod accept_flag_error {}
    /// Error type for [`Kernel::accept_flag`] and [`Kernel::accept_flags`].
    ///
    /// [`Kernel::accept_flag`]: crate::Kernel::accept_flag
    /// [`Kernel::accept_flags`]: crate::Kernel::accept_flags
    pub enum AcceptFlagError: BadIdError {
        InvalidId,
        /// The mask is empty or includes flags that are not created.
        BadParam,
        /// The wait condition is not satisfied.
        NotReady,
    }
}

define_error! {
    mod wait_flag_error {}
    /// Error type for [`Kernel::wait_flag`] and [`Kernel::wait_flags`].
    ///
    /// [`Kernel::wait_flag`]: crate::Kernel::wait_flag
    /// [`Kernel::wait_flags`]: crate::Kernel::wait_flags
    pub enum WaitFlagError: BadIdError, BadContextError {
        InvalidId,
        /// The mask is empty or includes flags that are not created.
        BadParam,
        BadContext,
        CalledFromInterrupt,
        SchedulerLocked,
    }
}

define_error! {
    mod delete_flag_error {}
    /// Error type for [`Kernel::delete_flag`].
    ///
    /// [`Kernel::delete_flag`]: crate::Kernel::delete_flag
    pub enum DeleteFlagError: BadIdError {
        InvalidId,
        /// Tasks are waiting on the flag and
        /// [`DeleteOption::ErrorIfPending`] was specified.
        ///
        /// [`DeleteOption::ErrorIfPending`]: crate::DeleteOption::ErrorIfPending
        TasksWaiting,
        /// Called from an interrupt context.
        CalledFromInterrupt,
    }
}

define_error! {
    mod isr_flag_error {}
    /// Error type for [`Kernel::isr_set_flag`].
    ///
    /// [`Kernel::isr_set_flag`]: crate::Kernel::isr_set_flag
    pub enum IsrFlagError: FlagError {
        InvalidId,
        ServiceQueueFull,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Kernel::lock_mutex`].
    ///
    /// [`Kernel::lock_mutex`]: crate::Kernel::lock_mutex
    pub enum LockMutexError: BadIdError, BadContextError {
        InvalidId,
        /// The running task already owns the mutex or is already waiting.
        BadContext,
        CalledFromInterrupt,
        SchedulerLocked,
    }
}

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Kernel::try_lock_mutex`].
    ///
    /// [`Kernel::try_lock_mutex`]: crate::Kernel::try_lock_mutex
    pub enum TryLockMutexError: BadIdError {
        InvalidId,
        /// The running task already owns the mutex.
        BadContext,
        CalledFromInterrupt,
        /// Another task owns the mutex.
        NotReady,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Kernel::unlock_mutex`].
    ///
    /// [`Kernel::unlock_mutex`]: crate::Kernel::unlock_mutex
    pub enum UnlockMutexError: BadIdError {
        InvalidId,
        /// The running task doesn't own the mutex.
        BadContext,
        CalledFromInterrupt,
    }
}

define_error! {
    mod alloc_error {}
    /// Error type for [`Arena::alloc`].
    ///
    /// [`Arena::alloc`]: crate::heap::Arena::alloc
    pub enum AllocError {
        /// The requested size is zero.
        BadParam,
        /// No free block is large enough.
        OutOfMemory,
    }
}

define_error! {
    mod free_error {}
    /// Error type for [`Arena::free`].
    ///
    /// [`Arena::free`]: crate::heap::Arena::free
    pub enum FreeError {
        /// The pointer is outside the arena or not the start of an allocated
        /// block.
        InvalidPointer,
    }
}

define_error! {
    mod create_partition_error {}
    /// Error type for [`Kernel::create_partition`].
    ///
    /// [`Kernel::create_partition`]: crate::Kernel::create_partition
    pub enum CreatePartitionError: AllocError {
        /// The block size or the block count is zero.
        BadParam,
        /// The partition table is full.
        Exhausted,
        OutOfMemory,
    }
}

define_error! {
    mod get_block_error {}
    /// Error type for [`Kernel::get_block`].
    ///
    /// [`Kernel::get_block`]: crate::Kernel::get_block
    pub enum GetBlockError: BadIdError {
        InvalidId,
        /// Every block of the partition is in use.
        Exhausted,
    }
}

define_error! {
    mod free_block_error {}
    /// Error type for [`Kernel::free_block`].
    ///
    /// [`Kernel::free_block`]: crate::Kernel::free_block
    pub enum FreeBlockError: BadIdError, FreeError {
        InvalidId,
        /// The pointer is not a block of the partition, or the block is not
        /// in use.
        InvalidPointer,
    }
}

define_error! {
    mod partition_error {}
    /// Error type for [`Kernel::delete_partition`] and
    /// [`Kernel::free_block_count`].
    ///
    /// [`Kernel::delete_partition`]: crate::Kernel::delete_partition
    /// [`Kernel::free_block_count`]: crate::Kernel::free_block_count
    pub enum PartitionError: BadIdError {
        InvalidId,
    }
}

impl From<AllocError> for CreateEventError {
    #[inline]
    fn from(x: AllocError) -> Self {
        match x {
            AllocError::BadParam => Self::BadParam,
            AllocError::OutOfMemory => Self::OutOfMemory,
        }
    }
}
