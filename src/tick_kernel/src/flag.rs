//! Event flags
//!
//! The kernel has one group of 32 flags. Each flag is created individually
//! and may be *auto-reset*, i.e., cleared as soon as it satisfies a waiter.
//! Tasks wait for any or all of a set of flags.
use crate::{
    error::{
        AcceptFlagError, BadIdError, CreateFlagError, DeleteFlagError, FlagError, WaitError,
        WaitFlagError,
    },
    event::DeleteOption,
    utils::{intrusive_list::ListHead, Init},
    wait::{wait_list_accessor, WaitObject, WaitPayload},
    Kernel, Poll, Port, Ticks,
};

/// The number of flags in the flag group.
pub const MAX_FLAGS: usize = 32;

/// Identifies a flag in the flag group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlagId(u8);

impl FlagId {
    /// Construct a `FlagId` from a bit position.
    pub const fn new(bit: u8) -> Self {
        Self(bit)
    }

    /// Get the bit position of the flag.
    pub const fn bit(self) -> u8 {
        self.0
    }

    /// Get the mask with only this flag's bit set, or `None` if the bit
    /// position is out of range.
    pub fn mask(self) -> Option<u32> {
        1u32.checked_shl(u32::from(self.0))
    }
}

bitflags::bitflags! {
    /// Options for [`Kernel::wait_flags`] and [`Kernel::accept_flags`].
    pub struct FlagWaitMode: u8 {
        /// Wait until *all* of the specified flags are set. If this is not
        /// specified, the wait is satisfied by *any* of them.
        const ALL = 1 << 0;
    }
}

impl FlagWaitMode {
    /// Alias of [`Self::empty`].
    pub const ANY: Self = Self::empty();

    /// Determine whether a wait for `mask` is satisfied by `ready`.
    pub fn is_satisfied(self, mask: u32, ready: u32) -> bool {
        if self.contains(Self::ALL) {
            mask & ready == mask
        } else {
            mask & ready != 0
        }
    }
}

/// *Flag control block*.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlagGroup {
    /// Created flags.
    active: u32,
    /// Set flags.
    ready: u32,
    /// Flags cleared automatically when they satisfy a waiter.
    auto_reset: u32,
    /// Tasks waiting on the flag group.
    pub(crate) waiters: ListHead<usize>,
}

impl Init for FlagGroup {
    const INIT: Self = Self {
        active: 0,
        ready: 0,
        auto_reset: 0,
        waiters: ListHead::INIT,
    };
}

impl FlagGroup {
    /// Deliver the flags satisfying a wait for `mask`, clearing the
    /// auto-reset ones.
    fn take(&mut self, mask: u32) -> u32 {
        let satisfied = mask & self.ready;
        self.ready &= !(satisfied & self.auto_reset);
        satisfied
    }
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    /// Validate a flag identifier and get its mask.
    fn check_flag(&self, id: FlagId) -> Result<u32, BadIdError> {
        match id.mask() {
            Some(bit) if self.flags.active & bit != 0 => Ok(bit),
            Some(bit) if !cfg!(feature = "check_params") => {
                debug_assert!(false, "invalid flag {:?}", id);
                Ok(bit)
            }
            _ => Err(BadIdError::InvalidId),
        }
    }

    /// Validate a mask passed to a multiple-flag operation.
    fn check_flag_mask(&self, mask: u32) -> bool {
        mask != 0 && mask & !self.flags.active == 0
    }

    /// Create a flag.
    pub fn create_flag(
        &mut self,
        auto_reset: bool,
        initially_set: bool,
    ) -> Result<FlagId, CreateFlagError> {
        self.with_cpu_lock(|k| {
            let bit = k.flags.active.trailing_ones();
            if bit as usize >= MAX_FLAGS {
                return Err(CreateFlagError::Exhausted);
            }
            let mask = 1 << bit;
            k.flags.active |= mask;
            if auto_reset {
                k.flags.auto_reset |= mask;
            } else {
                k.flags.auto_reset &= !mask;
            }
            if initially_set {
                k.flags.ready |= mask;
            } else {
                k.flags.ready &= !mask;
            }
            Ok(FlagId(bit as u8))
        })
    }

    /// Delete a flag.
    ///
    /// With [`DeleteOption::ForceWakeAll`], a task waiting for all of several
    /// flags stops waiting for the deleted flag and keeps waiting for the
    /// rest. Any other task waiting for the deleted flag is woken with
    /// [`WaitError::Deleted`].
    pub fn delete_flag(&mut self, id: FlagId, option: DeleteOption) -> Result<(), DeleteFlagError> {
        if self.is_interrupt_context() {
            return Err(DeleteFlagError::CalledFromInterrupt);
        }
        self.with_cpu_lock(|k| {
            let bit = k.check_flag(id)?;

            let mut cursor = k.flags.waiters.first;
            while let Some(task) = cursor {
                cursor = wait_list_accessor!(&mut k.flags.waiters, &mut k.tasks[..])
                    .next(task)
                    .ok()
                    .flatten();

                let Some(WaitObject::Flags { mask, mode }) = k.tasks[task].wait.object else {
                    continue;
                };
                if mask & bit == 0 {
                    continue;
                }
                if option == DeleteOption::ErrorIfPending {
                    return Err(DeleteFlagError::TasksWaiting);
                }

                if mode.contains(FlagWaitMode::ALL) && mask != bit {
                    k.tasks[task].wait.object = Some(WaitObject::Flags {
                        mask: mask & !bit,
                        mode,
                    });
                } else {
                    k.wake_waiter(task, Err(WaitError::Deleted));
                }
            }

            k.flags.active &= !bit;
            k.flags.ready &= !bit;
            k.flags.auto_reset &= !bit;
            log::trace!("deleted flag {:?}", id);
            Ok(())
        })
    }

    /// Set a flag and wake up the tasks whose waits it satisfies.
    ///
    /// If the flag is auto-reset, at most one task is woken.
    pub fn set_flag(&mut self, id: FlagId) -> Result<(), FlagError> {
        self.with_cpu_lock(|k| {
            let bit = k.check_flag(id)?;
            if k.flags.ready & bit != 0 {
                return Ok(());
            }
            k.flags.ready |= bit;

            let mut cursor = k.flags.waiters.first;
            while let Some(task) = cursor {
                cursor = wait_list_accessor!(&mut k.flags.waiters, &mut k.tasks[..])
                    .next(task)
                    .ok()
                    .flatten();

                let Some(WaitObject::Flags { mask, mode }) = k.tasks[task].wait.object else {
                    continue;
                };
                if !mode.is_satisfied(mask, k.flags.ready) {
                    continue;
                }

                k.unlink_waiter(task);
                // Computed now; other flags may have changed since the task
                // started waiting
                let satisfied = k.flags.take(mask);
                k.complete_wait(task, Ok(WaitPayload::Flags(satisfied)));

                if k.flags.auto_reset & bit != 0 {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Clear a flag.
    pub fn clear_flag(&mut self, id: FlagId) -> Result<(), FlagError> {
        self.with_cpu_lock(|k| {
            let bit = k.check_flag(id)?;
            k.flags.ready &= !bit;
            Ok(())
        })
    }

    /// Get a flag indicating whether a flag is set.
    pub fn is_flag_set(&self, id: FlagId) -> Result<bool, FlagError> {
        let bit = self.check_flag(id)?;
        Ok(self.flags.ready & bit != 0)
    }

    /// Consume a flag if it's set.
    pub fn accept_flag(&mut self, id: FlagId) -> Result<(), AcceptFlagError> {
        self.with_cpu_lock(|k| {
            let bit = k.check_flag(id)?;
            if k.flags.ready & bit == 0 {
                return Err(AcceptFlagError::NotReady);
            }
            k.flags.take(bit);
            Ok(())
        })
    }

    /// Consume the flags in `mask` if they satisfy `mode`. Returns the
    /// satisfying flags.
    pub fn accept_flags(&mut self, mask: u32, mode: FlagWaitMode) -> Result<u32, AcceptFlagError> {
        self.with_cpu_lock(|k| {
            if !k.check_flag_mask(mask) {
                return Err(AcceptFlagError::BadParam);
            }
            if !mode.is_satisfied(mask, k.flags.ready) {
                return Err(AcceptFlagError::NotReady);
            }
            Ok(k.flags.take(mask))
        })
    }

    /// Wait until a flag is set.
    ///
    /// `timeout == 0` waits forever. On `Pending`, the outcome is
    /// [`WaitPayload::Flags`] or an error.
    pub fn wait_flag(&mut self, id: FlagId, timeout: Ticks) -> Result<Poll<()>, WaitFlagError> {
        self.expect_task_context()?;
        self.with_cpu_lock(|k| {
            let bit = k.check_flag(id)?;
            if k.flags.ready & bit != 0 {
                k.flags.take(bit);
                return Ok(Poll::Ready(()));
            }
            k.block_on_flags(bit, FlagWaitMode::ALL, timeout)?;
            Ok(Poll::Pending)
        })
    }

    /// Wait until the flags in `mask` satisfy `mode`. Returns the satisfying
    /// flags.
    ///
    /// `timeout == 0` waits forever. On `Pending`, the outcome is
    /// [`WaitPayload::Flags`] or an error.
    pub fn wait_flags(
        &mut self,
        mask: u32,
        mode: FlagWaitMode,
        timeout: Ticks,
    ) -> Result<Poll<u32>, WaitFlagError> {
        self.expect_task_context()?;
        self.with_cpu_lock(|k| {
            if !k.check_flag_mask(mask) {
                return Err(WaitFlagError::BadParam);
            }
            if mode.is_satisfied(mask, k.flags.ready) {
                return Ok(Poll::Ready(k.flags.take(mask)));
            }
            k.block_on_flags(mask, mode, timeout)?;
            Ok(Poll::Pending)
        })
    }

    fn block_on_flags(
        &mut self,
        mask: u32,
        mode: FlagWaitMode,
        timeout: Ticks,
    ) -> Result<(), WaitFlagError> {
        let task = self.expect_waitable_context()?;
        self.block(task.index(), WaitObject::Flags { mask, mode }, timeout);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use crate::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn create_until_exhausted() {
        let mut k = new_kernel();
        let flags: Vec<_> = (0..MAX_FLAGS)
            .map(|_| k.create_flag(false, false).unwrap())
            .collect();
        assert_eq!(k.create_flag(false, false), Err(CreateFlagError::Exhausted));

        k.delete_flag(flags[5], DeleteOption::ErrorIfPending).unwrap();
        assert_eq!(k.create_flag(true, true), Ok(flags[5]));
        assert_eq!(k.is_flag_set(flags[5]), Ok(true));
    }

    #[cfg(feature = "check_params")]
    #[test]
    fn invalid_flags() {
        let mut k = new_kernel();
        let flag = k.create_flag(false, false).unwrap();
        assert_eq!(k.set_flag(FlagId::new(1)), Err(FlagError::InvalidId));
        assert_eq!(k.set_flag(FlagId::new(32)), Err(FlagError::InvalidId));
        assert_eq!(k.accept_flags(0, FlagWaitMode::ANY), Err(AcceptFlagError::BadParam));
        assert_eq!(k.accept_flags(0b11, FlagWaitMode::ANY), Err(AcceptFlagError::BadParam));
        assert_eq!(k.accept_flag(flag), Err(AcceptFlagError::NotReady));

        let task = k.create_task(1).unwrap();
        assert_eq!(
            k.run(task).wait_flags(0b10, FlagWaitMode::ALL, 0),
            Err(WaitFlagError::BadParam)
        );
    }

    #[test]
    fn auto_reset_wakes_one() {
        let mut k = new_kernel();
        let flag = k.create_flag(true, false).unwrap();
        let a = k.create_task(1).unwrap();
        let b = k.create_task(1).unwrap();
        assert_eq!(k.run(a).wait_flag(flag, 0), Ok(Poll::Pending));
        assert_eq!(k.run(b).wait_flag(flag, 0), Ok(Poll::Pending));

        k.set_flag(flag).unwrap();
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Flags(1))));
        assert_eq!(k.is_flag_set(flag), Ok(false));

        k.set_flag(flag).unwrap();
        assert_eq!(k.drain_ready(), [b]);
    }

    #[test]
    fn manual_reset_wakes_all() {
        let mut k = new_kernel();
        let f0 = k.create_flag(false, false).unwrap();
        let f1 = k.create_flag(false, false).unwrap();
        let a = k.create_task(1).unwrap();
        let b = k.create_task(1).unwrap();
        let c = k.create_task(1).unwrap();
        let _ = k.run(a).wait_flags(0b11, FlagWaitMode::ALL, 0);
        let _ = k.run(b).wait_flags(0b11, FlagWaitMode::ANY, 0);
        let _ = k.run(c).wait_flag(f0, 0);

        k.set_flag(f0).unwrap();
        assert_eq!(k.drain_ready(), [b, c]);
        assert_eq!(k.take_wait_result(b), Some(Ok(WaitPayload::Flags(0b01))));

        // Setting a set flag is a no-op
        k.set_flag(f0).unwrap();
        assert!(k.drain_ready().is_empty());

        k.set_flag(f1).unwrap();
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Flags(0b11))));
        assert_eq!(k.accept_flags(0b11, FlagWaitMode::ALL), Ok(0b11));
    }

    #[test]
    fn satisfied_set_is_computed_on_wake() {
        let mut k = new_kernel();
        let f0 = k.create_flag(false, false).unwrap();
        let f1 = k.create_flag(false, false).unwrap();
        let f2 = k.create_flag(true, false).unwrap();
        let a = k.create_task(1).unwrap();
        let _ = k.run(a).wait_flags(0b101, FlagWaitMode::ANY, 0);

        // Not part of the mask
        k.set_flag(f1).unwrap();
        assert!(k.drain_ready().is_empty());

        k.set_flag(f0).unwrap();
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Flags(0b001))));

        let _ = k.run(a).wait_flags(0b110, FlagWaitMode::ALL, 0);
        k.set_flag(f2).unwrap();
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Flags(0b110))));
        // `f2` auto-resets, `f1` doesn't
        assert_eq!(k.is_flag_set(f1), Ok(true));
        assert_eq!(k.is_flag_set(f2), Ok(false));
    }

    #[test]
    fn timed_flag_wait() {
        let mut k = new_kernel();
        let flag = k.create_flag(false, false).unwrap();
        let a = k.create_task(1).unwrap();
        assert_eq!(k.run(a).wait_flag(flag, 4), Ok(Poll::Pending));
        k.advance(4);
        assert_eq!(k.drain_ready(), [a]);
        assert_eq!(k.take_wait_result(a), Some(Err(WaitError::Timeout)));

        // The timed-out task no longer waits
        k.set_flag(flag).unwrap();
        assert!(k.drain_ready().is_empty());
        assert_eq!(k.run(a).wait_flag(flag, 4), Ok(Poll::Ready(())));
    }

    #[test]
    fn delete_with_waiters() {
        let mut k = new_kernel();
        let f0 = k.create_flag(false, false).unwrap();
        let f1 = k.create_flag(false, false).unwrap();
        let a = k.create_task(1).unwrap();
        let b = k.create_task(1).unwrap();
        let c = k.create_task(1).unwrap();
        let _ = k.run(a).wait_flags(0b11, FlagWaitMode::ALL, 0);
        let _ = k.run(b).wait_flags(0b11, FlagWaitMode::ANY, 0);
        let _ = k.run(c).wait_flag(f1, 0);

        assert_eq!(
            k.delete_flag(f0, DeleteOption::ErrorIfPending),
            Err(DeleteFlagError::TasksWaiting)
        );

        k.enter_interrupt().unwrap();
        assert_eq!(
            k.delete_flag(f0, DeleteOption::ForceWakeAll),
            Err(DeleteFlagError::CalledFromInterrupt)
        );
        k.exit_interrupt().unwrap();

        k.delete_flag(f0, DeleteOption::ForceWakeAll).unwrap();
        assert_eq!(k.drain_ready(), [b]);
        assert_eq!(k.take_wait_result(b), Some(Err(WaitError::Deleted)));

        // `a` now waits for `f1` only
        k.set_flag(f1).unwrap();
        assert_eq!(k.drain_ready(), [a, c]);
        assert_eq!(k.take_wait_result(a), Some(Ok(WaitPayload::Flags(0b10))));
    }

    #[test]
    fn priority_ordered_flag_waiters() {
        let mut k = TestKernel::with_config(
            MockPort::default(),
            KernelConfig {
                flag_wait_order: QueueOrder::TaskPriority,
            },
        );
        let flag = k.create_flag(true, false).unwrap();
        let low = k.create_task(4).unwrap();
        let high = k.create_task(2).unwrap();
        let _ = k.run(low).wait_flag(flag, 0);
        let _ = k.run(high).wait_flag(flag, 0);
        k.set_flag(flag).unwrap();
        assert_eq!(k.drain_ready(), [high]);
    }

    /// A woken `ALL` waiter gets its whole mask, and an `ANY` waiter gets a
    /// non-empty subset of its mask.
    #[quickcheck]
    fn qc_satisfaction(cmds: Vec<(u8, u8)>) {
        let mut k = new_kernel();
        let flags: Vec<_> = (0..4)
            .map(|i| k.create_flag(i % 2 == 0, false).unwrap())
            .collect();
        let tasks: Vec<_> = (0..4).map(|_| k.create_task(1).unwrap()).collect();
        let mut waits = [None; 4];

        for (op, arg) in cmds {
            let flag = flags[usize::from(arg) % flags.len()];
            match op % 4 {
                0 | 1 => {
                    log::trace!("set {:?}", flag);
                    k.set_flag(flag).unwrap();
                }
                2 => {
                    k.clear_flag(flag).unwrap();
                }
                3 => {
                    let i = usize::from(op >> 2) % tasks.len();
                    if waits[i].is_some() {
                        continue;
                    }
                    let mask = u32::from(arg >> 2) % 15 + 1;
                    let mode = if op & 0x40 != 0 {
                        FlagWaitMode::ALL
                    } else {
                        FlagWaitMode::ANY
                    };
                    log::trace!("task {} waits for {:#b} ({:?})", i, mask, mode);
                    match k.run(tasks[i]).wait_flags(mask, mode, 0).unwrap() {
                        Poll::Ready(satisfied) => check(mask, mode, satisfied),
                        Poll::Pending => waits[i] = Some((mask, mode)),
                    }
                }
                _ => unreachable!(),
            }

            for task in k.drain_ready() {
                let i = tasks.iter().position(|&t| t == task).unwrap();
                let (mask, mode) = waits[i].take().unwrap();
                match k.take_wait_result(task) {
                    Some(Ok(WaitPayload::Flags(satisfied))) => check(mask, mode, satisfied),
                    other => panic!("{:?}", other),
                }
            }
        }

        fn check(mask: u32, mode: FlagWaitMode, satisfied: u32) {
            assert_eq!(satisfied & !mask, 0);
            if mode.contains(FlagWaitMode::ALL) {
                assert_eq!(satisfied, mask);
            } else {
                assert_ne!(satisfied, 0);
            }
        }
    }
}
