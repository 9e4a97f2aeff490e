//! Software timers
//!
//! Running timers are kept in a delta list sorted by expiration time, so a
//! tick only ever decrements the first entry. Expired timers are removed
//! one at a time under CPU Lock, and their callbacks are called after the
//! lock is released.
use core::fmt;

use crate::{
    error::{BadIdError, CreateTimerError, SetTimerError, TimerError},
    utils::{
        delta_list::DeltaListAccessor,
        intrusive_list::{Link, ListHead},
        Init,
    },
    Kernel, Port, Ticks,
};

/// Identifies a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(usize);

impl TimerId {
    /// Construct a `TimerId` from a timer table index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the timer table index.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A function called when a timer expires. It runs outside CPU Lock and may
/// call any non-blocking kernel operation.
pub type TimerCallback<K> = fn(&mut K, TimerId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// The timer stops after expiring once.
    OneShot,
    /// The timer restarts with its reload count each time it expires.
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerState {
    Stopped,
    Running,
}

/// *Timer control block*.
pub(crate) struct TimerCb<K> {
    active: bool,
    kind: TimerKind,
    state: TimerState,
    /// The remaining count while stopped.
    count: Ticks,
    reload: Ticks,
    callback: Option<TimerCallback<K>>,
    link: Option<Link<usize>>,
    /// The delta from the predecessor while running.
    delta: u32,
}

impl<K> Clone for TimerCb<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for TimerCb<K> {}

impl<K> fmt::Debug for TimerCb<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("active", &self.active)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("count", &self.count)
            .field("reload", &self.reload)
            .field("link", &self.link)
            .field("delta", &self.delta)
            .finish()
    }
}

impl<K> Init for TimerCb<K> {
    const INIT: Self = Self {
        active: false,
        kind: TimerKind::OneShot,
        state: TimerState::Stopped,
        count: 0,
        reload: 0,
        callback: None,
        link: None,
        delta: 0,
    };
}

pub(crate) struct TimerTable<K, const N: usize> {
    cbs: [TimerCb<K>; N],
    /// The running timers.
    list: ListHead<usize>,
}

impl<K, const N: usize> TimerTable<K, N> {
    pub(crate) fn new() -> Self {
        Self {
            cbs: [TimerCb::INIT; N],
            list: ListHead::INIT,
        }
    }
}

macro_rules! timer_list_accessor {
    ($kernel:expr) => {
        DeltaListAccessor::new(
            &mut $kernel.timers.list,
            &mut $kernel.timers.cbs[..],
            |cb| &mut cb.link,
            |cb| &mut cb.delta,
        )
    };
}

impl<P: Port, const TASKS: usize, const TIMERS: usize, const EVENTS: usize, const HEAP_WORDS: usize>
    Kernel<P, TASKS, TIMERS, EVENTS, HEAP_WORDS>
{
    fn check_timer(&self, id: TimerId) -> Result<usize, BadIdError> {
        let i = id.index();
        if cfg!(feature = "check_params") {
            if self.timers.cbs.get(i).map_or(true, |cb| !cb.active) {
                return Err(BadIdError::InvalidId);
            }
        } else {
            debug_assert!(self.timers.cbs[i].active, "invalid timer {:?}", id);
        }
        Ok(i)
    }

    /// Create a stopped timer that expires `count` ticks after it's started.
    /// A periodic timer then restarts with `reload` ticks.
    pub fn create_timer(
        &mut self,
        kind: TimerKind,
        count: Ticks,
        reload: Ticks,
        callback: TimerCallback<Self>,
    ) -> Result<TimerId, CreateTimerError> {
        if count == 0 {
            return Err(CreateTimerError::BadParam);
        }
        self.with_cpu_lock(|k| {
            let i = k
                .timers
                .cbs
                .iter()
                .position(|cb| !cb.active)
                .ok_or(CreateTimerError::Exhausted)?;
            k.timers.cbs[i] = TimerCb {
                active: true,
                kind,
                count,
                reload,
                callback: Some(callback),
                ..TimerCb::INIT
            };
            Ok(TimerId(i))
        })
    }

    /// Start a timer. Starting a running timer does nothing.
    pub fn start_timer(&mut self, id: TimerId) -> Result<(), SetTimerError> {
        self.with_cpu_lock(|k| {
            let i = k.check_timer(id)?;
            let cb = &mut k.timers.cbs[i];
            if cb.state == TimerState::Running {
                return Ok(());
            }
            if cb.count == 0 {
                return Err(SetTimerError::BadParam);
            }
            cb.state = TimerState::Running;
            let count = cb.count;
            timer_list_accessor!(k).insert(i, count);
            log::trace!("timer {} started: {} ticks", i, count);
            Ok(())
        })
    }

    /// Stop a timer, preserving its remaining count. Stopping a stopped
    /// timer does nothing.
    pub fn stop_timer(&mut self, id: TimerId) -> Result<(), TimerError> {
        self.with_cpu_lock(|k| {
            let i = k.check_timer(id)?;
            k.stop_timer_inner(i);
            Ok(())
        })
    }

    fn stop_timer_inner(&mut self, i: usize) {
        if self.timers.cbs[i].state == TimerState::Stopped {
            return;
        }
        let mut accessor = timer_list_accessor!(self);
        let remaining = accessor.remaining(i).unwrap_or(0);
        let _ = accessor.remove(i);
        let cb = &mut self.timers.cbs[i];
        cb.count = match remaining {
            // Expired, but the dispatch was deferred
            0 if cb.reload > 0 => cb.reload,
            0 => cb.count,
            remaining => remaining,
        };
        cb.state = TimerState::Stopped;
        log::trace!("timer {} stopped: {} ticks left", i, cb.count);
    }

    /// Stop and release a timer.
    pub fn delete_timer(&mut self, id: TimerId) -> Result<(), TimerError> {
        self.with_cpu_lock(|k| {
            let i = k.check_timer(id)?;
            k.stop_timer_inner(i);
            k.timers.cbs[i] = TimerCb::INIT;
            Ok(())
        })
    }

    /// Change the count and the reload count of a timer. A running timer is
    /// rescheduled to expire `count` ticks from now.
    pub fn set_timer_count(
        &mut self,
        id: TimerId,
        count: Ticks,
        reload: Ticks,
    ) -> Result<(), SetTimerError> {
        if count == 0 {
            return Err(SetTimerError::BadParam);
        }
        self.with_cpu_lock(|k| {
            let i = k.check_timer(id)?;
            let cb = &mut k.timers.cbs[i];
            cb.count = count;
            cb.reload = reload;
            if cb.state == TimerState::Running {
                let mut accessor = timer_list_accessor!(k);
                let _ = accessor.remove(i);
                accessor.insert(i, count);
            }
            Ok(())
        })
    }

    /// Get the number of ticks until a running timer expires, or the count
    /// a stopped timer will start with.
    pub fn timer_count(&mut self, id: TimerId) -> Result<Ticks, TimerError> {
        let i = self.check_timer(id)?;
        Ok(match self.timers.cbs[i].state {
            TimerState::Stopped => self.timers.cbs[i].count,
            TimerState::Running => timer_list_accessor!(self).remaining(i).unwrap_or(0),
        })
    }

    /// Get the state of a timer.
    pub fn timer_state(&self, id: TimerId) -> Result<TimerState, TimerError> {
        let i = self.check_timer(id)?;
        Ok(self.timers.cbs[i].state)
    }

    /// Decrement the first entry of the timer list. Returns `true` if it has
    /// expired.
    pub(crate) fn tick_timer_list(&mut self) -> bool {
        let mut accessor = timer_list_accessor!(self);
        accessor.tick();
        accessor.is_front_expired()
    }

    /// Remove the first expired timer, reschedule it if it's periodic, and
    /// return its callback.
    fn pop_expired_timer(&mut self) -> Option<(usize, Option<TimerCallback<Self>>)> {
        let i = timer_list_accessor!(self).pop_expired()?;
        let cb = self.timers.cbs[i];
        match cb.kind {
            TimerKind::Periodic if cb.reload > 0 => {
                timer_list_accessor!(self).insert(i, cb.reload);
            }
            TimerKind::Periodic => {
                let cb = &mut self.timers.cbs[i];
                cb.state = TimerState::Stopped;
                cb.count = 0;
            }
            TimerKind::OneShot => {
                let cb = &mut self.timers.cbs[i];
                cb.state = TimerState::Stopped;
                cb.count = cb.reload;
            }
        }
        log::trace!("timer {} expired at tick {}", i, self.tick_count());
        Some((i, cb.callback))
    }

    /// Dispatch every expired timer.
    pub(crate) fn dispose_timers(&mut self) {
        while let Some((i, callback)) = self.with_cpu_lock(|k| k.pop_expired_timer()) {
            if let Some(callback) = callback {
                callback(self, TimerId(i));
            }
        }
    }
}
