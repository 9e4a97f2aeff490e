//! Relative-delta countdown list
//!
//! Each element stores only the number of ticks by which it expires after
//! its predecessor, so advancing time only ever touches the first element.
//! The absolute remaining time of an element is the sum of the deltas from
//! the front up to and including the element.
use core::ops;

use super::intrusive_list::{ItemError, Link, ListAccessor, ListHead};

/// Accessor to a delta list. The list is an ordinary [`ListHead`] whose
/// elements additionally carry a delta field projected by `map_delta`.
pub struct DeltaListAccessor<'a, Pool: ?Sized, MapLink, MapDelta> {
    list: ListAccessor<'a, usize, Pool, MapLink>,
    map_delta: MapDelta,
}

impl<'a, Pool, MapLink, MapDelta, Element> DeltaListAccessor<'a, Pool, MapLink, MapDelta>
where
    Pool: ops::IndexMut<usize, Output = Element> + ?Sized,
    MapLink: Fn(&mut Element) -> &mut Option<Link<usize>>,
    MapDelta: Fn(&mut Element) -> &mut u32,
{
    pub fn new(
        head: &'a mut ListHead<usize>,
        pool: &'a mut Pool,
        map_link: MapLink,
        map_delta: MapDelta,
    ) -> Self
    where
        MapLink: Fn(&mut Element) -> &mut Option<Link<usize>>,
        MapDelta: Fn(&mut Element) -> &mut u32,
    {
        Self {
            list: ListAccessor::new(head, pool, map_link),
            map_delta,
        }
    }

    fn delta<'b>(&'b mut self, i: usize) -> &'b mut u32
    where
        Element: 'b,
    {
        (self.map_delta)(&mut self.list.pool_mut()[i])
    }

    pub fn front(&self) -> Option<usize> {
        self.list.front()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn is_linked(&mut self, item: usize) -> bool {
        self.list.is_linked(item)
    }

    pub fn next(&mut self, i: usize) -> Option<usize> {
        self.list.next(i).ok().flatten()
    }

    /// Insert `item` so that it expires `ticks` ticks from now. `item` is
    /// placed after every element expiring at the same tick.
    pub fn insert(&mut self, item: usize, ticks: u32) {
        debug_assert!(ticks > 0);
        debug_assert!(!self.list.is_linked(item));

        let mut remaining = ticks;
        let mut cursor = self.list.front();
        while let Some(i) = cursor {
            let delta = *self.delta(i);
            if remaining < delta {
                *self.delta(i) = delta - remaining;
                break;
            }
            remaining -= delta;
            cursor = self.next(i);
        }

        *self.delta(item) = remaining;
        // `item` was checked to be unlinked
        let _ = self.list.insert(item, cursor);
    }

    /// Remove `item`, donating its delta to its successor so that the
    /// deadlines of the following elements are unaffected.
    pub fn remove(&mut self, item: usize) -> Result<(), ItemError> {
        if !self.list.is_linked(item) {
            return Err(ItemError::NotLinked);
        }

        if let Some(next) = self.next(item) {
            let delta = *self.delta(item);
            *self.delta(next) += delta;
        }

        self.list.remove(item)?;
        *self.delta(item) = 0;
        Ok(())
    }

    /// Get the number of ticks until `item` expires.
    pub fn remaining(&mut self, item: usize) -> Result<u32, ItemError> {
        if !self.list.is_linked(item) {
            return Err(ItemError::NotLinked);
        }

        let mut total = 0u32;
        let mut cursor = self.list.front();
        while let Some(i) = cursor {
            total = total.saturating_add(*self.delta(i));
            if i == item {
                break;
            }
            cursor = self.next(i);
        }
        Ok(total)
    }

    /// Advance time by one tick. Only the first element is touched.
    pub fn tick(&mut self) {
        if let Some(first) = self.list.front() {
            let delta = self.delta(first);
            *delta = delta.saturating_sub(1);
        }
    }

    /// Get a flag indicating whether the first element has expired.
    pub fn is_front_expired(&mut self) -> bool {
        match self.list.front() {
            Some(first) => *self.delta(first) == 0,
            None => false,
        }
    }

    /// Remove and return the first element if it has expired.
    pub fn pop_expired(&mut self) -> Option<usize> {
        if !self.is_front_expired() {
            return None;
        }
        self.list.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[derive(Debug, Clone, Copy, Default)]
    struct Entry {
        link: Option<Link<usize>>,
        delta: u32,
    }

    macro_rules! get_accessor {
        ($head:expr, $pool:expr) => {
            DeltaListAccessor::new($head, $pool, |e| &mut e.link, |e| &mut e.delta)
        };
    }

    /// Advance until everything expires, returning the items in the order
    /// they expire and the tick at which they do.
    fn drain(head: &mut ListHead<usize>, pool: &mut [Entry]) -> Vec<(usize, u32)> {
        let mut accessor = get_accessor!(head, pool);
        let mut fired = Vec::new();
        let mut now = 0;
        while !accessor.is_empty() {
            now += 1;
            accessor.tick();
            while let Some(i) = accessor.pop_expired() {
                fired.push((i, now));
            }
        }
        fired
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let mut pool = [Entry::default(); 4];
        let mut head = ListHead::new();
        {
            let mut accessor = get_accessor!(&mut head, &mut pool[..]);
            accessor.insert(0, 5);
            accessor.insert(1, 3);
            accessor.insert(2, 5);
            accessor.insert(3, 3);
            assert_eq!(accessor.remaining(2), Ok(5));
            assert_eq!(accessor.remaining(3), Ok(3));
        }
        assert_eq!(
            drain(&mut head, &mut pool),
            [(1, 3), (3, 3), (0, 5), (2, 5)]
        );
    }

    #[test]
    fn remove_donates_delta() {
        let mut pool = [Entry::default(); 3];
        let mut head = ListHead::new();
        {
            let mut accessor = get_accessor!(&mut head, &mut pool[..]);
            accessor.insert(0, 2);
            accessor.insert(1, 6);
            accessor.insert(2, 9);
            accessor.remove(1).unwrap();
            assert_eq!(accessor.remove(1), Err(ItemError::NotLinked));
            assert_eq!(accessor.remaining(2), Ok(9));
        }
        assert_eq!(drain(&mut head, &mut pool), [(0, 2), (2, 9)]);
    }

    #[quickcheck]
    fn qc_deadlines(cmds: Vec<(u8, u8)>) {
        let _ = env_logger::builder().is_test(true).try_init();

        const LEN: usize = 16;
        let mut pool = [Entry::default(); LEN];
        let mut head = ListHead::new();
        // Absolute deadline of each linked entry
        let mut reference: [Option<u32>; LEN] = [None; LEN];
        let mut now = 0u32;

        for (op, arg) in cmds {
            let mut accessor = get_accessor!(&mut head, &mut pool[..]);
            let item = arg as usize % LEN;
            match op % 3 {
                0 => {
                    if reference[item].is_none() {
                        let ticks = u32::from(op / 3 % 20) + 1;
                        log::trace!("insert {} after {} ticks", item, ticks);
                        accessor.insert(item, ticks);
                        reference[item] = Some(now + ticks);
                    }
                }
                1 => {
                    log::trace!("remove {}", item);
                    let result = accessor.remove(item);
                    assert_eq!(result.is_ok(), reference[item].take().is_some());
                }
                2 => {
                    now += 1;
                    accessor.tick();
                    while let Some(i) = accessor.pop_expired() {
                        log::trace!("expired {} at {}", i, now);
                        assert_eq!(reference[i].take(), Some(now));
                    }
                }
                _ => unreachable!(),
            }

            let mut accessor = get_accessor!(&mut head, &mut pool[..]);
            for (i, deadline) in reference.iter().enumerate() {
                match deadline {
                    Some(deadline) => assert_eq!(accessor.remaining(i), Ok(deadline - now)),
                    None => assert!(!accessor.is_linked(i)),
                }
            }
        }
    }
}
