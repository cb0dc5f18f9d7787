use std::collections::BTreeSet;
use std::ops::Range;

/// Free interrupt identifiers computed from a snapshot of occupied ones.
///
/// The list is the sequence of holes below the highest occupied id, followed by an open-ended run
/// starting one past it. With `{1, 4}` occupied the list reads `0, 2, 3, 5, 6, ...`. Holes are
/// stored as compact runs so a sparse, high id does not materialize every gap below it.
///
/// The list is a snapshot. Owners rebuild it whenever the occupied set changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptList {
    holes: Vec<Range<u32>>,
    next: Option<u32>,
}

impl InterruptList {
    pub fn from_occupied<I>(occupied: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        let occupied: BTreeSet<u32> = occupied.into_iter().collect();

        let mut holes = Vec::new();
        let mut expected = Some(0u32);
        for id in occupied {
            let Some(start) = expected else { break };
            if start < id {
                holes.push(start..id);
            }
            expected = id.checked_add(1);
        }

        Self {
            holes,
            next: expected,
        }
    }

    /// The first free id, if any remains.
    pub fn first(&self) -> Option<u32> {
        self.holes.first().map(|run| run.start).or(self.next)
    }

    /// Iterates the free ids in allocation order. The tail is unbounded up to `u32::MAX`.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        let tail = self.next.map(|next| next..=u32::MAX).into_iter().flatten();
        self.holes.iter().cloned().flatten().chain(tail)
    }

    /// Consumes the first `count` free ids.
    ///
    /// Holes are used before any id above the occupied range. The result is strictly increasing
    /// and only falls short of `count` if the 32-bit id space runs out. Callers bound `count`;
    /// the tail is only limited by the id space.
    pub fn take(&mut self, count: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(count.min(self.reserve_hint()));

        while out.len() < count {
            let Some(run) = self.holes.first_mut() else { break };
            let want = (count - out.len()) as u64;
            let available = u64::from(run.end - run.start);
            let used = want.min(available) as u32;
            out.extend(run.start..run.start + used);
            run.start += used;
            if run.is_empty() {
                self.holes.remove(0);
            }
        }

        while out.len() < count {
            let Some(next) = self.next else { break };
            out.push(next);
            self.next = next.checked_add(1);
        }

        out
    }

    /// Initial capacity for `take`: the holes plus a short stretch of the tail.
    fn reserve_hint(&self) -> usize {
        const TAIL_RESERVE: usize = 64;
        self.holes
            .iter()
            .map(|run| (run.end - run.start) as usize)
            .fold(TAIL_RESERVE, usize::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_then_next_free() {
        let list = InterruptList::from_occupied([1, 4]);
        assert_eq!(list.iter().take(4).collect::<Vec<_>>(), vec![0, 2, 3, 5]);
        assert_eq!(list.first(), Some(0));
    }

    #[test]
    fn empty_occupancy_starts_at_zero() {
        let mut list = InterruptList::from_occupied(std::iter::empty());
        assert_eq!(list.take(3), vec![0, 1, 2]);
        assert_eq!(list.take(1), vec![3]);
    }

    #[test]
    fn take_spans_runs_and_tail() {
        let mut list = InterruptList::from_occupied([0, 3, 4, 8]);
        assert_eq!(list.take(2), vec![1, 2]);
        assert_eq!(list.take(5), vec![5, 6, 7, 9, 10]);
    }

    #[test]
    fn sparse_high_id_stays_compact() {
        let list = InterruptList::from_occupied([u32::MAX - 1]);
        assert_eq!(list.holes.len(), 1);
        assert_eq!(list.first(), Some(0));
    }

    #[test]
    fn huge_count_on_a_spent_list_returns_empty() {
        let mut list = InterruptList::from_occupied([0, 2]);
        assert_eq!(list.take(2), vec![1, 3]);
        list.next = None;
        assert_eq!(list.take(usize::MAX), Vec::<u32>::new());
    }

    #[test]
    fn exhausted_space_returns_short() {
        let mut list = InterruptList::from_occupied([u32::MAX]);
        list.holes.clear();
        assert_eq!(list.take(2), Vec::<u32>::new());
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            #[test]
            fn take_reuses_every_hole_before_growing(
                occupied in prop::collection::btree_set(0u32..256, 0..32),
                count in 0usize..64,
            ) {
                let mut list = InterruptList::from_occupied(occupied.iter().copied());
                let ids = list.take(count);

                prop_assert_eq!(ids.len(), count);
                prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(ids.iter().all(|id| !occupied.contains(id)));

                let max = occupied.iter().next_back().copied();
                let holes: Vec<u32> = match max {
                    Some(max) => (0..max).filter(|id| !occupied.contains(id)).collect(),
                    None => Vec::new(),
                };
                let reused = count.min(holes.len());
                prop_assert_eq!(&ids[..reused], &holes[..reused]);

                let first_new = max.map_or(0, |max| max + 1);
                for (i, id) in ids[reused..].iter().enumerate() {
                    prop_assert_eq!(*id, first_new + i as u32);
                }
            }
        }
    }
}
