//! Indexed storage for the values a producer reports.
//!
//! In the default mode the store is a sparse map: results may arrive at any
//! index, each index may be written once. In filter mode reports are
//! addressed by *source* index and are buffered until every lower source slot
//! has arrived; they are then appended densely, so consumers always see a
//! gapless, increasing sequence even though producers finish out of order.
//! Each flush then exposes the whole dense prefix `[0, count)`.

use std::collections::BTreeMap;
use std::ops::Range;

/// Outcome of an accepted insertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Insertion {
    /// Index the report was stored under (the source index in filter mode).
    pub index: usize,
    /// Consumer-visible ranges that became ready, in delivery order.
    pub ready: Vec<Range<usize>>,
}

#[derive(Debug)]
struct PendingBatch<T> {
    values: Vec<T>,
    slots: usize,
}

#[derive(Debug)]
pub struct ResultStore<T> {
    results: BTreeMap<usize, T>,
    pending: BTreeMap<usize, PendingBatch<T>>,
    filter_mode: bool,
    /// Next index used for reports without an explicit index.
    insert_index: usize,
    /// Filter mode: the lowest source slot not delivered yet.
    next_source: usize,
    /// Every range handed out as ready, in order; replayed to late observers.
    reported: Vec<Range<usize>>,
}

impl<T> Default for ResultStore<T> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            pending: BTreeMap::new(),
            filter_mode: false,
            insert_index: 0,
            next_source: 0,
            reported: Vec::new(),
        }
    }
}

impl<T> ResultStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_mode(&self) -> bool {
        self.filter_mode
    }

    /// Switches filter mode; meant to be set before the first report.
    pub fn set_filter_mode(&mut self, enable: bool) {
        self.filter_mode = enable;
    }

    /// Stores one value; `None` if the index is already taken.
    pub fn add_result(&mut self, index: Option<usize>, value: T) -> Option<Insertion> {
        self.add_results(index, vec![value], 1)
    }

    /// Like [`add_result`](Self::add_result) but builds the value only once
    /// the index is known to be free.
    pub fn emplace_result<F>(&mut self, index: Option<usize>, make: F) -> Option<Insertion>
    where
        F: FnOnce() -> T,
    {
        let begin = self.admit(index, 1)?;
        Some(self.insert_admitted(begin, vec![make()], 1))
    }

    /// Stores a batch starting at `begin`.
    ///
    /// `slots` is the number of source slots the batch stands for. Outside
    /// filter mode it must match the batch length; in filter mode it may be
    /// larger, and an empty batch marks its slots as filtered out.
    pub fn add_results(
        &mut self,
        begin: Option<usize>,
        values: Vec<T>,
        slots: usize,
    ) -> Option<Insertion> {
        let slots = if self.filter_mode {
            slots.max(values.len()).max(1)
        } else {
            if values.is_empty() {
                return None;
            }
            values.len()
        };
        let begin = self.admit(begin, slots)?;
        Some(self.insert_admitted(begin, values, slots))
    }

    fn admit(&self, index: Option<usize>, slots: usize) -> Option<usize> {
        let begin = index.unwrap_or(self.insert_index);
        let end = begin.checked_add(slots)?;
        if self.filter_mode {
            if begin < self.next_source {
                return None;
            }
            let overlaps_pending = self
                .pending
                .range(..end)
                .next_back()
                .is_some_and(|(start, batch)| start + batch.slots > begin);
            (!overlaps_pending).then_some(begin)
        } else {
            let occupied = self.results.range(begin..end).next().is_some();
            (!occupied).then_some(begin)
        }
    }

    fn insert_admitted(&mut self, begin: usize, values: Vec<T>, slots: usize) -> Insertion {
        self.insert_index = self.insert_index.max(begin + slots);
        let mut ready = Vec::new();
        if !self.filter_mode {
            let len = values.len();
            for (offset, value) in values.into_iter().enumerate() {
                self.results.insert(begin + offset, value);
            }
            ready.push(begin..begin + len);
            self.reported.extend(ready.iter().cloned());
            return Insertion { index: begin, ready };
        }

        if begin > self.next_source {
            self.pending.insert(begin, PendingBatch { values, slots });
            return Insertion { index: begin, ready };
        }

        self.append_dense(values, slots, &mut ready);
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_source {
                break;
            }
            let batch = entry.remove();
            self.append_dense(batch.values, batch.slots, &mut ready);
        }
        self.reported.extend(ready.iter().cloned());
        Insertion { index: begin, ready }
    }

    fn append_dense(&mut self, values: Vec<T>, slots: usize, ready: &mut Vec<Range<usize>>) {
        self.next_source += slots;
        let start = self.results.len();
        for value in values {
            let at = self.results.len();
            self.results.insert(at, value);
        }
        let end = self.results.len();
        if end > start {
            ready.push(0..end);
        }
    }

    pub fn result_at(&self, index: usize) -> Option<&T> {
        self.results.get(&index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.results.contains_key(&index)
    }

    /// Number of consumer-visible results.
    pub fn count(&self) -> usize {
        self.results.len()
    }

    pub fn has_next_result(&self) -> bool {
        !self.results.is_empty()
    }

    /// Number of reports still waiting for a gap to close (filter mode).
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Visible results in increasing index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.results.iter().map(|(index, value)| (*index, value))
    }

    /// Every ready range handed out so far, in the order it was reported.
    pub fn ready_ranges(&self) -> &[Range<usize>] {
        &self.reported
    }

    /// Removes and returns every visible result in index order.
    pub fn take_all(&mut self) -> Vec<T> {
        let taken = std::mem::take(&mut self.results);
        self.clear();
        taken.into_values().collect()
    }

    /// Drops every stored and buffered value; filter mode is kept.
    pub fn clear(&mut self) {
        self.results.clear();
        self.pending.clear();
        self.insert_index = 0;
        self.next_source = 0;
        self.reported.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::ResultStore;

    #[test]
    fn auto_index_appends_after_highest() {
        let mut store = ResultStore::new();
        assert_eq!(store.add_result(None, "a").map(|i| i.index), Some(0));
        assert_eq!(store.add_result(Some(5), "f").map(|i| i.index), Some(5));
        assert_eq!(store.add_result(None, "g").map(|i| i.index), Some(6));
        assert_eq!(store.count(), 3);
        assert_eq!(store.ready_ranges(), &[0..1, 5..6, 6..7]);
    }

    #[test]
    fn occupied_index_is_rejected() {
        let mut store = ResultStore::new();
        assert!(store.add_result(Some(1), 10).is_some());
        assert!(store.add_result(Some(1), 11).is_none());
        assert!(store.add_results(Some(0), vec![1, 2], 2).is_none());
        assert!(store.add_results(Some(0), vec![], 0).is_none());
        assert_eq!(store.result_at(1), Some(&10));
    }

    #[test]
    fn emplace_builds_only_when_accepted() {
        let mut store = ResultStore::new();
        store.add_result(Some(0), String::from("x"));
        let mut built = false;
        let rejected = store.emplace_result(Some(0), || {
            built = true;
            String::from("y")
        });
        assert!(rejected.is_none());
        assert!(!built);
        assert!(store.emplace_result(None, || String::from("z")).is_some());
        assert_eq!(store.result_at(1).map(String::as_str), Some("z"));
    }

    #[test]
    fn filter_mode_exposes_gapless_prefix() {
        let mut store = ResultStore::new();
        store.set_filter_mode(true);

        let first = store.add_result(Some(2), 'c').expect("accepted");
        assert!(first.ready.is_empty());
        assert_eq!(store.count(), 0);
        assert_eq!(store.pending_count(), 1);

        let second = store.add_result(Some(0), 'a').expect("accepted");
        assert_eq!(second.ready, vec![0..1]);

        let third = store.add_result(Some(1), 'b').expect("accepted");
        assert_eq!(third.ready, vec![0..2, 0..3]);
        assert_eq!(store.ready_ranges(), &[0..1, 0..2, 0..3]);

        let values: Vec<char> = store.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['a', 'b', 'c']);
        assert!(store.add_result(Some(1), 'x').is_none());
    }

    #[test]
    fn filter_mode_renumbers_around_filtered_slots() {
        let mut store = ResultStore::new();
        store.set_filter_mode(true);
        store.add_results(Some(1), vec![], 1);
        store.add_results(Some(2), vec![20, 21], 1);
        let ins = store.add_result(Some(0), 0).expect("accepted");
        assert_eq!(ins.ready, vec![0..1, 0..3]);
        assert_eq!(store.result_at(2), Some(&21));
        assert_eq!(store.ready_ranges(), &[0..1, 0..3]);
        assert!(store.add_result(None, 30).is_some());
        assert_eq!(store.result_at(3), Some(&30));
    }

    #[test]
    fn clear_resets_indices() {
        let mut store = ResultStore::new();
        store.add_result(None, 1);
        store.add_result(None, 2);
        assert_eq!(store.take_all(), vec![1, 2]);
        assert!(!store.has_next_result());
        assert!(store.ready_ranges().is_empty());
        assert_eq!(store.add_result(None, 3).map(|i| i.index), Some(0));
    }
}
