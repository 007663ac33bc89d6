use std::sync::Arc;
use tracing::debug;

/// One scheduled flow on a port.
///
/// `flow_id` doubles as the table index: the controller hands out small,
/// dense ids, so direct indexing gives branch free lookup on the timer path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry {
    pub flow_id: u16,
    /// transmission period in nanoseconds, strictly positive
    pub period: u64,
    /// first fire time within the macro period, `0 <= offset < period`
    pub offset: u64,
    /// advisory, used by admission checks only
    pub packet_size: u32,
    /// association with a staged packet slot
    pub buffer_id: u32,
}

/// A port scoped, sparse, index addressed table of flow entries.
///
/// The table itself is immutable; `insert` and `delete` return the new table
/// root, which the caller publishes through an `RcuCell`. Entries are shared
/// by `Arc` so a reallocation carries the existing slots over without copying
/// them.
pub struct FlowTable {
    slots: Vec<Option<Arc<FlowEntry>>>,
    count: usize,
}

impl FlowTable {
    pub fn new(min_capacity: u16) -> FlowTable {
        FlowTable {
            slots: vec![None; min_capacity as usize],
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn lookup(&self, flow_id: u16) -> Option<&FlowEntry> {
        self.slots
            .get(flow_id as usize)
            .and_then(|slot| slot.as_deref())
    }

    /// Insert `entry`, replacing any previous entry with the same id. Grows
    ///  the table to `flow_id + min_capacity` if the id is out of range.
    pub fn insert(&self, entry: FlowEntry, min_capacity: u16) -> FlowTable {
        let index = entry.flow_id as usize;

        let capacity = if index >= self.capacity() {
            index + min_capacity as usize
        } else {
            self.capacity()
        };

        let mut slots = Vec::with_capacity(capacity);
        slots.extend(self.slots.iter().cloned());
        slots.resize(capacity, None);

        let replaced = slots[index].replace(Arc::new(entry));
        FlowTable {
            count: self.count + usize::from(replaced.is_none()),
            slots,
        }
    }

    /// Clear the slot of `flow_id`. Deleting a missing id returns an
    ///  unchanged copy. Shrinks the table by half once it is at most a third
    ///  full, never below the floor capacity.
    pub fn delete(&self, flow_id: u16, min_capacity: u16) -> FlowTable {
        let index = flow_id as usize;

        let mut slots = self.slots.clone();
        let removed = slots.get_mut(index).and_then(|slot| slot.take());
        let count = self.count - usize::from(removed.is_some());

        let min_capacity = min_capacity as usize;
        if slots.len() >= min_capacity * 2 && count <= slots.len() / 3 {
            let shrunk = slots.len() / 2;
            let shrunk = shrunk.max(min_capacity);
            if slots[shrunk..].iter().all(Option::is_none) {
                slots.truncate(shrunk);
            } else {
                debug!("not shrinking flow table, occupied slots above {}", shrunk);
            }
        }

        FlowTable { slots, count }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.slots.iter().filter_map(|slot| slot.as_deref())
    }

    /// An owned copy of all live entries, in id order.
    pub fn snapshot(&self) -> Vec<FlowEntry> {
        self.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MIN_CAP: u16 = 4;

    fn entry(flow_id: u16, period: u64, offset: u64) -> FlowEntry {
        FlowEntry {
            flow_id,
            period,
            offset,
            packet_size: 0,
            buffer_id: 0,
        }
    }

    #[test]
    fn test_insert_lookup_delete() {
        let table = FlowTable::new(MIN_CAP);
        assert_eq!(table.lookup(2), None);

        let table = table.insert(entry(2, 1000, 0), MIN_CAP);
        assert_eq!(table.lookup(2), Some(&entry(2, 1000, 0)));
        assert_eq!(table.count(), 1);

        // replacement keeps the count
        let table = table.insert(entry(2, 2000, 100), MIN_CAP);
        assert_eq!(table.lookup(2), Some(&entry(2, 2000, 100)));
        assert_eq!(table.count(), 1);

        let table = table.delete(2, MIN_CAP);
        assert_eq!(table.lookup(2), None);
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let table = FlowTable::new(MIN_CAP).insert(entry(1, 10, 0), MIN_CAP);
        let table = table.delete(3, MIN_CAP);
        assert_eq!(table.count(), 1);
        assert_eq!(table.lookup(1), Some(&entry(1, 10, 0)));
    }

    #[rstest]
    #[case::in_range(2, 4)]
    #[case::at_capacity(4, 8)]
    #[case::far_out(32, 36)]
    fn test_grow_to_id_plus_floor(#[case] flow_id: u16, #[case] expected_capacity: usize) {
        let table = FlowTable::new(MIN_CAP).insert(entry(flow_id, 10, 0), MIN_CAP);
        assert_eq!(table.capacity(), expected_capacity);
        assert!(table.capacity() > flow_id as usize);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let table = FlowTable::new(MIN_CAP);
        assert_eq!(table.lookup(1000), None);
    }

    #[test]
    fn test_shrink_on_sparse_delete() {
        // ids 0..33 so the table grows to 32 + MIN_CAP
        let mut table = FlowTable::new(MIN_CAP);
        for id in 0..=32 {
            table = table.insert(entry(id, 10, 0), MIN_CAP);
        }
        assert_eq!(table.capacity(), 36);
        assert_eq!(table.count(), 33);

        // delete from the top so the occupied prefix keeps shrinking
        for id in (0..=32).rev() {
            table = table.delete(id, MIN_CAP);
        }
        assert_eq!(table.count(), 0);
        assert_eq!(table.capacity(), MIN_CAP as usize);
    }

    #[test]
    fn test_shrink_skipped_while_high_slot_occupied() {
        let mut table = FlowTable::new(MIN_CAP);
        for id in 0..=32 {
            table = table.insert(entry(id, 10, 0), MIN_CAP);
        }
        // empty the table except for the topmost id
        for id in 0..32 {
            table = table.delete(id, MIN_CAP);
        }
        assert_eq!(table.count(), 1);
        assert_eq!(table.lookup(32), Some(&entry(32, 10, 0)));
        assert!(table.capacity() > 32);
    }

    #[test]
    fn test_snapshot_in_id_order() {
        let table = FlowTable::new(MIN_CAP)
            .insert(entry(5, 10, 0), MIN_CAP)
            .insert(entry(1, 20, 0), MIN_CAP)
            .insert(entry(3, 30, 0), MIN_CAP);

        let ids: Vec<u16> = table.snapshot().iter().map(|e| e.flow_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
