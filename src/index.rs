use std::collections::BTreeMap;
use std::ops::Bound::Included;
use std::sync::RwLock;

use crate::table::RID;

/// Per-column value → RID-list maps. The key column's map always exists;
/// secondary columns are optional and created on demand. Secondary entries
/// always key by base RID.
pub struct Index {
    key_column: usize,
    columns: Vec<RwLock<Option<BTreeMap<i64, Vec<RID>>>>>,
}

impl Index {
    pub fn new(num_columns: usize, key_column: usize) -> Self {
        let columns = (0..num_columns)
            .map(|column| {
                let map = if column == key_column {
                    Some(BTreeMap::new())
                } else {
                    None
                };
                RwLock::new(map)
            })
            .collect();

        Index {
            key_column,
            columns,
        }
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    /// Whether the given column currently has an index.
    pub fn has_index(&self, column: usize) -> bool {
        self.columns
            .get(column)
            .map_or(false, |map| map.read().unwrap().is_some())
    }

    /// Secondary columns that currently carry an index.
    pub fn secondary_columns(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|&column| column != self.key_column && self.has_index(column))
            .collect()
    }

    /// RIDs of all records with `value` in `column`. Empty when the column
    /// has no index or the value is absent.
    pub fn locate(&self, column: usize, value: i64) -> Vec<RID> {
        let guard = match self.columns.get(column) {
            Some(map) => map.read().unwrap(),
            None => return Vec::new(),
        };

        match guard.as_ref() {
            Some(map) => map.get(&value).cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// RIDs of all records whose `column` value lies in `[begin, end]`.
    pub fn locate_range(&self, begin: i64, end: i64, column: usize) -> Vec<RID> {
        let guard = match self.columns.get(column) {
            Some(map) => map.read().unwrap(),
            None => return Vec::new(),
        };

        let mut result = Vec::new();
        if let Some(map) = guard.as_ref() {
            for (_, rids) in map.range((Included(&begin), Included(&end))) {
                result.extend(rids.iter().copied());
            }
        }

        result
    }

    /// Add a (key value, RID) pair to the primary index.
    pub fn insert(&self, value: i64, rid: RID) {
        self.insert_into(self.key_column, value, rid);
    }

    /// Remove a (key value, RID) pair from the primary index.
    pub fn delete(&self, value: i64, rid: RID) {
        self.delete_from(self.key_column, value, rid);
    }

    /// Add a (value, base RID) pair to a secondary index, if one exists.
    pub fn insert_secondary(&self, column: usize, value: i64, rid: RID) {
        if column != self.key_column {
            self.insert_into(column, value, rid);
        }
    }

    /// Remove a (value, base RID) pair from a secondary index, if one exists.
    pub fn delete_secondary(&self, column: usize, value: i64, rid: RID) {
        if column != self.key_column {
            self.delete_from(column, value, rid);
        }
    }

    /// Create an empty index on a column. The caller backfills it from the
    /// page directory. No-op on the key column or an already-indexed column.
    pub fn create_index(&self, column: usize) {
        if column == self.key_column {
            return;
        }
        if let Some(map) = self.columns.get(column) {
            let mut guard = map.write().unwrap();
            if guard.is_none() {
                *guard = Some(BTreeMap::new());
            }
        }
    }

    /// Drop a secondary index. The key column's index cannot be dropped.
    pub fn drop_index(&self, column: usize) {
        if column == self.key_column {
            return;
        }
        if let Some(map) = self.columns.get(column) {
            *map.write().unwrap() = None;
        }
    }

    fn insert_into(&self, column: usize, value: i64, rid: RID) {
        if let Some(map) = self.columns.get(column) {
            if let Some(map) = map.write().unwrap().as_mut() {
                let rids = map.entry(value).or_default();
                if !rids.contains(&rid) {
                    rids.push(rid);
                }
            }
        }
    }

    fn delete_from(&self, column: usize, value: i64, rid: RID) {
        if let Some(map) = self.columns.get(column) {
            if let Some(map) = map.write().unwrap().as_mut() {
                if let Some(rids) = map.get_mut(&value) {
                    rids.retain(|existing| *existing != rid);
                    if rids.is_empty() {
                        map.remove(&value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_locate() {
        let index = Index::new(3, 0);
        index.insert(10, 0);
        index.insert(20, 1);

        assert_eq!(index.locate(0, 10), vec![0]);
        assert_eq!(index.locate(0, 30), Vec::<RID>::new());
    }

    #[test]
    fn test_locate_range_is_inclusive() {
        let index = Index::new(2, 0);
        for key in 1..=5 {
            index.insert(key, key);
        }

        let mut rids = index.locate_range(2, 4, 0);
        rids.sort();
        assert_eq!(rids, vec![2, 3, 4]);
    }

    #[test]
    fn test_secondary_lifecycle() {
        let index = Index::new(3, 0);

        // No index yet: writes are dropped, lookups come back empty.
        index.insert_secondary(2, 99, 7);
        assert!(!index.has_index(2));
        assert_eq!(index.locate(2, 99), Vec::<RID>::new());

        index.create_index(2);
        index.insert_secondary(2, 99, 7);
        index.insert_secondary(2, 99, 8);
        let mut rids = index.locate(2, 99);
        rids.sort();
        assert_eq!(rids, vec![7, 8]);

        index.delete_secondary(2, 99, 7);
        assert_eq!(index.locate(2, 99), vec![8]);

        index.drop_index(2);
        assert!(!index.has_index(2));
        assert_eq!(index.secondary_columns(), Vec::<usize>::new());
    }

    #[test]
    fn test_delete_removes_empty_value_entry() {
        let index = Index::new(1, 0);
        index.insert(5, 1);
        index.delete(5, 1);

        assert_eq!(index.locate(0, 5), Vec::<RID>::new());
        assert_eq!(index.locate_range(0, 10, 0), Vec::<RID>::new());
    }
}
