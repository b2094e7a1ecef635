use std::sync::Arc;

use crate::table::{Record, Table, RID};

/// The user-facing query interface over one table. Queries that fail for
/// any reason report plain failure (`false` / `None`) instead of
/// propagating errors; the typed errors stay inside the storage core.
pub struct Query {
    table: Arc<Table>,
}

impl Query {
    pub fn new(table: Arc<Table>) -> Self {
        Query { table }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Insert a record. All columns must be provided.
    pub fn insert(&self, columns: &[i64]) -> bool {
        self.table.insert(columns).is_ok()
    }

    /// Update the record with the given primary key. `None` entries leave
    /// their column unchanged.
    pub fn update(&self, primary_key: i64, columns: &[Option<i64>]) -> bool {
        let rids = self
            .table
            .index()
            .locate(self.table.key_column(), primary_key);
        match rids.first() {
            Some(&rid) => self.table.update(rid, columns).is_ok(),
            None => false,
        }
    }

    /// Delete the record with the given primary key.
    pub fn delete(&self, primary_key: i64) -> bool {
        let rids = self
            .table
            .index()
            .locate(self.table.key_column(), primary_key);
        match rids.first() {
            Some(&rid) => self.table.delete(rid).is_ok(),
            None => false,
        }
    }

    /// Read the latest version of every record whose `search_key_index`
    /// column equals `search_key`. `projected` is a 0/1 mask over the user
    /// columns; excluded columns come back as `None`. A key with no
    /// matching records yields an empty list, not a failure.
    pub fn select(
        &self,
        search_key: i64,
        search_key_index: usize,
        projected: &[usize],
    ) -> Option<Vec<Record>> {
        let num_columns = self.table.num_columns();
        if search_key_index >= num_columns || projected.len() != num_columns {
            return None;
        }

        let mut rids = self.table.index().locate(search_key_index, search_key);
        if rids.is_empty() && !self.table.index().has_index(search_key_index) {
            rids = self.full_scan(search_key, search_key_index)?;
        }

        let mut results = Vec::new();
        for rid in rids {
            match self.table.read(rid) {
                Ok(Some(record)) => results.push(project(&record, rid, projected)),
                Ok(None) => continue,
                Err(_) => return None,
            }
        }
        Some(results)
    }

    /// Like `select`, but resolving each record to a relative version:
    /// 0 is the live record, negative values walk backward along the tail
    /// chain. Returns failure when no record resolves.
    pub fn select_version(
        &self,
        search_key: i64,
        search_key_index: usize,
        projected: &[usize],
        relative_version: i64,
    ) -> Option<Vec<Record>> {
        if relative_version == 0 {
            return self.select(search_key, search_key_index, projected);
        }

        let num_columns = self.table.num_columns();
        if search_key_index >= num_columns || projected.len() != num_columns {
            return None;
        }

        let mut rids = self.table.index().locate(search_key_index, search_key);
        if rids.is_empty() && !self.table.index().has_index(search_key_index) {
            rids = self.full_scan(search_key, search_key_index)?;
        }
        if rids.is_empty() {
            return None;
        }

        let mut results = Vec::new();
        for base_rid in rids {
            match self.table.read_version(base_rid, relative_version) {
                Ok(Some(record)) => {
                    let resolved_rid = record.rid;
                    results.push(project(&record, resolved_rid, projected));
                }
                Ok(None) => continue,
                Err(_) => return None,
            }
        }

        if results.is_empty() {
            None
        } else {
            Some(results)
        }
    }

    /// Sum one column over all records whose primary key lies in
    /// `[start_range, end_range]`. An empty key range is a failure.
    pub fn sum(&self, start_range: i64, end_range: i64, column: usize) -> Option<i64> {
        if column >= self.table.num_columns() {
            return None;
        }

        let rids =
            self.table
                .index()
                .locate_range(start_range, end_range, self.table.key_column());
        if rids.is_empty() {
            return None;
        }

        let mut total = 0i64;
        for rid in rids {
            match self.table.read(rid) {
                Ok(Some(record)) => total += record.columns[column].unwrap_or(0),
                Ok(None) => continue,
                Err(_) => return None,
            }
        }
        Some(total)
    }

    /// `sum` at a relative version, resolving each key through the tail
    /// chain walk.
    pub fn sum_version(
        &self,
        start_range: i64,
        end_range: i64,
        column: usize,
        relative_version: i64,
    ) -> Option<i64> {
        if column >= self.table.num_columns() {
            return None;
        }

        let rids =
            self.table
                .index()
                .locate_range(start_range, end_range, self.table.key_column());
        if rids.is_empty() {
            return None;
        }

        let mut total = 0i64;
        let mut found_any = false;
        for rid in rids {
            match self.table.read_version(rid, relative_version) {
                Ok(Some(record)) => {
                    found_any = true;
                    total += record.columns[column].unwrap_or(0);
                }
                Ok(None) => continue,
                Err(_) => return None,
            }
        }

        if found_any {
            Some(total)
        } else {
            None
        }
    }

    /// Add one to a single column of the record with the given primary key.
    pub fn increment(&self, key: i64, column: usize) -> bool {
        let num_columns = self.table.num_columns();
        if column >= num_columns {
            return false;
        }

        let projection = vec![1; num_columns];
        let records = match self.select(key, self.table.key_column(), &projection) {
            Some(records) if !records.is_empty() => records,
            _ => return false,
        };

        let current = records[0].columns[column].unwrap_or(0);
        let mut updates = vec![None; num_columns];
        updates[column] = Some(current + 1);
        self.update(key, &updates)
    }

    /// Scan every base record's latest version for matches. Used when the
    /// searched column has no index.
    fn full_scan(&self, search_key: i64, search_key_index: usize) -> Option<Vec<RID>> {
        let mut rids = Vec::new();
        for rid in self.table.base_rids() {
            match self.table.read(rid) {
                Ok(Some(record)) if record.columns[search_key_index] == Some(search_key) => {
                    rids.push(rid)
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        Some(rids)
    }
}

fn project(record: &Record, rid: RID, projected: &[usize]) -> Record {
    let columns = record
        .columns
        .iter()
        .zip(projected.iter())
        .map(|(value, include)| if *include == 1 { *value } else { None })
        .collect();

    Record {
        rid,
        key: record.key,
        columns,
    }
}
