use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bufferpool::{BufferPool, PageKey, PageRef};
use crate::constants::{
    BASE_PAGES_PER_RANGE, BASE_RID_COLUMN, DELETED_RID, INDIRECTION_COLUMN, MERGE_THRESHOLD,
    NULL_RID, NUM_METADATA_COLS, RID_COLUMN, SCHEMA_ENCODING_COLUMN, TAIL_RID_BASE,
    TIMESTAMP_COLUMN, USER_COL_OFFSET,
};
use crate::database::{page_file_path, read_page_file, write_page_file};
use crate::errors::{DatabaseError, DatabaseResult};
use crate::helpers::{self, now_secs, update_mask};
use crate::index::Index;
use crate::page::Page;

/// Record identifier. Base RIDs grow upward from 0, tail RIDs upward from
/// `TAIL_RID_BASE`, so the two spaces never alias in the page directory.
pub type RID = i64;

/// The column pages that together store one row-parallel slab of records:
/// `NUM_METADATA_COLS` metadata pages followed by the user column pages.
pub(crate) type Bundle = Vec<PageRef>;

/// Physical address of one record, as stored in the page directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordLocation {
    pub range_id: usize,
    pub is_tail: bool,
    pub page_id: usize,
    pub offset: usize,
}

/// A materialized record. `columns` holds user columns only; the query
/// facade nulls out columns excluded from a projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub rid: RID,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
}

/// A merge result prepared in the background, waiting for a foreground
/// operation to publish it.
pub(crate) struct PendingMerge {
    base_pages: Vec<Bundle>,
    tps: Vec<i64>,
}

/// Up to `BASE_PAGES_PER_RANGE` base bundles of one insertion cohort, their
/// unbounded tail bundles, and the per-base-page tail-sequence watermark.
pub(crate) struct PageRange {
    pub base_pages: Vec<Bundle>,
    pub tail_pages: Vec<Bundle>,
    /// Highest tail RID merged into each base page. Starts at `NULL_RID`.
    pub tps: Vec<i64>,
    pub pending_merge: Option<PendingMerge>,
}

impl PageRange {
    fn new() -> Self {
        PageRange {
            base_pages: Vec::new(),
            tail_pages: Vec::new(),
            tps: Vec::new(),
            pending_merge: None,
        }
    }

    /// Whether this range may still accept a new base bundle.
    fn has_capacity(&self) -> bool {
        self.base_pages.len() < BASE_PAGES_PER_RANGE
    }
}

/// Table state shared between foreground operations and the merge worker.
pub(crate) struct TableState {
    name: String,
    num_columns: usize,
    key: usize,
    bufferpool: Arc<BufferPool>,
    db_path: Arc<RwLock<Option<PathBuf>>>,
    ranges: RwLock<Vec<PageRange>>,
    page_directory: RwLock<HashMap<RID, RecordLocation>>,
    index: Index,
    next_rid: AtomicI64,
    next_tail_rid: AtomicI64,
    update_count: AtomicUsize,
    merge_in_progress: AtomicBool,
    /// Protects the base-page swap, TPS consolidation, and `pending_merge`
    /// transitions. Tail writes deliberately proceed without it.
    merge_lock: Mutex<()>,
    merge_tx: Mutex<Option<Sender<()>>>,
}

/// A named table: ordered page ranges, a page directory from RID to
/// physical location, and per-column indexes. All user columns are signed
/// 64-bit integers; updates append cumulative tail records chained through
/// the indirection column.
pub struct Table {
    state: Arc<TableState>,
    merge_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Table {
    pub(crate) fn new(
        name: String,
        num_columns: usize,
        key: usize,
        bufferpool: Arc<BufferPool>,
        db_path: Arc<RwLock<Option<PathBuf>>>,
    ) -> Table {
        let state = Arc::new(TableState {
            index: Index::new(num_columns, key),
            name,
            num_columns,
            key,
            bufferpool,
            db_path,
            ranges: RwLock::new(Vec::new()),
            page_directory: RwLock::new(HashMap::new()),
            next_rid: AtomicI64::new(0),
            next_tail_rid: AtomicI64::new(TAIL_RID_BASE),
            update_count: AtomicUsize::new(0),
            merge_in_progress: AtomicBool::new(false),
            merge_lock: Mutex::new(()),
            merge_tx: Mutex::new(None),
        });

        let worker = spawn_merge_worker(&state);

        Table {
            state,
            merge_worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn num_columns(&self) -> usize {
        self.state.num_columns
    }

    pub fn key_column(&self) -> usize {
        self.state.key
    }

    pub fn index(&self) -> &Index {
        &self.state.index
    }

    /// Create a new base record. Fails with `DuplicateKey` if a live record
    /// with the same primary key exists.
    pub fn insert(&self, columns: &[i64]) -> DatabaseResult<RID> {
        self.state.insert(columns)
    }

    /// Read the latest version of the record reachable from `rid`, following
    /// the indirection chain. Unknown RIDs and tombstones read as `None`.
    pub fn read(&self, rid: RID) -> DatabaseResult<Option<Record>> {
        self.state.read(rid)
    }

    /// Read a relative version of a base record: 0 is the live record,
    /// negative values walk backward along the tail chain, falling through
    /// to the base record when the chain root is passed.
    pub fn read_version(&self, rid: RID, relative_version: i64) -> DatabaseResult<Option<Record>> {
        self.state.read_version(rid, relative_version)
    }

    /// Append a cumulative tail record for the given base RID. Entries of
    /// `columns` that are `None` keep their current value. Updating the key
    /// column is forbidden.
    pub fn update(&self, rid: RID, columns: &[Option<i64>]) -> DatabaseResult<()> {
        self.state.update(rid, columns)
    }

    /// Tombstone a record: write `DELETED_RID` into its indirection slot and
    /// drop its index entries. The page directory entry is kept so the
    /// tombstone survives a close/open cycle.
    pub fn delete(&self, rid: RID) -> DatabaseResult<()> {
        self.state.delete(rid)
    }

    /// Create a secondary index on a column and backfill it from the page
    /// directory. No-op on the key column.
    pub fn create_index(&self, column: usize) -> DatabaseResult<()> {
        if column >= self.state.num_columns {
            return Err(DatabaseError::InvalidArgument(format!(
                "column {column} out of range"
            )));
        }

        self.state.index.create_index(column);
        if column == self.state.key {
            return Ok(());
        }

        for rid in self.base_rids() {
            if let Some(record) = self.state.read(rid)? {
                if let Some(value) = record.columns[column] {
                    self.state.index.insert_secondary(column, value, rid);
                }
            }
        }

        Ok(())
    }

    pub fn drop_index(&self, column: usize) {
        self.state.index.drop_index(column);
    }

    pub fn merge_in_progress(&self) -> bool {
        self.state.merge_in_progress.load(Ordering::SeqCst)
    }

    /// Block until no background merge is running. Called before the table
    /// is persisted or dropped.
    pub fn wait_merge_idle(&self) {
        while self.merge_in_progress() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Base RIDs currently present in the page directory, tombstones
    /// included.
    pub(crate) fn base_rids(&self) -> Vec<RID> {
        self.state
            .page_directory
            .read()
            .unwrap()
            .iter()
            .filter(|(_, location)| !location.is_tail)
            .map(|(rid, _)| *rid)
            .collect()
    }

    /// Rebuild the primary index by scanning base page-directory entries.
    /// Tombstones read as `None` and are skipped.
    pub(crate) fn rebuild_primary_index(&self) -> DatabaseResult<()> {
        for rid in self.base_rids() {
            if let Some(record) = self.state.read(rid)? {
                self.state.index.insert(record.key, rid);
            }
        }
        Ok(())
    }

    /// Register every loaded page with the bufferpool at pin count zero so
    /// first accesses after an open are served without a disk read.
    pub(crate) fn warm_bufferpool(&self) -> DatabaseResult<()> {
        let ranges = self.state.ranges.read().unwrap();

        for (range_id, range) in ranges.iter().enumerate() {
            for (page_id, bundle) in range.base_pages.iter().enumerate() {
                for (col_index, page) in bundle.iter().enumerate() {
                    let key = self.state.page_key(range_id, false, page_id, col_index);
                    self.state.bufferpool.register_page(key, Arc::clone(page))?;
                }
            }
            for (page_id, bundle) in range.tail_pages.iter().enumerate() {
                for (col_index, page) in bundle.iter().enumerate() {
                    let key = self.state.page_key(range_id, true, page_id, col_index);
                    self.state.bufferpool.register_page(key, Arc::clone(page))?;
                }
            }
        }

        Ok(())
    }

    pub(crate) fn serialize(&self, root: &Path) -> DatabaseResult<()> {
        self.state.serialize(root)
    }

    pub(crate) fn deserialize(&self, root: &Path) -> DatabaseResult<()> {
        self.state.deserialize(root)
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<TableState> {
        &self.state
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop; join so no merge is
        // running when the table goes away.
        self.state.merge_tx.lock().unwrap().take();
        if let Some(worker) = self.merge_worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

/// Start the long-lived background merge worker for a table. Each signal
/// runs one merge pass over every page range, then clears the
/// `merge_in_progress` flag.
fn spawn_merge_worker(state: &Arc<TableState>) -> JoinHandle<()> {
    let (tx, rx) = mpsc::channel::<()>();
    *state.merge_tx.lock().unwrap() = Some(tx);

    let worker_state = Arc::clone(state);
    thread::spawn(move || {
        while rx.recv().is_ok() {
            worker_state.run_merge();
            worker_state.merge_in_progress.store(false, Ordering::SeqCst);
        }
    })
}

impl TableState {
    fn num_cols_per_bundle(&self) -> usize {
        NUM_METADATA_COLS + self.num_columns
    }

    /// Whether pages go through the bufferpool. Tables of an unopened
    /// database have no data path and work on their in-memory bundles
    /// directly.
    fn buffered(&self) -> bool {
        self.db_path.read().unwrap().is_some()
    }

    fn page_key(&self, range_id: usize, is_tail: bool, page_id: usize, col_index: usize) -> PageKey {
        PageKey::new(&self.name, range_id, is_tail, page_id, col_index)
    }

    /// The freshest handle for one page without pinning it: the
    /// bufferpool's frame if one exists, else the page's disk file (an
    /// evicted page reached disk through the write-back callback), else
    /// the range's bundle reference. After an eviction and reload the
    /// bundle reference can be stale.
    fn resolve_page(
        &self,
        range_id: usize,
        is_tail: bool,
        page_id: usize,
        col_index: usize,
        fallback: &PageRef,
    ) -> PageRef {
        let key = self.page_key(range_id, is_tail, page_id, col_index);
        if let Some(page) = self.bufferpool.peek_page(&key) {
            return page;
        }
        if let Some(root) = self.db_path.read().unwrap().clone() {
            let path = page_file_path(&root, &key);
            if path.exists() {
                if let Ok(page) = read_page_file(&path) {
                    return Arc::new(RwLock::new(page));
                }
            }
        }
        Arc::clone(fallback)
    }

    fn resolve_bundle(
        &self,
        range_id: usize,
        is_tail: bool,
        page_id: usize,
        bundle: &Bundle,
    ) -> Bundle {
        bundle
            .iter()
            .enumerate()
            .map(|(col_index, page)| self.resolve_page(range_id, is_tail, page_id, col_index, page))
            .collect()
    }

    /// Load one page for a bufferpool miss: from its disk file when one
    /// exists, else the in-memory bundle reference (a page created since
    /// the last flush has no file yet).
    fn load_page(&self, key: &PageKey, fallback: PageRef) -> DatabaseResult<PageRef> {
        if let Some(root) = self.db_path.read().unwrap().clone() {
            let path = page_file_path(&root, key);
            if path.exists() {
                return Ok(Arc::new(RwLock::new(read_page_file(&path)?)));
            }
        }
        Ok(fallback)
    }

    fn bundle_refs(
        &self,
        ranges: &[PageRange],
        range_id: usize,
        is_tail: bool,
        page_id: usize,
    ) -> DatabaseResult<Bundle> {
        let range = ranges
            .get(range_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("page range {range_id}")))?;
        let pages = if is_tail {
            &range.tail_pages
        } else {
            &range.base_pages
        };
        pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(format!("page {page_id} in range {range_id}")))
    }

    /// Fetch a bundle through the bufferpool, pinning every column page.
    /// Callers already hold the `ranges` lock and have applied any pending
    /// merge for the range.
    fn fetch_bundle_locked(
        &self,
        ranges: &[PageRange],
        range_id: usize,
        is_tail: bool,
        page_id: usize,
    ) -> DatabaseResult<Bundle> {
        let refs = self.bundle_refs(ranges, range_id, is_tail, page_id)?;
        if !self.buffered() {
            return Ok(refs);
        }

        let mut bundle = Vec::with_capacity(refs.len());
        for (col_index, fallback) in refs.into_iter().enumerate() {
            let key = self.page_key(range_id, is_tail, page_id, col_index);
            match self
                .bufferpool
                .get_page(key.clone(), || self.load_page(&key, fallback))
            {
                Ok(page) => bundle.push(page),
                Err(error) => {
                    // Release the pins taken so far.
                    for unpin_col in 0..col_index {
                        let key = self.page_key(range_id, is_tail, page_id, unpin_col);
                        self.bufferpool.unpin(&key, false);
                    }
                    return Err(error);
                }
            }
        }
        Ok(bundle)
    }

    /// Fetch a bundle from a cold start: applies any pending merge for base
    /// bundles, then pins through the bufferpool.
    fn fetch_bundle(&self, location: RecordLocation) -> DatabaseResult<Bundle> {
        if !location.is_tail {
            self.apply_pending_merge(location.range_id);
        }
        let refs = {
            let ranges = self.ranges.read().unwrap();
            self.bundle_refs(
                &ranges,
                location.range_id,
                location.is_tail,
                location.page_id,
            )?
        };
        if !self.buffered() {
            return Ok(refs);
        }

        let mut bundle = Vec::with_capacity(refs.len());
        for (col_index, fallback) in refs.into_iter().enumerate() {
            let key = self.page_key(
                location.range_id,
                location.is_tail,
                location.page_id,
                col_index,
            );
            match self
                .bufferpool
                .get_page(key.clone(), || self.load_page(&key, fallback))
            {
                Ok(page) => bundle.push(page),
                Err(error) => {
                    for unpin_col in 0..col_index {
                        let key = self.page_key(
                            location.range_id,
                            location.is_tail,
                            location.page_id,
                            unpin_col,
                        );
                        self.bufferpool.unpin(&key, false);
                    }
                    return Err(error);
                }
            }
        }
        Ok(bundle)
    }

    fn unpin_bundle(&self, range_id: usize, is_tail: bool, page_id: usize, dirty: bool) {
        if !self.buffered() {
            return;
        }
        for col_index in 0..self.num_cols_per_bundle() {
            let key = self.page_key(range_id, is_tail, page_id, col_index);
            self.bufferpool.unpin(&key, dirty);
        }
    }

    fn register_bundle(
        &self,
        range_id: usize,
        is_tail: bool,
        page_id: usize,
        bundle: &Bundle,
    ) -> DatabaseResult<()> {
        if !self.buffered() {
            return Ok(());
        }
        for (col_index, page) in bundle.iter().enumerate() {
            let key = self.page_key(range_id, is_tail, page_id, col_index);
            self.bufferpool.register_page(key, Arc::clone(page))?;
        }
        Ok(())
    }

    fn new_bundle(&self) -> Bundle {
        (0..self.num_cols_per_bundle())
            .map(|_| Arc::new(RwLock::new(Page::new())))
            .collect()
    }

    fn append_base_bundle(&self, range: &mut PageRange, range_id: usize) -> DatabaseResult<usize> {
        let bundle = self.new_bundle();
        range.base_pages.push(bundle.clone());
        if range.tps.len() < range.base_pages.len() {
            range.tps.push(NULL_RID);
        }
        let page_id = range.base_pages.len() - 1;
        self.register_bundle(range_id, false, page_id, &bundle)?;
        Ok(page_id)
    }

    fn append_tail_bundle(&self, range: &mut PageRange, range_id: usize) -> DatabaseResult<usize> {
        let bundle = self.new_bundle();
        range.tail_pages.push(bundle.clone());
        let page_id = range.tail_pages.len() - 1;
        self.register_bundle(range_id, true, page_id, &bundle)?;
        Ok(page_id)
    }

    fn read_user_columns(&self, bundle: &Bundle, offset: usize) -> DatabaseResult<Vec<i64>> {
        (0..self.num_columns)
            .map(|col| bundle[USER_COL_OFFSET + col].read().unwrap().read(offset))
            .collect()
    }

    fn location_of(&self, rid: RID) -> Option<RecordLocation> {
        self.page_directory.read().unwrap().get(&rid).copied()
    }

    // Core CRUD operations

    pub(crate) fn insert(&self, columns: &[i64]) -> DatabaseResult<RID> {
        if columns.len() != self.num_columns {
            return Err(DatabaseError::InvalidArgument(format!(
                "expected {} columns, got {}",
                self.num_columns,
                columns.len()
            )));
        }
        let key_value = columns[self.key];

        {
            let range_count = self.ranges.read().unwrap().len();
            if range_count > 0 {
                self.apply_pending_merge(range_count - 1);
            }
        }

        let mut ranges = self.ranges.write().unwrap();

        // Duplicate primary keys are rejected before anything is written.
        if !self.index.locate(self.key, key_value).is_empty() {
            return Err(DatabaseError::DuplicateKey(key_value));
        }

        if ranges.last().map_or(true, |range| !range.has_capacity()) {
            ranges.push(PageRange::new());
        }
        let range_id = ranges.len() - 1;

        let mut page_id = match ranges[range_id].base_pages.len() {
            0 => self.append_base_bundle(&mut ranges[range_id], range_id)?,
            n => n - 1,
        };
        let mut bundle = self.fetch_bundle_locked(&ranges, range_id, false, page_id)?;
        if !bundle[RID_COLUMN].read().unwrap().has_capacity() {
            self.unpin_bundle(range_id, false, page_id, false);
            page_id = self.append_base_bundle(&mut ranges[range_id], range_id)?;
            bundle = self.fetch_bundle_locked(&ranges, range_id, false, page_id)?;
        }

        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);

        let written = (|| -> DatabaseResult<usize> {
            bundle[INDIRECTION_COLUMN].write().unwrap().write(NULL_RID)?;
            let offset = bundle[RID_COLUMN].write().unwrap().write(rid)?;
            bundle[TIMESTAMP_COLUMN].write().unwrap().write(now_secs())?;
            bundle[SCHEMA_ENCODING_COLUMN].write().unwrap().write(0)?;
            bundle[BASE_RID_COLUMN].write().unwrap().write(rid)?;
            for (col, value) in columns.iter().enumerate() {
                bundle[USER_COL_OFFSET + col].write().unwrap().write(*value)?;
            }
            Ok(offset)
        })();
        self.unpin_bundle(range_id, false, page_id, written.is_ok());
        let offset = written?;
        drop(ranges);

        self.page_directory.write().unwrap().insert(
            rid,
            RecordLocation {
                range_id,
                is_tail: false,
                page_id,
                offset,
            },
        );

        self.index.insert(key_value, rid);
        for (col, value) in columns.iter().enumerate() {
            if col != self.key {
                self.index.insert_secondary(col, *value, rid);
            }
        }

        Ok(rid)
    }

    pub(crate) fn read(&self, rid: RID) -> DatabaseResult<Option<Record>> {
        // Iterate rather than recurse: tail chains can be long.
        let mut current_rid = rid;
        loop {
            let location = match self.location_of(current_rid) {
                Some(location) => location,
                None => return Ok(None),
            };

            let bundle = self.fetch_bundle(location)?;
            let outcome = (|| -> DatabaseResult<(i64, Vec<i64>)> {
                let indirection = bundle[INDIRECTION_COLUMN]
                    .read()
                    .unwrap()
                    .read(location.offset)?;
                let values = self.read_user_columns(&bundle, location.offset)?;
                Ok((indirection, values))
            })();
            self.unpin_bundle(location.range_id, location.is_tail, location.page_id, false);
            let (indirection, values) = outcome?;

            if indirection == DELETED_RID {
                return Ok(None);
            }

            // Base records with history defer to their latest tail.
            if !location.is_tail && indirection != NULL_RID {
                current_rid = indirection;
                continue;
            }

            let key_value = values[self.key];
            return Ok(Some(Record {
                rid: current_rid,
                key: key_value,
                columns: values.into_iter().map(Some).collect(),
            }));
        }
    }

    /// Read the record stored at `rid` without following any indirection.
    fn read_without_indirection(&self, rid: RID) -> DatabaseResult<Option<Record>> {
        let location = match self.location_of(rid) {
            Some(location) => location,
            None => return Ok(None),
        };

        let bundle = self.fetch_bundle(location)?;
        let values = self.read_user_columns(&bundle, location.offset);
        self.unpin_bundle(location.range_id, location.is_tail, location.page_id, false);
        let values = values?;

        let key_value = values[self.key];
        Ok(Some(Record {
            rid,
            key: key_value,
            columns: values.into_iter().map(Some).collect(),
        }))
    }

    pub(crate) fn read_version(
        &self,
        rid: RID,
        relative_version: i64,
    ) -> DatabaseResult<Option<Record>> {
        let location = match self.location_of(rid) {
            Some(location) => location,
            None => return Ok(None),
        };
        if location.is_tail {
            return Ok(None);
        }

        let bundle = self.fetch_bundle(location)?;
        let latest = bundle[INDIRECTION_COLUMN]
            .read()
            .unwrap()
            .read(location.offset);
        self.unpin_bundle(location.range_id, false, location.page_id, false);
        let latest = latest?;

        if latest == DELETED_RID {
            return Ok(None);
        }

        // A record never updated resolves every version to its base.
        let mut current_rid = if latest == NULL_RID { rid } else { latest };

        for _ in 0..relative_version.unsigned_abs() {
            if current_rid == NULL_RID {
                current_rid = rid;
                break;
            }
            let current = match self.location_of(current_rid) {
                Some(location) => location,
                None => {
                    current_rid = rid;
                    break;
                }
            };
            if !current.is_tail {
                break;
            }

            // One hop toward the chain root.
            let tail_bundle = self.fetch_bundle(current)?;
            let previous = tail_bundle[INDIRECTION_COLUMN]
                .read()
                .unwrap()
                .read(current.offset);
            self.unpin_bundle(current.range_id, true, current.page_id, false);
            let previous = previous?;

            if previous == NULL_RID {
                current_rid = rid;
                break;
            }
            current_rid = previous;
        }

        // A resolved version is read verbatim, without following
        // indirection again.
        self.read_without_indirection(current_rid)
    }

    pub(crate) fn update(&self, rid: RID, columns: &[Option<i64>]) -> DatabaseResult<()> {
        if columns.len() != self.num_columns {
            return Err(DatabaseError::InvalidArgument(format!(
                "expected {} columns, got {}",
                self.num_columns,
                columns.len()
            )));
        }
        if columns[self.key].is_some() {
            return Err(DatabaseError::InvalidArgument(
                "the primary key column cannot be updated".to_string(),
            ));
        }

        let location = self
            .location_of(rid)
            .ok_or_else(|| DatabaseError::NotFound(format!("rid {rid}")))?;
        if location.is_tail {
            return Err(DatabaseError::InvalidArgument(
                "updates target base records".to_string(),
            ));
        }

        self.apply_pending_merge(location.range_id);

        let mut ranges = self.ranges.write().unwrap();
        let base_bundle = self.fetch_bundle_locked(&ranges, location.range_id, false, location.page_id)?;

        let outcome = self.append_update(&mut ranges, location, rid, columns, &base_bundle);
        self.unpin_bundle(location.range_id, false, location.page_id, outcome.is_ok());
        drop(ranges);
        let (current_values, new_values) = outcome?;

        // Secondary indexes key by base RID and track the latest values.
        for col in 0..self.num_columns {
            if col == self.key || !self.index.has_index(col) {
                continue;
            }
            if current_values[col] != new_values[col] {
                self.index.delete_secondary(col, current_values[col], rid);
                self.index.insert_secondary(col, new_values[col], rid);
            }
        }

        // Trigger a background merge once enough updates have accumulated.
        let count = self.update_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= MERGE_THRESHOLD
            && self
                .merge_in_progress
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.update_count.store(0, Ordering::SeqCst);
            let sent = self
                .merge_tx
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |tx| tx.send(()).is_ok());
            if !sent {
                self.merge_in_progress.store(false, Ordering::SeqCst);
            }
        }

        Ok(())
    }

    /// The pinned-base portion of `update`: build the cumulative tail
    /// record, install it, and re-point the base record's metadata. Returns
    /// the previous and new cumulative values for index maintenance. On
    /// error the base indirection is left untouched, so the record stays
    /// readable at its previous version.
    fn append_update(
        &self,
        ranges: &mut Vec<PageRange>,
        location: RecordLocation,
        base_rid: RID,
        columns: &[Option<i64>],
        base_bundle: &Bundle,
    ) -> DatabaseResult<(Vec<i64>, Vec<i64>)> {
        let prev_tail_rid = base_bundle[INDIRECTION_COLUMN]
            .read()
            .unwrap()
            .read(location.offset)?;

        // Cumulative scheme: start from the latest values, which live in
        // the previous tail if the record has one.
        let current_values = if prev_tail_rid == NULL_RID {
            self.read_user_columns(base_bundle, location.offset)?
        } else {
            let tail_location = self.location_of(prev_tail_rid).ok_or_else(|| {
                DatabaseError::NotFound(format!("tail rid {prev_tail_rid}"))
            })?;
            let tail_bundle = self.fetch_bundle_locked(
                &ranges[..],
                tail_location.range_id,
                tail_location.is_tail,
                tail_location.page_id,
            )?;
            let values = self.read_user_columns(&tail_bundle, tail_location.offset);
            self.unpin_bundle(
                tail_location.range_id,
                tail_location.is_tail,
                tail_location.page_id,
                false,
            );
            values?
        };

        let mask = update_mask(columns);
        if mask == 0 {
            return Err(DatabaseError::InvalidArgument(
                "update changes no columns".to_string(),
            ));
        }

        let new_values: Vec<i64> = current_values
            .iter()
            .zip(columns.iter())
            .map(|(current, update)| update.unwrap_or(*current))
            .collect();

        let new_tail_rid = self.next_tail_rid.fetch_add(1, Ordering::SeqCst);

        let range_id = location.range_id;
        let mut tail_page_id = match ranges[range_id].tail_pages.len() {
            0 => self.append_tail_bundle(&mut ranges[range_id], range_id)?,
            n => n - 1,
        };
        let mut tail_bundle = self.fetch_bundle_locked(&ranges[..], range_id, true, tail_page_id)?;
        if !tail_bundle[RID_COLUMN].read().unwrap().has_capacity() {
            self.unpin_bundle(range_id, true, tail_page_id, false);
            tail_page_id = self.append_tail_bundle(&mut ranges[range_id], range_id)?;
            tail_bundle = self.fetch_bundle_locked(&ranges[..], range_id, true, tail_page_id)?;
        }

        let written = (|| -> DatabaseResult<usize> {
            let tail_offset = tail_bundle[RID_COLUMN].write().unwrap().write(new_tail_rid)?;
            tail_bundle[INDIRECTION_COLUMN]
                .write()
                .unwrap()
                .write(prev_tail_rid)?;
            tail_bundle[TIMESTAMP_COLUMN].write().unwrap().write(now_secs())?;
            tail_bundle[SCHEMA_ENCODING_COLUMN].write().unwrap().write(mask)?;
            tail_bundle[BASE_RID_COLUMN].write().unwrap().write(base_rid)?;
            for (col, value) in new_values.iter().enumerate() {
                tail_bundle[USER_COL_OFFSET + col].write().unwrap().write(*value)?;
            }
            Ok(tail_offset)
        })();
        self.unpin_bundle(range_id, true, tail_page_id, written.is_ok());
        let tail_offset = written?;

        self.page_directory.write().unwrap().insert(
            new_tail_rid,
            RecordLocation {
                range_id,
                is_tail: true,
                page_id: tail_page_id,
                offset: tail_offset,
            },
        );

        // Re-point the base record and fold the update into its schema
        // encoding.
        base_bundle[INDIRECTION_COLUMN]
            .write()
            .unwrap()
            .update(location.offset, new_tail_rid)?;
        let old_schema = base_bundle[SCHEMA_ENCODING_COLUMN]
            .read()
            .unwrap()
            .read(location.offset)?;
        base_bundle[SCHEMA_ENCODING_COLUMN]
            .write()
            .unwrap()
            .update(location.offset, old_schema | mask)?;

        Ok((current_values, new_values))
    }

    pub(crate) fn delete(&self, rid: RID) -> DatabaseResult<()> {
        let location = self
            .location_of(rid)
            .ok_or_else(|| DatabaseError::NotFound(format!("rid {rid}")))?;

        if !location.is_tail {
            self.apply_pending_merge(location.range_id);
        }

        let ranges = self.ranges.write().unwrap();
        let bundle =
            self.fetch_bundle_locked(&ranges, location.range_id, location.is_tail, location.page_id)?;

        let outcome = (|| -> DatabaseResult<(i64, Vec<i64>)> {
            let key_value = bundle[USER_COL_OFFSET + self.key]
                .read()
                .unwrap()
                .read(location.offset)?;
            let indirection = bundle[INDIRECTION_COLUMN]
                .read()
                .unwrap()
                .read(location.offset)?;

            // Secondary cleanup needs the latest values, which may live in
            // a tail record.
            let current_values = if !location.is_tail
                && indirection != NULL_RID
                && indirection != DELETED_RID
            {
                match self.location_of(indirection) {
                    Some(tail_location) => {
                        let tail_bundle = self.fetch_bundle_locked(
                            &ranges,
                            tail_location.range_id,
                            tail_location.is_tail,
                            tail_location.page_id,
                        )?;
                        let values = self.read_user_columns(&tail_bundle, tail_location.offset);
                        self.unpin_bundle(
                            tail_location.range_id,
                            tail_location.is_tail,
                            tail_location.page_id,
                            false,
                        );
                        values?
                    }
                    None => self.read_user_columns(&bundle, location.offset)?,
                }
            } else {
                self.read_user_columns(&bundle, location.offset)?
            };

            bundle[INDIRECTION_COLUMN]
                .write()
                .unwrap()
                .update(location.offset, DELETED_RID)?;

            Ok((key_value, current_values))
        })();
        self.unpin_bundle(
            location.range_id,
            location.is_tail,
            location.page_id,
            outcome.is_ok(),
        );
        drop(ranges);
        let (key_value, current_values) = outcome?;

        self.index.delete(key_value, rid);
        for (col, value) in current_values.iter().enumerate() {
            if col != self.key {
                self.index.delete_secondary(col, *value, rid);
            }
        }

        // The page directory entry stays: the tombstone must survive a
        // serialize/deserialize cycle.
        Ok(())
    }

    // Background merge

    /// One merge pass over every page range. Runs on the merge worker.
    pub(crate) fn run_merge(&self) {
        let range_count = self.ranges.read().unwrap().len();
        for range_id in 0..range_count {
            // A failed range merge leaves that range unmerged; nothing to
            // unwind because results only become visible on publication.
            let _ = self.merge_range(range_id);
        }
    }

    fn merge_range(&self, range_id: usize) -> DatabaseResult<()> {
        // Snapshot under the merge lock: tail bundle handles with their
        // record counts, a deep copy of the base bundles, and the TPS.
        let (tail_snapshot, tail_sizes, merged_base, mut merged_tps) = {
            let _merge = self.merge_lock.lock().unwrap();
            let ranges = self.ranges.read().unwrap();
            let range = match ranges.get(range_id) {
                Some(range) if !range.tail_pages.is_empty() => range,
                _ => return Ok(()),
            };

            let tail_snapshot: Vec<Bundle> = range
                .tail_pages
                .iter()
                .enumerate()
                .map(|(page_id, bundle)| self.resolve_bundle(range_id, true, page_id, bundle))
                .collect();
            let tail_sizes: Vec<usize> = tail_snapshot
                .iter()
                .map(|bundle| bundle[RID_COLUMN].read().unwrap().num_records())
                .collect();

            let merged_base: Vec<Bundle> = range
                .base_pages
                .iter()
                .enumerate()
                .map(|(page_id, bundle)| {
                    self.resolve_bundle(range_id, false, page_id, bundle)
                        .iter()
                        .map(|page| Arc::new(RwLock::new(page.read().unwrap().clone())))
                        .collect()
                })
                .collect();
            let merged_tps: Vec<i64> = (0..merged_base.len())
                .map(|page_id| range.tps.get(page_id).copied().unwrap_or(NULL_RID))
                .collect();

            (tail_snapshot, tail_sizes, merged_base, merged_tps)
        };
        let snapshot_tail_count = tail_snapshot.len();

        // Walk the snapshotted tails newest-first, outside the lock, so
        // only the latest update counts for each base record.
        let mut already_merged: HashSet<RID> = HashSet::new();
        for bundle_idx in (0..snapshot_tail_count).rev() {
            let bundle = &tail_snapshot[bundle_idx];
            for slot in (0..tail_sizes[bundle_idx]).rev() {
                let base_rid = bundle[BASE_RID_COLUMN].read().unwrap().read(slot)?;
                if base_rid == NULL_RID || base_rid == DELETED_RID {
                    continue;
                }
                if already_merged.contains(&base_rid) {
                    continue;
                }
                let base_location = match self.location_of(base_rid) {
                    Some(location) => location,
                    None => continue,
                };
                if base_location.is_tail || base_location.range_id != range_id {
                    continue;
                }
                let tail_rid = bundle[RID_COLUMN].read().unwrap().read(slot)?;
                if let Some(entry) = merged_tps.get_mut(base_location.page_id) {
                    *entry = (*entry).max(tail_rid);
                }
                already_merged.insert(base_rid);
            }
        }

        // Reconcile tails appended while we worked, then publish.
        {
            let _merge = self.merge_lock.lock().unwrap();
            let mut ranges = self.ranges.write().unwrap();
            let range = match ranges.get_mut(range_id) {
                Some(range) => range,
                None => return Ok(()),
            };

            let current_tail_count = range.tail_pages.len();
            for bundle_idx in snapshot_tail_count..current_tail_count {
                let bundle =
                    self.resolve_bundle(range_id, true, bundle_idx, &range.tail_pages[bundle_idx]);
                let size = bundle[RID_COLUMN].read().unwrap().num_records();
                self.reconcile_tail_bundle(&bundle, 0, size, range_id, &mut merged_tps)?;
            }

            if snapshot_tail_count > 0 {
                let bundle = &tail_snapshot[snapshot_tail_count - 1];
                let old_size = tail_sizes[snapshot_tail_count - 1];
                let new_size = bundle[RID_COLUMN].read().unwrap().num_records();
                self.reconcile_tail_bundle(bundle, old_size, new_size, range_id, &mut merged_tps)?;
            }

            range.pending_merge = Some(PendingMerge {
                base_pages: merged_base,
                tps: merged_tps,
            });
        }

        Ok(())
    }

    fn reconcile_tail_bundle(
        &self,
        bundle: &Bundle,
        from_slot: usize,
        to_slot: usize,
        range_id: usize,
        merged_tps: &mut [i64],
    ) -> DatabaseResult<()> {
        for slot in from_slot..to_slot {
            let base_rid = bundle[BASE_RID_COLUMN].read().unwrap().read(slot)?;
            if base_rid == NULL_RID || base_rid == DELETED_RID {
                continue;
            }
            let base_location = match self.location_of(base_rid) {
                Some(location) => location,
                None => continue,
            };
            if base_location.is_tail || base_location.range_id != range_id {
                continue;
            }
            let tail_rid = bundle[RID_COLUMN].read().unwrap().read(slot)?;
            if let Some(entry) = merged_tps.get_mut(base_location.page_id) {
                *entry = (*entry).max(tail_rid);
            }
        }
        Ok(())
    }

    /// Publish a prepared merge result in the foreground. Called by every
    /// operation that fetches a base bundle. Swaps the range's base pages
    /// and any live bufferpool frames to the merged copies in one step
    /// under the merge lock.
    pub(crate) fn apply_pending_merge(&self, range_id: usize) {
        {
            let ranges = self.ranges.read().unwrap();
            match ranges.get(range_id) {
                Some(range) if range.pending_merge.is_some() => {}
                _ => return,
            }
        }

        let _merge = self.merge_lock.lock().unwrap();
        let mut ranges = self.ranges.write().unwrap();
        let range = match ranges.get_mut(range_id) {
            Some(range) => range,
            None => return,
        };
        // Another foreground thread may have already applied it.
        let pending = match range.pending_merge.take() {
            Some(pending) => pending,
            None => return,
        };

        range.base_pages = pending.base_pages;
        if range.tps.len() < range.base_pages.len() {
            range.tps.resize(range.base_pages.len(), NULL_RID);
        }
        for (page_id, tps_value) in pending.tps.iter().enumerate() {
            if let Some(entry) = range.tps.get_mut(page_id) {
                *entry = (*entry).max(*tps_value);
            }
        }

        // Keep bufferpool frames consistent: pinned readers elsewhere must
        // keep seeing a valid page.
        for (page_id, bundle) in range.base_pages.iter().enumerate() {
            for (col_index, page) in bundle.iter().enumerate() {
                let key = self.page_key(range_id, false, page_id, col_index);
                if self.bufferpool.is_in_pool(&key) {
                    self.bufferpool.swap_frame_page(&key, Arc::clone(page));
                }
            }
        }
    }

    // Persistence

    pub(crate) fn serialize(&self, root: &Path) -> DatabaseResult<()> {
        let table_dir = root.join(&self.name);
        std::fs::create_dir_all(&table_dir)?;

        let ranges = self.ranges.read().unwrap();

        let mut meta = File::create(table_dir.join("meta.bin"))?;
        helpers::write_i64(&mut meta, self.next_rid.load(Ordering::SeqCst))?;
        helpers::write_i64(&mut meta, self.next_tail_rid.load(Ordering::SeqCst))?;
        helpers::write_i32(&mut meta, self.num_columns as i32)?;
        helpers::write_i32(&mut meta, self.key as i32)?;
        helpers::write_i32(&mut meta, ranges.len() as i32)?;

        let directory = self.page_directory.read().unwrap();
        let mut pd = File::create(table_dir.join("page_directory.bin"))?;
        helpers::write_i64(&mut pd, directory.len() as i64)?;
        for (rid, location) in directory.iter() {
            helpers::write_i64(&mut pd, *rid)?;
            helpers::write_i32(&mut pd, location.range_id as i32)?;
            helpers::write_i32(&mut pd, if location.is_tail { 1 } else { 0 })?;
            helpers::write_i32(&mut pd, location.page_id as i32)?;
            helpers::write_i32(&mut pd, location.offset as i32)?;
        }
        drop(pd);

        for (range_id, range) in ranges.iter().enumerate() {
            let range_dir = table_dir.join("ranges").join(format!("range_{range_id}"));
            std::fs::create_dir_all(&range_dir)?;

            let mut range_meta = File::create(range_dir.join("range_meta.bin"))?;
            helpers::write_i32(&mut range_meta, range.base_pages.len() as i32)?;
            helpers::write_i32(&mut range_meta, range.tail_pages.len() as i32)?;
            drop(range_meta);

            for (page_id, bundle) in range.base_pages.iter().enumerate() {
                for (col_index, page) in bundle.iter().enumerate() {
                    let key = self.page_key(range_id, false, page_id, col_index);
                    self.serialize_page(root, &key, page)?;
                }
            }
            for (page_id, bundle) in range.tail_pages.iter().enumerate() {
                for (col_index, page) in bundle.iter().enumerate() {
                    let key = self.page_key(range_id, true, page_id, col_index);
                    self.serialize_page(root, &key, page)?;
                }
            }
        }

        Ok(())
    }

    /// Write one page out, choosing the freshest copy. The bufferpool's
    /// frame may be newer than the range's bundle reference; a page that
    /// was evicted already reached disk through the write-back callback,
    /// so rewriting it from the stale bundle reference would lose data.
    fn serialize_page(
        &self,
        root: &Path,
        key: &PageKey,
        bundle_page: &PageRef,
    ) -> DatabaseResult<()> {
        if let Some(page) = self.bufferpool.peek_page(key) {
            return write_page_file(root, key, &page.read().unwrap());
        }
        if page_file_path(root, key).exists() {
            return Ok(());
        }
        write_page_file(root, key, &bundle_page.read().unwrap())
    }

    pub(crate) fn deserialize(&self, root: &Path) -> DatabaseResult<()> {
        let table_dir = root.join(&self.name);

        let mut meta = File::open(table_dir.join("meta.bin"))?;
        let next_rid = helpers::read_i64(&mut meta)?;
        let next_tail_rid = helpers::read_i64(&mut meta)?;
        let num_columns = helpers::read_i32(&mut meta)? as usize;
        let key = helpers::read_i32(&mut meta)? as usize;
        let num_ranges = helpers::read_i32(&mut meta)? as usize;

        if num_columns != self.num_columns || key != self.key {
            return Err(DatabaseError::InvalidArgument(format!(
                "table {} metadata does not match the catalog",
                self.name
            )));
        }

        self.next_rid.store(next_rid, Ordering::SeqCst);
        self.next_tail_rid.store(next_tail_rid, Ordering::SeqCst);

        let mut pd = File::open(table_dir.join("page_directory.bin"))?;
        let count = helpers::read_i64(&mut pd)? as usize;
        let mut directory = HashMap::with_capacity(count);
        for _ in 0..count {
            let rid = helpers::read_i64(&mut pd)?;
            let range_id = helpers::read_i32(&mut pd)? as usize;
            let is_tail = helpers::read_i32(&mut pd)? != 0;
            let page_id = helpers::read_i32(&mut pd)? as usize;
            let offset = helpers::read_i32(&mut pd)? as usize;
            directory.insert(
                rid,
                RecordLocation {
                    range_id,
                    is_tail,
                    page_id,
                    offset,
                },
            );
        }

        let num_cols = self.num_cols_per_bundle();
        let mut new_ranges = Vec::with_capacity(num_ranges);
        for range_id in 0..num_ranges {
            let range_dir = table_dir.join("ranges").join(format!("range_{range_id}"));
            let mut range = PageRange::new();

            let mut range_meta = File::open(range_dir.join("range_meta.bin"))?;
            let num_base = helpers::read_i32(&mut range_meta)? as usize;
            let num_tail = helpers::read_i32(&mut range_meta)? as usize;

            for page_id in 0..num_base {
                let mut bundle = Vec::with_capacity(num_cols);
                for col_index in 0..num_cols {
                    let key = self.page_key(range_id, false, page_id, col_index);
                    let page = read_page_file(&page_file_path(root, &key))?;
                    bundle.push(Arc::new(RwLock::new(page)));
                }
                range.base_pages.push(bundle);
                range.tps.push(NULL_RID);
            }

            for page_id in 0..num_tail {
                let mut bundle = Vec::with_capacity(num_cols);
                for col_index in 0..num_cols {
                    let key = self.page_key(range_id, true, page_id, col_index);
                    let page = read_page_file(&page_file_path(root, &key))?;
                    bundle.push(Arc::new(RwLock::new(page)));
                }
                range.tail_pages.push(bundle);
            }

            new_ranges.push(range);
        }

        *self.ranges.write().unwrap() = new_ranges;
        *self.page_directory.write().unwrap() = directory;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufferpool::BufferPool;

    fn test_table(num_columns: usize) -> Table {
        Table::new(
            "grades".to_string(),
            num_columns,
            0,
            Arc::new(BufferPool::new()),
            Arc::new(RwLock::new(None)),
        )
    }

    #[test]
    fn test_insert_then_read() {
        let table = test_table(3);

        let rid = table.insert(&[1, 10, 100]).unwrap();
        let record = table.read(rid).unwrap().unwrap();
        assert_eq!(record.key, 1);
        assert_eq!(record.columns, vec![Some(1), Some(10), Some(100)]);

        assert_eq!(table.index().locate(0, 1), vec![rid]);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let table = test_table(3);

        let rid = table.insert(&[1, 10, 100]).unwrap();
        let result = table.insert(&[1, 99, 999]);
        assert!(matches!(result, Err(DatabaseError::DuplicateKey(1))));

        // The losing insert must not have disturbed the stored record.
        let record = table.read(rid).unwrap().unwrap();
        assert_eq!(record.columns, vec![Some(1), Some(10), Some(100)]);
        assert_eq!(table.index().locate(0, 1).len(), 1);
    }

    #[test]
    fn test_update_merges_partial_columns() {
        let table = test_table(3);

        let rid = table.insert(&[5, 50, 500]).unwrap();
        table.update(rid, &[None, Some(51), None]).unwrap();
        table.update(rid, &[None, Some(52), Some(502)]).unwrap();

        let record = table.read(rid).unwrap().unwrap();
        assert_eq!(record.columns, vec![Some(5), Some(52), Some(502)]);
        // Latest reads resolve to the newest tail record.
        assert!(record.rid >= TAIL_RID_BASE);
    }

    #[test]
    fn test_read_version_walks_backward() {
        let table = test_table(3);

        let rid = table.insert(&[5, 50, 500]).unwrap();
        table.update(rid, &[None, Some(51), None]).unwrap();
        table.update(rid, &[None, Some(52), Some(502)]).unwrap();

        let latest = table.read_version(rid, 0).unwrap().unwrap();
        assert_eq!(latest.columns, vec![Some(5), Some(52), Some(502)]);

        let minus_one = table.read_version(rid, -1).unwrap().unwrap();
        assert_eq!(minus_one.columns, vec![Some(5), Some(51), Some(500)]);

        // Walking past the chain root lands on the base record.
        let minus_two = table.read_version(rid, -2).unwrap().unwrap();
        assert_eq!(minus_two.columns, vec![Some(5), Some(50), Some(500)]);
        let minus_three = table.read_version(rid, -3).unwrap().unwrap();
        assert_eq!(minus_three.columns, vec![Some(5), Some(50), Some(500)]);
    }

    #[test]
    fn test_read_version_of_never_updated_record() {
        let table = test_table(3);

        let rid = table.insert(&[9, 90, 900]).unwrap();
        for version in [-1, -2, -5] {
            let record = table.read_version(rid, version).unwrap().unwrap();
            assert_eq!(record.columns, vec![Some(9), Some(90), Some(900)]);
            assert_eq!(record.rid, rid);
        }
    }

    #[test]
    fn test_delete_tombstones_record() {
        let table = test_table(3);

        let rid = table.insert(&[7, 70, 700]).unwrap();
        table.update(rid, &[None, Some(71), None]).unwrap();
        table.delete(rid).unwrap();

        assert_eq!(table.read(rid).unwrap(), None);
        assert_eq!(table.read_version(rid, -1).unwrap(), None);
        assert!(table.index().locate(0, 7).is_empty());

        // The page directory keeps the tombstone entry.
        assert!(table
            .state()
            .page_directory
            .read()
            .unwrap()
            .contains_key(&rid));
    }

    #[test]
    fn test_delete_then_reinsert_same_key() {
        let table = test_table(3);

        let first = table.insert(&[7, 70, 700]).unwrap();
        table.delete(first).unwrap();

        let second = table.insert(&[7, 71, 701]).unwrap();
        assert_ne!(first, second);
        let record = table.read(second).unwrap().unwrap();
        assert_eq!(record.columns, vec![Some(7), Some(71), Some(701)]);
    }

    #[test]
    fn test_update_validations() {
        let table = test_table(3);
        let rid = table.insert(&[1, 10, 100]).unwrap();

        assert!(matches!(
            table.update(rid, &[None, Some(2)]),
            Err(DatabaseError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.update(rid, &[Some(2), None, None]),
            Err(DatabaseError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.update(rid, &[None, None, None]),
            Err(DatabaseError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.update(999, &[None, Some(2), None]),
            Err(DatabaseError::NotFound(_))
        ));

        // Tail RIDs are not valid update targets.
        table.update(rid, &[None, Some(11), None]).unwrap();
        let tail_rid = table.read(rid).unwrap().unwrap().rid;
        assert!(matches!(
            table.update(tail_rid, &[None, Some(12), None]),
            Err(DatabaseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rid_spaces_are_disjoint() {
        let table = test_table(2);

        for key in 0..5 {
            let rid = table.insert(&[key, key * 10]).unwrap();
            table.update(rid, &[None, Some(key * 10 + 1)]).unwrap();
        }

        let directory = table.state().page_directory.read().unwrap();
        for (rid, location) in directory.iter() {
            if location.is_tail {
                assert!(*rid >= TAIL_RID_BASE);
            } else {
                assert!(*rid < TAIL_RID_BASE);
            }
        }
    }

    #[test]
    fn test_insert_rolls_to_new_bundle_when_page_fills() {
        let table = test_table(2);

        for key in 0..(crate::constants::SLOTS_PER_PAGE as i64 + 1) {
            table.insert(&[key, key]).unwrap();
        }

        let directory = table.state().page_directory.read().unwrap();
        let last = directory[&(crate::constants::SLOTS_PER_PAGE as i64)];
        assert_eq!(last.page_id, 1);
        assert_eq!(last.offset, 0);

        let ranges = table.state().ranges.read().unwrap();
        assert_eq!(ranges[0].base_pages.len(), 2);
        assert_eq!(ranges[0].tps, vec![NULL_RID, NULL_RID]);
    }

    #[test]
    fn test_merge_consolidates_tps_watermark() {
        let table = test_table(3);

        let first = table.insert(&[1, 10, 100]).unwrap();
        let second = table.insert(&[2, 20, 200]).unwrap();
        table.update(first, &[None, Some(11), None]).unwrap();
        table.update(second, &[None, Some(21), None]).unwrap();
        table.update(first, &[None, Some(12), None]).unwrap();

        table.state().run_merge();
        assert!(table.state().ranges.read().unwrap()[0]
            .pending_merge
            .is_some());

        // The next foreground base access publishes the result.
        table.read(first).unwrap();

        let ranges = table.state().ranges.read().unwrap();
        assert!(ranges[0].pending_merge.is_none());
        // Three tail records were written; the watermark is the newest.
        assert_eq!(ranges[0].tps[0], TAIL_RID_BASE + 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let table = test_table(3);

        let rid = table.insert(&[1, 10, 100]).unwrap();
        table.update(rid, &[None, Some(11), None]).unwrap();
        table.update(rid, &[None, None, Some(102)]).unwrap();

        table.state().run_merge();
        table.read(rid).unwrap();
        let (first_tps, first_bytes) = {
            let ranges = table.state().ranges.read().unwrap();
            let page = ranges[0].base_pages[0][USER_COL_OFFSET + 1].read().unwrap();
            (ranges[0].tps.clone(), page.to_bytes().to_vec())
        };

        table.state().run_merge();
        table.read(rid).unwrap();
        let (second_tps, second_bytes) = {
            let ranges = table.state().ranges.read().unwrap();
            let page = ranges[0].base_pages[0][USER_COL_OFFSET + 1].read().unwrap();
            (ranges[0].tps.clone(), page.to_bytes().to_vec())
        };

        assert_eq!(first_tps, second_tps);
        assert_eq!(first_bytes, second_bytes);
    }

    #[test]
    fn test_merge_preserves_historical_versions() {
        let table = test_table(3);

        let rid = table.insert(&[5, 50, 500]).unwrap();
        table.update(rid, &[None, Some(51), None]).unwrap();
        table.update(rid, &[None, Some(52), None]).unwrap();

        table.state().run_merge();
        table.read(rid).unwrap(); // applies the pending merge

        let latest = table.read(rid).unwrap().unwrap();
        assert_eq!(latest.columns, vec![Some(5), Some(52), Some(500)]);
        let minus_one = table.read_version(rid, -1).unwrap().unwrap();
        assert_eq!(minus_one.columns, vec![Some(5), Some(51), Some(500)]);
        let minus_two = table.read_version(rid, -2).unwrap().unwrap();
        assert_eq!(minus_two.columns, vec![Some(5), Some(50), Some(500)]);
    }

    #[test]
    fn test_merge_skips_ranges_without_tails() {
        let table = test_table(2);
        table.insert(&[1, 10]).unwrap();

        table.state().run_merge();
        let ranges = table.state().ranges.read().unwrap();
        assert!(ranges[0].pending_merge.is_none());
        assert_eq!(ranges[0].tps, vec![NULL_RID]);
    }

    #[test]
    fn test_background_merge_triggers_at_threshold() {
        let table = test_table(2);
        let rid = table.insert(&[1, 0]).unwrap();

        for i in 0..MERGE_THRESHOLD as i64 {
            table.update(rid, &[None, Some(i)]).unwrap();
        }

        table.wait_merge_idle();
        table.read(rid).unwrap(); // applies whatever the worker published

        let ranges = table.state().ranges.read().unwrap();
        assert_eq!(ranges[0].tps[0], TAIL_RID_BASE + MERGE_THRESHOLD as i64 - 1);
    }
}
