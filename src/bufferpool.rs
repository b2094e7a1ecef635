use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use crate::constants::POOL_SIZE;
use crate::errors::{DatabaseError, DatabaseResult};
use crate::page::Page;

/// Shared handle to a physical page. Range bundles and bufferpool frames
/// reference the same page objects through these handles.
pub type PageRef = Arc<RwLock<Page>>;

/// Disk write-back callback registered by the database. Used when a dirty
/// frame is evicted.
pub type WriteFn = Box<dyn Fn(&PageKey, &Page) -> DatabaseResult<()> + Send + Sync>;

/// Identifies one physical page across every table in the database.
///
/// `range_id` is required because `page_id` resets to 0 in each new page
/// range; without it, pages of different ranges would collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub table: String,
    pub range_id: usize,
    pub is_tail: bool,
    pub page_id: usize,
    pub col_index: usize,
}

impl PageKey {
    pub fn new(
        table: &str,
        range_id: usize,
        is_tail: bool,
        page_id: usize,
        col_index: usize,
    ) -> Self {
        PageKey {
            table: table.to_string(),
            range_id,
            is_tail,
            page_id,
            col_index,
        }
    }
}

/// One bufferpool slot: a page handle plus its bookkeeping.
struct Frame {
    page: PageRef,
    is_dirty: bool,
    pin_count: usize,
}

/// Frame table and LRU order, guarded together by one mutex.
struct PoolInner {
    frames: HashMap<PageKey, Frame>,
    lru_order: VecDeque<PageKey>,
}

/// Pool statistics snapshot, for debugging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_size: usize,
    pub frames_used: usize,
    pub dirty_pages: usize,
    pub pinned_pages: usize,
}

/// A pool of at most `pool_size` page frames shared by every table in a
/// database. Frames are keyed by [`PageKey`], pinned while in use, marked
/// dirty on write, and evicted in LRU order. Eviction never removes a
/// pinned frame; dirty victims are written back through the registered
/// callback first.
pub struct BufferPool {
    pool_size: usize,
    inner: Mutex<PoolInner>,
    write_fn: Mutex<Option<WriteFn>>,
}

impl BufferPool {
    /// Create a pool with the default frame count.
    pub fn new() -> Self {
        BufferPool::with_capacity(POOL_SIZE)
    }

    /// Create a pool holding at most `pool_size` frames.
    pub fn with_capacity(pool_size: usize) -> Self {
        BufferPool {
            pool_size,
            inner: Mutex::new(PoolInner {
                frames: HashMap::new(),
                lru_order: VecDeque::new(),
            }),
            write_fn: Mutex::new(None),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Register the disk-write callback used when dirty frames are evicted.
    pub fn set_write_callback(&self, write_fn: WriteFn) {
        *self.write_fn.lock().unwrap() = Some(write_fn);
    }

    /// Fetch a page, pinning its frame. On a hit the frame moves to the
    /// most-recently-used end of the LRU order. On a miss `load` is called
    /// to produce the page, a frame is evicted if the pool is full, and the
    /// new frame is installed with a pin count of one.
    pub fn get_page(
        &self,
        key: PageKey,
        load: impl FnOnce() -> DatabaseResult<PageRef>,
    ) -> DatabaseResult<PageRef> {
        let mut inner = self.inner.lock().unwrap();

        if inner.frames.contains_key(&key) {
            Self::move_to_back(&mut inner.lru_order, &key);
            if let Some(frame) = inner.frames.get_mut(&key) {
                frame.pin_count += 1;
                return Ok(Arc::clone(&frame.page));
            }
        }

        // Miss: load, then make room before installing the new frame.
        let page = load()?;

        if inner.frames.len() >= self.pool_size {
            self.evict_locked(&mut inner)?;
        }

        inner.frames.insert(
            key.clone(),
            Frame {
                page: Arc::clone(&page),
                is_dirty: false,
                pin_count: 1,
            },
        );
        inner.lru_order.push_back(key);

        Ok(page)
    }

    /// Drop one pin from a frame, saturating at zero, and OR-merge the
    /// dirty flag. Unknown keys are ignored.
    pub fn unpin(&self, key: &PageKey, is_dirty: bool) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(frame) = inner.frames.get_mut(key) {
            if frame.pin_count > 0 {
                frame.pin_count -= 1;
            }
            if is_dirty {
                frame.is_dirty = true;
            }
        }
    }

    /// Mark a page dirty without unpinning it.
    pub fn mark_dirty(&self, key: &PageKey) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(frame) = inner.frames.get_mut(key) {
            frame.is_dirty = true;
        }
    }

    /// Insert an already-created in-memory page, unpinned and clean. Used
    /// for new base/tail bundles and for warm-up after a reload. Evicts
    /// first if the pool is full. Already-registered keys are left alone.
    pub fn register_page(&self, key: PageKey, page: PageRef) -> DatabaseResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.frames.contains_key(&key) {
            return Ok(());
        }

        if inner.frames.len() >= self.pool_size {
            self.evict_locked(&mut inner)?;
        }

        inner.frames.insert(
            key.clone(),
            Frame {
                page,
                is_dirty: false,
                pin_count: 0,
            },
        );
        inner.lru_order.push_back(key);

        Ok(())
    }

    pub fn is_in_pool(&self, key: &PageKey) -> bool {
        self.inner.lock().unwrap().frames.contains_key(key)
    }

    /// Return the frame's page without pinning or touching the LRU order.
    /// Persistence and merge prefer this copy over a range's bundle
    /// reference, which may be stale after an eviction + reload cycle.
    pub fn peek_page(&self, key: &PageKey) -> Option<PageRef> {
        self.inner
            .lock()
            .unwrap()
            .frames
            .get(key)
            .map(|frame| Arc::clone(&frame.page))
    }

    /// Replace the page a frame points at. Used when a merge result is
    /// published so readers holding the frame keep seeing a valid page.
    pub fn swap_frame_page(&self, key: &PageKey, page: PageRef) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(frame) = inner.frames.get_mut(key) {
            frame.page = page;
        }
    }

    /// Force-write one dirty page through the supplied callback.
    pub fn flush_page(
        &self,
        key: &PageKey,
        write_fn: impl Fn(&PageKey, &Page) -> DatabaseResult<()>,
    ) -> DatabaseResult<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(frame) = inner.frames.get_mut(key) {
            if frame.is_dirty {
                write_fn(key, &frame.page.read().unwrap())?;
                frame.is_dirty = false;
            }
        }

        Ok(())
    }

    /// Write every dirty page through the supplied callback. Called when
    /// the database closes.
    pub fn flush_all(
        &self,
        write_fn: impl Fn(&PageKey, &Page) -> DatabaseResult<()>,
    ) -> DatabaseResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;

        for (key, frame) in inner.frames.iter_mut() {
            if frame.is_dirty {
                write_fn(key, &frame.page.read().unwrap())?;
                frame.is_dirty = false;
            }
        }

        Ok(())
    }

    /// Drop every frame belonging to one table, pinned or not. Used when
    /// `create_table` replaces an existing table of the same name.
    pub fn evict_table(&self, table: &str) {
        let mut inner = self.inner.lock().unwrap();

        inner.frames.retain(|key, _| key.table != table);
        inner.lru_order.retain(|key| key.table != table);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();

        PoolStats {
            pool_size: self.pool_size,
            frames_used: inner.frames.len(),
            dirty_pages: inner.frames.values().filter(|f| f.is_dirty).count(),
            pinned_pages: inner.frames.values().filter(|f| f.pin_count > 0).count(),
        }
    }

    /// Evict the least recently used frame with a zero pin count. Dirty
    /// victims are written back first if a callback is registered. Fails
    /// with `AllFramesPinned` when no frame is eligible.
    fn evict_locked(&self, inner: &mut PoolInner) -> DatabaseResult<()> {
        let position = inner.lru_order.iter().position(|key| {
            inner
                .frames
                .get(key)
                .map_or(false, |frame| frame.pin_count == 0)
        });

        let position = match position {
            Some(position) => position,
            None => return Err(DatabaseError::AllFramesPinned),
        };

        let key = inner.lru_order[position].clone();

        if let Some(frame) = inner.frames.get_mut(&key) {
            if frame.is_dirty {
                if let Some(write_fn) = self.write_fn.lock().unwrap().as_ref() {
                    write_fn(&key, &frame.page.read().unwrap())?;
                }
                frame.is_dirty = false;
            }
        }

        inner.lru_order.remove(position);
        inner.frames.remove(&key);

        Ok(())
    }

    fn move_to_back(order: &mut VecDeque<PageKey>, key: &PageKey) {
        if let Some(position) = order.iter().position(|k| k == key) {
            order.remove(position);
        }
        order.push_back(key.clone());
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new()
    }
}
