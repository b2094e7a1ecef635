use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lstore_rs::bufferpool::{BufferPool, PageKey, PageRef};
use lstore_rs::errors::DatabaseError;
use lstore_rs::page::Page;

fn key(page_id: usize) -> PageKey {
    PageKey::new("test_tbl", 0, false, page_id, 0)
}

fn page_with(value: i64) -> PageRef {
    let mut page = Page::new();
    page.write(value).unwrap();
    Arc::new(RwLock::new(page))
}

#[test]
fn test_get_page_miss_loads_then_hit_skips_load() {
    let pool = BufferPool::with_capacity(4);
    let loads = AtomicUsize::new(0);

    let page = pool
        .get_page(key(0), || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(page_with(42))
        })
        .unwrap();
    assert_eq!(page.read().unwrap().read(0).unwrap(), 42);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(pool.is_in_pool(&key(0)));

    // Hit: the loader must not run again.
    let page = pool
        .get_page(key(0), || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(page_with(0))
        })
        .unwrap();
    assert_eq!(page.read().unwrap().read(0).unwrap(), 42);
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pins_block_eviction_until_released() {
    let pool = BufferPool::with_capacity(1);

    pool.get_page(key(0), || Ok(page_with(1))).unwrap();

    // The only frame is pinned, so there is nothing to evict.
    let result = pool.get_page(key(1), || Ok(page_with(2)));
    assert!(matches!(result, Err(DatabaseError::AllFramesPinned)));

    pool.unpin(&key(0), false);
    pool.get_page(key(1), || Ok(page_with(2))).unwrap();
    assert!(!pool.is_in_pool(&key(0)));
    assert!(pool.is_in_pool(&key(1)));
}

#[test]
fn test_eviction_scans_lru_order() {
    let pool = BufferPool::with_capacity(2);

    pool.get_page(key(0), || Ok(page_with(0))).unwrap();
    pool.unpin(&key(0), false);
    pool.get_page(key(1), || Ok(page_with(1))).unwrap();
    pool.unpin(&key(1), false);

    // Touch key 0 so key 1 becomes the least recently used.
    pool.get_page(key(0), || Ok(page_with(0))).unwrap();
    pool.unpin(&key(0), false);

    pool.get_page(key(2), || Ok(page_with(2))).unwrap();
    assert!(pool.is_in_pool(&key(0)));
    assert!(!pool.is_in_pool(&key(1)));
}

#[test]
fn test_eviction_skips_pinned_lru_victim() {
    let pool = BufferPool::with_capacity(2);

    // key 0 is LRU but stays pinned; eviction must take key 1 instead.
    pool.get_page(key(0), || Ok(page_with(0))).unwrap();
    pool.get_page(key(1), || Ok(page_with(1))).unwrap();
    pool.unpin(&key(1), false);

    pool.get_page(key(2), || Ok(page_with(2))).unwrap();
    assert!(pool.is_in_pool(&key(0)));
    assert!(!pool.is_in_pool(&key(1)));
}

#[test]
fn test_dirty_eviction_writes_back() {
    let pool = BufferPool::with_capacity(1);
    let written: Arc<Mutex<Vec<(PageKey, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&written);
    pool.set_write_callback(Box::new(move |key, page| {
        sink.lock().unwrap().push((key.clone(), page.read(0)?));
        Ok(())
    }));

    pool.get_page(key(0), || Ok(page_with(7))).unwrap();
    pool.unpin(&key(0), true);

    pool.get_page(key(1), || Ok(page_with(8))).unwrap();

    let written = written.lock().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0], (key(0), 7));
}

#[test]
fn test_clean_eviction_skips_write_back() {
    let pool = BufferPool::with_capacity(1);
    let writes = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&writes);
    pool.set_write_callback(Box::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    pool.get_page(key(0), || Ok(page_with(7))).unwrap();
    pool.unpin(&key(0), false);
    pool.get_page(key(1), || Ok(page_with(8))).unwrap();

    assert_eq!(writes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_unpin_saturates_and_merges_dirty_flag() {
    let pool = BufferPool::with_capacity(2);

    pool.get_page(key(0), || Ok(page_with(0))).unwrap();
    assert_eq!(pool.stats().pinned_pages, 1);

    pool.unpin(&key(0), false);
    pool.unpin(&key(0), true); // extra unpin: count stays at zero, dirty sticks
    assert_eq!(pool.stats().pinned_pages, 0);
    assert_eq!(pool.stats().dirty_pages, 1);

    // Unpinning an unknown key is a no-op.
    pool.unpin(&key(9), true);
    assert_eq!(pool.stats().dirty_pages, 1);
}

#[test]
fn test_register_page_starts_unpinned_and_is_idempotent() {
    let pool = BufferPool::with_capacity(2);

    let original = page_with(5);
    pool.register_page(key(0), Arc::clone(&original)).unwrap();
    assert_eq!(pool.stats().pinned_pages, 0);

    // Registering again must not replace the existing frame.
    pool.register_page(key(0), page_with(99)).unwrap();
    let peeked = pool.peek_page(&key(0)).unwrap();
    assert_eq!(peeked.read().unwrap().read(0).unwrap(), 5);
}

#[test]
fn test_flush_all_and_flush_page_clear_dirty() {
    let pool = BufferPool::with_capacity(4);
    let writes = Arc::new(AtomicUsize::new(0));

    pool.get_page(key(0), || Ok(page_with(0))).unwrap();
    pool.unpin(&key(0), true);
    pool.get_page(key(1), || Ok(page_with(1))).unwrap();
    pool.unpin(&key(1), false);
    pool.mark_dirty(&key(1));

    let counter = Arc::clone(&writes);
    pool.flush_page(&key(0), |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().dirty_pages, 1);

    let counter = Arc::clone(&writes);
    pool.flush_all(|_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().dirty_pages, 0);
}

#[test]
fn test_frame_count_never_exceeds_pool_size() {
    let pool = BufferPool::with_capacity(3);

    for page_id in 0..20 {
        pool.get_page(key(page_id), || Ok(page_with(page_id as i64)))
            .unwrap();
        pool.unpin(&key(page_id), false);
        assert!(pool.stats().frames_used <= pool.pool_size());
    }
}

#[test]
fn test_evict_table_drops_only_that_table() {
    let pool = BufferPool::with_capacity(4);
    let other = PageKey::new("other_tbl", 0, false, 0, 0);

    pool.get_page(key(0), || Ok(page_with(0))).unwrap();
    pool.unpin(&key(0), false);
    pool.get_page(other.clone(), || Ok(page_with(1))).unwrap();
    pool.unpin(&other, false);

    pool.evict_table("test_tbl");
    assert!(!pool.is_in_pool(&key(0)));
    assert!(pool.is_in_pool(&other));
}

#[test]
fn test_swap_frame_page_replaces_reference() {
    let pool = BufferPool::with_capacity(2);

    pool.get_page(key(0), || Ok(page_with(1))).unwrap();
    pool.swap_frame_page(&key(0), page_with(2));

    let peeked = pool.peek_page(&key(0)).unwrap();
    assert_eq!(peeked.read().unwrap().read(0).unwrap(), 2);
}
