/// Size of a physical page in bytes.
pub const PAGE_SIZE_BYTES: usize = 4096;

/// Size of one stored value. All columns are signed 64-bit integers.
pub const INT64_BYTES: usize = 8;

/// Number of slots that can be stored in a page.
pub const SLOTS_PER_PAGE: usize = PAGE_SIZE_BYTES / INT64_BYTES;

/// The number of (logical) base page bundles per page range.
pub const BASE_PAGES_PER_RANGE: usize = 16;

/// Number of metadata columns stored ahead of the user columns.
pub const NUM_METADATA_COLS: usize = 5;

// Physical column layout within a bundle. Metadata columns come first;
// user columns start at USER_COL_OFFSET.

/// Base: latest tail RID, `NULL_RID`, or `DELETED_RID`. Tail: previous tail
/// RID in the chain, or `NULL_RID` at the chain root.
pub const INDIRECTION_COLUMN: usize = 0;

/// The record's own RID, duplicated for scans.
pub const RID_COLUMN: usize = 1;

/// Insert/update wall-clock time in seconds.
pub const TIMESTAMP_COLUMN: usize = 2;

/// Bitmask over user columns: cumulative update history on base records,
/// per-update change set on tail records.
pub const SCHEMA_ENCODING_COLUMN: usize = 3;

/// Tail: RID of the base record this tail belongs to. Base: its own RID.
pub const BASE_RID_COLUMN: usize = 4;

/// User-visible columns start at this physical index.
pub const USER_COL_OFFSET: usize = 5;

/// Sentinel RID meaning "no record" / chain root.
pub const NULL_RID: i64 = -1;

/// Sentinel written to a base record's indirection slot on delete.
pub const DELETED_RID: i64 = -5;

/// First tail RID. Base RIDs grow upward from 0 and stay below this value,
/// so the two RID spaces never collide in the page directory.
pub const TAIL_RID_BASE: i64 = 1 << 32;

/// Default max number of page frames in the bufferpool.
pub const POOL_SIZE: usize = 32;

/// Number of updates on a table before a background merge is triggered.
pub const MERGE_THRESHOLD: usize = 10;
