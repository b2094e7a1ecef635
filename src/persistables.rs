use serde::{Deserialize, Serialize};

/// Index metadata written next to a table's binary files at close time.
/// The page files hold no index state; this header records which secondary
/// columns were indexed so `open` can rebuild them.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct IndexPersistable {
    pub secondary_columns: Vec<usize>,
}
