use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::bufferpool::{BufferPool, PageKey};
use crate::constants::PAGE_SIZE_BYTES;
use crate::errors::{DatabaseError, DatabaseResult};
use crate::helpers::{read_i32, write_i32};
use crate::page::Page;
use crate::persistables::IndexPersistable;
use crate::table::Table;

// Single-page disk I/O. Each page is one .bin file holding its record
// count followed by the raw 4096-byte payload:
//     {db_path}/{table}/ranges/range_{r}/{base|tail}_{p}_col_{c}.bin

pub(crate) fn page_file_path(root: &Path, key: &PageKey) -> PathBuf {
    let prefix = if key.is_tail { "tail" } else { "base" };
    root.join(&key.table)
        .join("ranges")
        .join(format!("range_{}", key.range_id))
        .join(format!("{}_{}_col_{}.bin", prefix, key.page_id, key.col_index))
}

pub(crate) fn write_page_file(root: &Path, key: &PageKey, page: &Page) -> DatabaseResult<()> {
    let path = page_file_path(root, key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(&path)?;
    write_i32(&mut file, page.num_records() as i32)?;
    file.write_all(page.to_bytes())?;
    Ok(())
}

pub(crate) fn read_page_file(path: &Path) -> DatabaseResult<Page> {
    let mut file = File::open(path)?;
    let num_records = read_i32(&mut file)? as usize;
    let mut raw = vec![0u8; PAGE_SIZE_BYTES];
    file.read_exact(&mut raw)?;
    Page::from_bytes(&raw, num_records)
}

/// The database: owns the table list and the bufferpool shared by every
/// table, and drives the open/close persistence lifecycle.
pub struct Database {
    tables: Vec<Arc<Table>>,
    path: Arc<RwLock<Option<PathBuf>>>,
    bufferpool: Arc<BufferPool>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            tables: Vec::new(),
            path: Arc::new(RwLock::new(None)),
            bufferpool: Arc::new(BufferPool::new()),
        }
    }

    pub fn bufferpool(&self) -> &Arc<BufferPool> {
        &self.bufferpool
    }

    /// Open the database at `path`. If data exists on disk, every table in
    /// the catalog is loaded back into memory, its pages are pre-registered
    /// with the bufferpool, and its indexes are rebuilt.
    pub fn open(&mut self, path: impl Into<PathBuf>) -> DatabaseResult<()> {
        let root: PathBuf = path.into();
        fs::create_dir_all(&root)?;
        *self.path.write().unwrap() = Some(root.clone());

        // The write-back callback reads the live path handle so a reopen
        // under a different path redirects eviction writes too.
        let path_handle = Arc::clone(&self.path);
        self.bufferpool.set_write_callback(Box::new(move |key, page| {
            match path_handle.read().unwrap().clone() {
                Some(root) => write_page_file(&root, key, page),
                None => Ok(()),
            }
        }));

        let catalog_path = root.join("catalog.bin");
        if !catalog_path.exists() {
            return Ok(());
        }

        let mut catalog = File::open(catalog_path)?;
        let num_tables = read_i32(&mut catalog)? as usize;

        for _ in 0..num_tables {
            let name_len = read_i32(&mut catalog)? as usize;
            let mut name_buf = vec![0u8; name_len];
            catalog.read_exact(&mut name_buf)?;
            let name = String::from_utf8(name_buf).map_err(|_| {
                DatabaseError::InvalidArgument("catalog holds a non-UTF-8 table name".to_string())
            })?;
            let num_columns = read_i32(&mut catalog)? as usize;
            let key = read_i32(&mut catalog)? as usize;

            let table = Table::new(
                name,
                num_columns,
                key,
                Arc::clone(&self.bufferpool),
                Arc::clone(&self.path),
            );

            // Skip tables that cannot be loaded (e.g. files from old runs).
            if self.load_table(&table, &root).is_ok() {
                self.tables.push(Arc::new(table));
            }
        }

        Ok(())
    }

    fn load_table(&self, table: &Table, root: &Path) -> DatabaseResult<()> {
        table.deserialize(root)?;
        table.warm_bufferpool()?;
        table.rebuild_primary_index()?;

        // Recreate the secondary indexes recorded at close time.
        let meta_path = root.join(table.name()).join("index_meta.hdr");
        if let Ok(contents) = fs::read_to_string(&meta_path) {
            if let Ok(meta) = serde_json::from_str::<IndexPersistable>(&contents) {
                for column in meta.secondary_columns {
                    table.create_index(column)?;
                }
            }
        }

        Ok(())
    }

    /// Write every table to disk so the next `open` can recover it.
    pub fn close(&mut self) -> DatabaseResult<()> {
        let root = match self.path.read().unwrap().clone() {
            Some(root) => root,
            None => return Ok(()),
        };
        fs::create_dir_all(&root)?;

        // No merge may be running while persistence walks the ranges.
        for table in &self.tables {
            table.wait_merge_idle();
        }

        self.bufferpool
            .flush_all(|key, page| write_page_file(&root, key, page))?;

        for table in &self.tables {
            table.serialize(&root)?;

            let meta = IndexPersistable {
                secondary_columns: table.index().secondary_columns(),
            };
            let serialized = serde_json::to_string(&meta).map_err(|error| {
                DatabaseError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, error))
            })?;
            fs::write(root.join(table.name()).join("index_meta.hdr"), serialized)?;
        }

        let mut catalog = File::create(root.join("catalog.bin"))?;
        write_i32(&mut catalog, self.tables.len() as i32)?;
        for table in &self.tables {
            let name_bytes = table.name().as_bytes();
            write_i32(&mut catalog, name_bytes.len() as i32)?;
            catalog.write_all(name_bytes)?;
            write_i32(&mut catalog, table.num_columns() as i32)?;
            write_i32(&mut catalog, table.key_column() as i32)?;
        }

        Ok(())
    }

    /// Create a new table. An existing table with the same name (e.g. one
    /// loaded by `open` from a previous run) is replaced, and its stale
    /// bufferpool frames are dropped so the new table starts fresh.
    pub fn create_table(&mut self, name: &str, num_columns: usize, key_index: usize) -> Arc<Table> {
        if let Some(position) = self.tables.iter().position(|t| t.name() == name) {
            let stale = self.tables.remove(position);
            stale.wait_merge_idle();
        }
        self.bufferpool.evict_table(name);

        let table = Arc::new(Table::new(
            name.to_string(),
            num_columns,
            key_index,
            Arc::clone(&self.bufferpool),
            Arc::clone(&self.path),
        ));
        self.tables.push(Arc::clone(&table));
        table
    }

    /// Delete the named table from the database.
    pub fn drop_table(&mut self, name: &str) -> DatabaseResult<()> {
        match self.tables.iter().position(|t| t.name() == name) {
            Some(position) => {
                let table = self.tables.remove(position);
                table.wait_merge_idle();
                self.bufferpool.evict_table(name);
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("table {name}"))),
        }
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.iter().find(|t| t.name() == name).cloned()
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}
