use rand::prelude::*;

use lstore_rs::{Database, Query};

use std::collections::HashSet;
use std::sync::Arc;

const NUM_COLUMNS: usize = 8;
const OPERATIONS: usize = 250_000;

/// Randomized profiling workload: a mix of inserts, cumulative updates,
/// and projected selects against one table.
fn main() {
    let mut db = Database::new();
    let table = db.create_table("prof_tbl", NUM_COLUMNS, 0);
    let query = Query::new(Arc::clone(&table));

    let mut primary_keys: HashSet<i64> = HashSet::new();
    let mut rng = rand::thread_rng();

    for i in 0..OPERATIONS {
        match rng.gen_range(0..3) {
            0 => {
                let row: Vec<i64> = (0..NUM_COLUMNS)
                    .map(|_| rng.gen_range(1..=100_000))
                    .collect();

                if query.insert(&row) {
                    primary_keys.insert(row[0]);
                }
            }

            1 => {
                if let Some(&key) = primary_keys.iter().choose(&mut rng) {
                    let updates: Vec<Option<i64>> = (0..NUM_COLUMNS)
                        .map(|col| {
                            if col == 0 || rng.gen_bool(0.5) {
                                None
                            } else {
                                Some(rng.gen_range(1..=100_000))
                            }
                        })
                        .collect();

                    query.update(key, &updates);
                }
            }

            2 => {
                if let Some(&key) = primary_keys.iter().choose(&mut rng) {
                    let projection: Vec<usize> =
                        (0..NUM_COLUMNS).map(|_| rng.gen_range(0..=1)).collect();

                    query.select(key, 0, &projection);
                }
            }

            _ => unreachable!(),
        }

        if (i + 1) % 10_000 == 0 {
            println!("{}/{} operations", i + 1, OPERATIONS);
        }
    }

    println!(
        "done: {} live keys, pool stats {:?}",
        primary_keys.len(),
        db.bufferpool().stats()
    );
}
