//! A table of rows that can be replaced atomically.
//!
//! Readers take a snapshot with [`Table::snapshot`] and never block; a writer
//! swaps in a complete new set of rows with [`Table::replace`].

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Shared, lock-free table of rows.
#[derive(Debug)]
pub struct Table<T> {
    name: &'static str,
    rows: ArcSwap<Vec<T>>,
}

impl<T> Table<T> {
    pub fn new(name: &'static str, rows: Vec<T>) -> Self {
        Self {
            name,
            rows: ArcSwap::from_pointee(rows),
        }
    }

    /// Table name as reported in `db.table`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current rows. Later replacements do not affect a snapshot already taken.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.rows.load_full()
    }

    /// Atomically replace every row.
    pub fn replace(&self, rows: Vec<T>) {
        self.rows.store(Arc::new(rows));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_rows_without_touching_snapshots() {
        let table = Table::new("numbers", vec![1, 2, 3]);
        let before = table.snapshot();
        table.replace(vec![4]);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*table.snapshot(), vec![4]);
        assert_eq!(table.name(), "numbers");
    }
}
