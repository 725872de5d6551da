//! Per-process table of regions currently brought into memory.

use crate::{Error, Result};

#[derive(Debug)]
pub(crate) struct Entry<T> {
    pub offset: u64,
    pub extent: u64,
    pub value: T,
}

/// Entries sorted by offset; an offset is held at most once.
#[derive(Debug)]
pub(crate) struct InUse<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for InUse<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> InUse<T> {
    fn search(&self, offset: u64) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&offset, |entry| entry.offset)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.search(offset).is_ok()
    }

    pub fn get(&self, offset: u64) -> Option<&Entry<T>> {
        self.search(offset).ok().map(|at| &self.entries[at])
    }

    pub fn insert(&mut self, offset: u64, extent: u64, value: T) -> Result<()> {
        match self.search(offset) {
            Ok(_) => Err(Error::AlreadyReserved),
            Err(at) => {
                self.entries.insert(
                    at,
                    Entry {
                        offset,
                        extent,
                        value,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, offset: u64) -> Option<Entry<T>> {
        self.search(offset).ok().map(|at| self.entries.remove(at))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.entries.iter()
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.offset).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_offsets_sorted() {
        let mut table = InUse::default();
        for offset in [4096, 0, 8192, 1024] {
            table.insert(offset, 16, ()).expect("insert");
        }
        assert_eq!(table.offsets(), vec![0, 1024, 4096, 8192]);
        assert_eq!(table.get(1024).map(|entry| entry.extent), Some(16));
    }

    #[test]
    fn double_reserve_is_rejected() {
        let mut table = InUse::default();
        table.insert(64, 8, 1).expect("insert");
        assert!(matches!(table.insert(64, 8, 2), Err(Error::AlreadyReserved)));
        assert_eq!(table.remove(64).map(|entry| entry.value), Some(1));
        assert!(table.remove(64).is_none());
        assert_eq!(table.len(), 0);
    }
}
