// Copyright 2025 StripeLight Project Authors. Licensed under Apache-2.0.

//! Physical storage: one append-only file per storage id.
//!
//! The file starts with a fixed-size metapage carrying the storage identity
//! and the three reservation counters (next byte offset, next stripe id,
//! next row number). Everything after the metapage is a sequence of stripe
//! extents. Counters only ever move forward; aborted reservations leave
//! holes that vacuum reclaims.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use super::row_id::{validate_row_number, FIRST_ROW_NUMBER, MAX_ROW_NUMBER};
use super::{StorageError, StorageResult};
use crate::catalog::StorageId;

pub const STORAGE_MAGIC: u32 = 0x5354_5250; // "STRP"
pub const STORAGE_VERSION: u32 = 1;

/// Size of the metapage; the first data offset.
pub const METAPAGE_SIZE: u64 = 64;

const FIRST_STRIPE_ID: u64 = 1;

#[derive(Debug, Clone)]
struct Metapage {
    storage_id: StorageId,
    /// Next unreserved byte in the file.
    reserved_offset: u64,
    next_stripe_id: u64,
    next_row_number: u64,
}

impl Metapage {
    fn encode(&self) -> [u8; METAPAGE_SIZE as usize] {
        let mut page = [0u8; METAPAGE_SIZE as usize];
        let mut buf = &mut page[..];
        buf.put_u32(STORAGE_MAGIC);
        buf.put_u32(STORAGE_VERSION);
        buf.put_u64(self.storage_id);
        buf.put_u64(self.reserved_offset);
        buf.put_u64(self.next_stripe_id);
        buf.put_u64(self.next_row_number);
        let checksum = crc32fast::hash(&page[..40]);
        (&mut page[40..44]).put_u32(checksum);
        page
    }

    fn decode(page: &[u8]) -> StorageResult<Self> {
        if page.len() < METAPAGE_SIZE as usize {
            return Err(StorageError::Corrupted("metapage truncated".into()));
        }
        let expected = (&page[40..44]).get_u32() as u64;
        let found = crc32fast::hash(&page[..40]) as u64;
        if found != expected {
            return Err(StorageError::Checksum { found, expected });
        }
        let mut buf = &page[..40];
        let magic = buf.get_u32();
        if magic != STORAGE_MAGIC {
            return Err(StorageError::Corrupted(format!(
                "bad metapage magic {:#x}",
                magic
            )));
        }
        let version = buf.get_u32();
        if version != STORAGE_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported storage version {}",
                version
            )));
        }
        Ok(Self {
            storage_id: buf.get_u64(),
            reserved_offset: buf.get_u64(),
            next_stripe_id: buf.get_u64(),
            next_row_number: buf.get_u64(),
        })
    }
}

/// Byte-addressable append-only region with reservation counters.
pub struct PhysicalStorage {
    storage_id: StorageId,
    path: PathBuf,
    file: File,
    metapage: Mutex<Metapage>,
}

impl PhysicalStorage {
    fn file_path(dir: &Path, storage_id: StorageId) -> PathBuf {
        dir.join(format!("{}.stripes", storage_id))
    }

    /// Create a fresh storage file with zeroed counters.
    pub fn create(dir: &Path, storage_id: StorageId) -> StorageResult<Self> {
        let path = Self::file_path(dir, storage_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let metapage = Metapage {
            storage_id,
            reserved_offset: METAPAGE_SIZE,
            next_stripe_id: FIRST_STRIPE_ID,
            next_row_number: FIRST_ROW_NUMBER,
        };
        file.write_all_at(&metapage.encode(), 0)?;
        file.sync_data()?;
        Ok(Self {
            storage_id,
            path,
            file,
            metapage: Mutex::new(metapage),
        })
    }

    /// Open an existing storage file, validating identity and checksum.
    pub fn open(dir: &Path, storage_id: StorageId) -> StorageResult<Self> {
        let path = Self::file_path(dir, storage_id);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut page = [0u8; METAPAGE_SIZE as usize];
        file.read_exact_at(&mut page, 0)?;
        let metapage = Metapage::decode(&page)?;
        if metapage.storage_id != storage_id {
            return Err(StorageError::Corrupted(format!(
                "storage file {} carries storage id {}",
                path.display(),
                metapage.storage_id
            )));
        }
        Ok(Self {
            storage_id,
            path,
            file,
            metapage: Mutex::new(metapage),
        })
    }

    pub fn storage_id(&self) -> StorageId {
        self.storage_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_metapage(&self, metapage: &Metapage) -> StorageResult<()> {
        self.file.write_all_at(&metapage.encode(), 0)?;
        Ok(())
    }

    /// Reserve the next stripe id.
    pub fn reserve_stripe_id(&self) -> StorageResult<u64> {
        let mut metapage = self.metapage.lock();
        let id = metapage.next_stripe_id;
        metapage.next_stripe_id += 1;
        self.persist_metapage(&metapage)?;
        Ok(id)
    }

    /// Reserve `count` consecutive row numbers, returning the first.
    /// Numbers are never reused; a reservation by an aborted transaction is
    /// a permanent gap.
    pub fn reserve_row_numbers(&self, count: u64) -> StorageResult<u64> {
        let mut metapage = self.metapage.lock();
        let first = metapage.next_row_number;
        let last = first
            .checked_add(count)
            .and_then(|n| n.checked_sub(1))
            .ok_or(StorageError::RowNumberOutOfRange(u64::MAX))?;
        if last > MAX_ROW_NUMBER {
            return Err(StorageError::RowNumberOutOfRange(last));
        }
        validate_row_number(first)?;
        metapage.next_row_number = last + 1;
        self.persist_metapage(&metapage)?;
        Ok(first)
    }

    /// Reserve a byte extent at the end of the file.
    pub fn reserve_data(&self, len: u64) -> StorageResult<u64> {
        let mut metapage = self.metapage.lock();
        let offset = metapage.reserved_offset;
        metapage.reserved_offset += len;
        self.persist_metapage(&metapage)?;
        Ok(offset)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    pub fn read_at(&self, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        let mut data = vec![0u8; len as usize];
        self.file.read_exact_at(&mut data, offset)?;
        Ok(data)
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Logical size: metapage plus every reserved byte.
    pub fn table_size(&self) -> u64 {
        self.metapage.lock().reserved_offset
    }

    pub fn next_row_number(&self) -> u64 {
        self.metapage.lock().next_row_number
    }

    /// Give back trailing unreserved space. `new_reserved_offset` must cover
    /// the metapage and every live extent; vacuum computes it from the
    /// stripe metadata it keeps.
    pub fn truncate(&self, new_reserved_offset: u64) -> StorageResult<()> {
        let mut metapage = self.metapage.lock();
        let target = new_reserved_offset.max(METAPAGE_SIZE);
        if target >= metapage.reserved_offset {
            return Ok(());
        }
        metapage.reserved_offset = target;
        self.persist_metapage(&metapage)?;
        self.file.set_len(target)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Unlink the backing file; drop-table path. Reads through still-open
    /// handles keep working until the last handle drops.
    pub fn delete_file(&self) -> StorageResult<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metapage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PhysicalStorage::create(dir.path(), 7).unwrap();
        assert_eq!(storage.reserve_stripe_id().unwrap(), 1);
        assert_eq!(storage.reserve_row_numbers(10).unwrap(), 1);
        assert_eq!(storage.reserve_data(100).unwrap(), METAPAGE_SIZE);
        drop(storage);

        let storage = PhysicalStorage::open(dir.path(), 7).unwrap();
        assert_eq!(storage.reserve_stripe_id().unwrap(), 2);
        assert_eq!(storage.reserve_row_numbers(1).unwrap(), 11);
        assert_eq!(storage.table_size(), METAPAGE_SIZE + 100);
    }

    #[test]
    fn test_truncate_reclaims_tail() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PhysicalStorage::create(dir.path(), 1).unwrap();
        let offset = storage.reserve_data(4096).unwrap();
        storage.write_at(offset, &[7u8; 4096]).unwrap();
        assert_eq!(storage.table_size(), METAPAGE_SIZE + 4096);
        storage.truncate(METAPAGE_SIZE).unwrap();
        assert_eq!(storage.table_size(), METAPAGE_SIZE);
        // Truncation never grows the reservation back.
        storage.truncate(METAPAGE_SIZE + 100).unwrap();
        assert_eq!(storage.table_size(), METAPAGE_SIZE);
    }

    #[test]
    fn test_row_number_space_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PhysicalStorage::create(dir.path(), 1).unwrap();
        assert!(matches!(
            storage.reserve_row_numbers(MAX_ROW_NUMBER + 1),
            Err(StorageError::RowNumberOutOfRange(_))
        ));
    }
}
