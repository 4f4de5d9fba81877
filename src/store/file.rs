//! # Page File I/O
//!
//! Positioned reads and writes over a single file. A mutex serializes the
//! seek/IO pair; the commit protocol layers its own ordering (data sync
//! before header write) on top. The file grows implicitly when a page past
//! the current end is written.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;

pub struct PageFile {
    file: Mutex<File>,
}

impl PageFile {
    /// Creates a new file, failing if one already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("creating store file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Opens an existing file for read/write access.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("opening store file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
            .wrap_err_with(|| format!("reading {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    /// Writes all of `buf` at `offset`, extending the file if needed.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
            .wrap_err_with(|| format!("writing {} bytes at offset {}", buf.len(), offset))?;
        Ok(())
    }

    /// Forces written data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data().wrap_err("syncing store file")?;
        Ok(())
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let file = PageFile::create(&path).unwrap();

        file.write_at(1024, b"hello pages").unwrap();
        let mut buf = [0u8; 11];
        file.read_at(1024, &mut buf).unwrap();
        assert_eq!(&buf, b"hello pages");
    }

    #[test]
    fn create_fails_if_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        PageFile::create(&path).unwrap();
        assert!(PageFile::create(&path).is_err());
    }

    #[test]
    fn read_past_end_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        let file = PageFile::create(&path).unwrap();
        let mut buf = [0u8; 16];
        assert!(file.read_at(4096, &mut buf).is_err());
    }

    #[test]
    fn reopen_sees_written_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");
        {
            let file = PageFile::create(&path).unwrap();
            file.write_at(0, b"persisted").unwrap();
            file.sync().unwrap();
        }
        let file = PageFile::open(&path).unwrap();
        let mut buf = [0u8; 9];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
