//! File access facade backing TFTP reads and writes.
//!
//! Keeps at most one open handle per `(session id, filename)` pair,
//! refuses to overwrite existing files, and performs all I/O with
//! blocking `std::fs` calls bounded to [`crate::codec::MAX_DATA_LEN`]
//! bytes per call — the reactor is single-threaded, so a bounded
//! blocking read is cheaper than standing up async file I/O for it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DsError {
    #[error("file doesn't exist")]
    NotExist,
    #[error("couldn't write (overwrite)")]
    NotPermitted,
    #[error("datastore session not found")]
    NoSession,
    #[error("reading error")]
    ReadFail,
    #[error("writing error")]
    WriteFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStat {
    Present,
    Absent,
}

enum Handle {
    Read(File),
    Write(File),
}

/// Identifies one open file within the datastore. Session ids are a
/// counter the caller owns; they are never a raw file descriptor or
/// socket handle, so closing a socket can never accidentally close a
/// file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandleKey {
    session_id: u64,
    filename: String,
}

pub struct Datastore {
    root: PathBuf,
    handles: HashMap<HandleKey, Handle>,
}

impl Datastore {
    /// `root` must already exist and be a directory.
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        let meta = std::fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                "datastore root is not a directory",
            ));
        }
        Ok(Self { root, handles: HashMap::new() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn join(&self, filename: &str) -> PathBuf {
        self.root.join(filename.trim_start_matches('/'))
    }

    pub fn is_file(&self, filename: &str) -> FileStat {
        match std::fs::metadata(self.join(filename)) {
            Ok(meta) if meta.is_file() => FileStat::Present,
            _ => FileStat::Absent,
        }
    }

    /// Reads up to `buf.len()` bytes (capped at
    /// [`crate::codec::MAX_DATA_LEN`] by convention of the caller).
    /// Opens the file on first call for this `(session_id, filename)`.
    pub fn read(
        &mut self,
        session_id: u64,
        filename: &str,
        buf: &mut [u8],
    ) -> Result<usize, DsError> {
        let key = HandleKey { session_id, filename: filename.to_string() };
        if !self.handles.contains_key(&key) {
            if self.is_file(filename) != FileStat::Present {
                return Err(DsError::NotExist);
            }
            let file = File::open(self.join(filename)).map_err(|_| DsError::ReadFail)?;
            self.handles.insert(key.clone(), Handle::Read(file));
        }
        let handle = self.handles.get_mut(&key).expect("just inserted");
        let file = match handle {
            Handle::Read(f) => f,
            Handle::Write(_) => {
                self.handles.remove(&key);
                return Err(DsError::ReadFail);
            }
        };
        match file.read(buf) {
            Ok(n) => Ok(n),
            Err(_) => {
                self.handles.remove(&key);
                Err(DsError::ReadFail)
            }
        }
    }

    /// Writes `buf` to the file, appending after the first call. A
    /// zero-length `buf` on the first call for this key is a no-op that
    /// still creates the (empty) file, matching the zero-byte-file
    /// scenario. A zero-length `buf` on a *subsequent* call signals
    /// end-of-transfer and closes the handle.
    pub fn write(
        &mut self,
        session_id: u64,
        filename: &str,
        buf: &[u8],
    ) -> Result<usize, DsError> {
        let key = HandleKey { session_id, filename: filename.to_string() };
        let is_new = !self.handles.contains_key(&key);
        if is_new {
            if self.is_file(filename) == FileStat::Present {
                return Err(DsError::NotPermitted);
            }
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.join(filename))
                .map_err(|_| DsError::WriteFail)?;
            self.handles.insert(key.clone(), Handle::Write(file));
        }
        if buf.is_empty() && !is_new {
            self.handles.remove(&key);
            return Ok(0);
        }
        let handle = self.handles.get_mut(&key).expect("just inserted");
        let file = match handle {
            Handle::Write(f) => f,
            Handle::Read(_) => {
                self.handles.remove(&key);
                return Err(DsError::WriteFail);
            }
        };
        match file.write_all(buf) {
            Ok(()) => Ok(buf.len()),
            Err(_) => {
                self.handles.remove(&key);
                Err(DsError::WriteFail)
            }
        }
    }

    /// Closes the handle matching `(session_id, filename)`. Fails with
    /// [`DsError::NoSession`] if no such handle is open, mirroring the
    /// original datastore's `DSERR_NOSESSION`: closing something that
    /// was never opened (or was already closed) is a caller error, not
    /// a no-op.
    pub fn close(&mut self, session_id: u64, filename: &str) -> Result<(), DsError> {
        let key = HandleKey { session_id, filename: filename.to_string() };
        match self.handles.remove(&key) {
            Some(_) => Ok(()),
            None => Err(DsError::NoSession),
        }
    }

    /// Drops every handle for a session, regardless of filename. Used
    /// when a session is torn down mid-transfer.
    pub fn close_session(&mut self, session_id: u64) {
        self.handles.retain(|k, _| k.session_id != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds() -> (Datastore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Datastore::new(dir.path().to_path_buf()).unwrap(), dir)
    }

    #[test]
    fn read_missing_file_fails() {
        let (mut store, _dir) = ds();
        let mut buf = [0u8; 512];
        assert_eq!(store.read(1, "nope.txt", &mut buf), Err(DsError::NotExist));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut store, _dir) = ds();
        assert_eq!(store.write(1, "a.txt", b"hello").unwrap(), 5);
        store.write(1, "a.txt", b"").unwrap();
        let mut buf = [0u8; 512];
        let n = store.read(2, "a.txt", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn write_refuses_to_overwrite() {
        let (mut store, _dir) = ds();
        store.write(1, "a.txt", b"x").unwrap();
        store.write(1, "a.txt", b"").unwrap();
        assert_eq!(store.write(2, "a.txt", b"y"), Err(DsError::NotPermitted));
    }

    #[test]
    fn zero_length_file_round_trips() {
        let (mut store, _dir) = ds();
        store.write(1, "empty.txt", b"").unwrap();
        assert_eq!(store.is_file("empty.txt"), FileStat::Present);
        let mut buf = [0u8; 512];
        let n = store.read(2, "empty.txt", &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn close_fails_for_a_handle_that_was_never_opened() {
        let (mut store, _dir) = ds();
        assert_eq!(store.close(1, "never-opened.txt"), Err(DsError::NoSession));
    }

    #[test]
    fn close_fails_the_second_time() {
        let (mut store, _dir) = ds();
        store.write(1, "a.txt", b"x").unwrap();
        assert_eq!(store.close(1, "a.txt"), Ok(()));
        assert_eq!(store.close(1, "a.txt"), Err(DsError::NoSession));
    }

    #[test]
    fn at_most_one_handle_per_session_and_file() {
        let (mut store, _dir) = ds();
        store.write(1, "a.txt", b"x").unwrap();
        assert_eq!(store.handles.len(), 1);
        store.write(1, "a.txt", b"y").unwrap();
        assert_eq!(store.handles.len(), 1);
    }
}
