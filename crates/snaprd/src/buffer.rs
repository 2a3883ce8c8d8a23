//! Write-behind: a fixed-size byte ring buffer mirroring downloaded bytes to
//! a `*-partial` file, drained by a `flush()` call from the main loop and
//! atomically renamed into place on success.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum Error {
    DiskFull,
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::DiskFull => write!(f, "write-behind target is out of disk space"),
            Error::Io(msg) => write!(f, "write-behind I/O error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

fn classify(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WriteZero | io::ErrorKind::QuotaExceeded => Error::DiskFull,
        _ if e.raw_os_error() == Some(28) /* ENOSPC */ => Error::DiskFull,
        _ => Error::Io(e.to_string()),
    }
}

pub struct WriteBehind {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    len: usize,
    file: Option<std::fs::File>,
    partial_path: PathBuf,
    final_path: PathBuf,
}

impl WriteBehind {
    pub fn new(capacity: usize, final_path: impl AsRef<Path>) -> Self {
        let final_path = final_path.as_ref().to_path_buf();
        let mut partial = final_path.clone().into_os_string();
        partial.push("-partial");
        WriteBehind {
            buf: vec![0u8; capacity.max(1)],
            head: 0,
            tail: 0,
            len: 0,
            file: None,
            partial_path: PathBuf::from(partial),
            final_path,
        }
    }

    pub fn open(&mut self) -> Result<(), Error> {
        self.file = Some(std::fs::File::create(&self.partial_path).map_err(classify)?);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Mirrors `data` into the ring. If the ring is full, the oldest
    /// unflushed bytes are overwritten: pacing is the caller's job (slowing
    /// reads to stay ahead of `flush`), not this buffer's.
    pub fn push(&mut self, data: &[u8]) {
        for &b in data {
            self.buf[self.tail] = b;
            self.tail = (self.tail + 1) % self.buf.len();
            if self.len == self.buf.len() {
                self.head = (self.head + 1) % self.buf.len();
            } else {
                self.len += 1;
            }
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.len
    }

    /// Drains currently buffered bytes to the partial file.
    pub fn flush(&mut self) -> Result<usize, Error> {
        let Some(file) = self.file.as_mut() else { return Ok(0) };
        let mut written = 0;
        while self.len > 0 {
            let chunk_len = self.len.min(self.buf.len() - self.head);
            let n = file.write(&self.buf[self.head..self.head + chunk_len]).map_err(classify)?;
            if n == 0 {
                return Err(Error::DiskFull);
            }
            self.head = (self.head + n) % self.buf.len();
            self.len -= n;
            written += n;
        }
        Ok(written)
    }

    /// Flushes remaining bytes and atomically renames the partial file into
    /// place.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.flush()?;
        self.file = None;
        std::fs::rename(&self.partial_path, &self.final_path).map_err(classify)
    }
}
