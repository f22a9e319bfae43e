#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Result, StoreError};
use crate::types::{record_crc32, Checksum, Crc32Fast};

const JOURNAL_MAGIC: [u8; 4] = *b"TRNJ";
const JOURNAL_FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 12;
const FRAME_HEADER_LEN: usize = 8;
const MAX_RECORD_LEN: usize = 64 << 20;

/// Record family stored in a journal; part of the header and of every frame
/// checksum.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalKind {
    /// Delta store inserts and removals.
    Delta = 1,
    /// Snapshot ordinals marked deleted.
    Tombstone = 2,
    /// Canonical triples dumped by a compaction cycle.
    Staging = 3,
}

impl JournalKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Delta),
            2 => Some(Self::Tombstone),
            3 => Some(Self::Staging),
            _ => None,
        }
    }
}

fn encode_header(kind: JournalKind) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&JOURNAL_MAGIC);
    buf[4..6].copy_from_slice(&JOURNAL_FORMAT_VERSION.to_be_bytes());
    buf[6] = kind as u8;
    let mut crc = Crc32Fast::default();
    crc.update(&buf[0..8]);
    buf[8..12].copy_from_slice(&crc.finalize().to_be_bytes());
    buf
}

fn decode_header(src: &[u8], path: &Path) -> Result<JournalKind> {
    let corrupt = |what: &str| StoreError::Corruption(format!("{}: {what}", path.display()));
    if src[0..4] != JOURNAL_MAGIC {
        return Err(corrupt("journal magic mismatch"));
    }
    let version = u16::from_be_bytes([src[4], src[5]]);
    if version != JOURNAL_FORMAT_VERSION {
        return Err(corrupt("journal format version mismatch"));
    }
    let mut crc = Crc32Fast::default();
    crc.update(&src[0..8]);
    let stored = u32::from_be_bytes([src[8], src[9], src[10], src[11]]);
    if crc.finalize() != stored {
        return Err(corrupt("journal header crc mismatch"));
    }
    JournalKind::from_u8(src[6]).ok_or_else(|| corrupt("unknown journal kind"))
}

/// Append-only file of checksummed records.
///
/// Layout: a 12-byte header (magic, version, kind, crc) followed by frames of
/// `[len: u32 BE][crc: u32 BE][payload]`. A frame that fails validation ends
/// the journal; `open` truncates it and everything after it.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    kind: JournalKind,
    records: u64,
    len: u64,
    dirty: bool,
}

impl Journal {
    /// Creates (or truncates) a journal and makes its header durable.
    pub fn create(path: impl AsRef<Path>, kind: JournalKind) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&encode_header(kind))?;
        file.sync_all()?;
        Ok(Self {
            path,
            file,
            kind,
            records: 0,
            len: HEADER_LEN as u64,
            dirty: false,
        })
    }

    /// Opens an existing journal for appending and returns every valid
    /// record. Missing files are created empty; a torn tail is truncated.
    pub fn open(path: impl AsRef<Path>, kind: JournalKind) -> Result<(Self, Vec<Vec<u8>>)> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok((Self::create(&path, kind)?, Vec::new()));
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < HEADER_LEN {
            warn!(path = %path.display(), len = bytes.len(), "journal.header_torn");
            drop(file);
            return Ok((Self::create(&path, kind)?, Vec::new()));
        }
        let found = decode_header(&bytes, &path)?;
        if found != kind {
            return Err(StoreError::Corruption(format!(
                "{}: expected {kind:?} journal, found {found:?}",
                path.display()
            )));
        }
        let (records, valid_up_to) = scan_frames(&bytes, kind);
        if valid_up_to < bytes.len() {
            warn!(
                path = %path.display(),
                valid_up_to,
                file_len = bytes.len(),
                "journal.tail_truncated"
            );
            file.set_len(valid_up_to as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_up_to as u64))?;
        let journal = Self {
            path,
            file,
            kind,
            records: records.len() as u64,
            len: valid_up_to as u64,
            dirty: false,
        };
        Ok((journal, records))
    }

    /// Reads every valid record without opening the file for writing.
    pub fn read_all(path: impl AsRef<Path>, kind: JournalKind) -> Result<Vec<Vec<u8>>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        if bytes.len() < HEADER_LEN {
            return Err(StoreError::Corruption(format!(
                "{}: journal header truncated",
                path.display()
            )));
        }
        let found = decode_header(&bytes, path)?;
        if found != kind {
            return Err(StoreError::Corruption(format!(
                "{}: expected {kind:?} journal, found {found:?}",
                path.display()
            )));
        }
        Ok(scan_frames(&bytes, kind).0)
    }

    /// Appends one record. Not durable until [`Journal::sync`].
    pub fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_RECORD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "journal record too large",
            ));
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&record_crc32(self.kind as u8, payload).to_be_bytes());
        frame.extend_from_slice(payload);
        if let Err(err) = self.file.write_all(&frame) {
            // Drop the partial frame so the next append starts on a boundary.
            let _ = self.file.set_len(self.len);
            let _ = self.file.seek(SeekFrom::Start(self.len));
            return Err(err);
        }
        self.len += frame.len() as u64;
        self.records += 1;
        self.dirty = true;
        Ok(())
    }

    /// Appends one record and, when `sync` is set, flushes it. A failed
    /// flush truncates the record away so it cannot replay on a later open.
    pub fn append_synced(&mut self, payload: &[u8], sync: bool) -> io::Result<()> {
        self.append_then(payload, |journal| {
            if sync {
                journal.sync()
            } else {
                Ok(())
            }
        })
    }

    fn append_then(
        &mut self,
        payload: &[u8],
        commit: impl FnOnce(&mut Self) -> io::Result<()>,
    ) -> io::Result<()> {
        let (len, records) = (self.len, self.records);
        self.append(payload)?;
        if let Err(err) = commit(self) {
            self.file.set_len(len)?;
            self.file.seek(SeekFrom::Start(len))?;
            self.len = len;
            self.records = records;
            return Err(err);
        }
        Ok(())
    }

    /// Flushes appended records to stable storage.
    pub fn sync(&mut self) -> io::Result<()> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Records in the journal, including those replayed at open.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true when the journal holds no records.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn scan_frames(bytes: &[u8], kind: JournalKind) -> (Vec<Vec<u8>>, usize) {
    let mut records = Vec::new();
    let mut offset = HEADER_LEN;
    while offset + FRAME_HEADER_LEN <= bytes.len() {
        let len = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let crc = u32::from_be_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        let start = offset + FRAME_HEADER_LEN;
        if len > MAX_RECORD_LEN || start + len > bytes.len() {
            break;
        }
        let payload = &bytes[start..start + len];
        if record_crc32(kind as u8, payload) != crc {
            break;
        }
        records.push(payload.to_vec());
        offset = start + len;
    }
    (records, offset)
}
