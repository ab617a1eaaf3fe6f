//! Append-only record logs
//!
//! Every record is written as one frame:
//!
//! ```text
//! [u32 LE body length][u32 LE crc32 of body][protobuf body]
//! ```
//!
//! Readers stop at the first frame that is incomplete, fails its checksum or
//! does not decode. Everything before that point is trusted; everything after
//! it is a torn write from a crash and is cut off when the log is reopened.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use prost::Message;

use crate::core::config::FsyncPolicy;

const FRAME_HEADER_LEN: usize = 8;

/// Frames claiming more than this are treated as a corrupt header
const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Records read back from a log, plus how much of the file was usable
#[derive(Debug)]
pub struct Replay<M> {
    pub records: Vec<M>,
    pub valid_len: u64,
    pub file_len: u64,
}

impl<M> Replay<M> {
    pub fn torn_bytes(&self) -> u64 {
        self.file_len - self.valid_len
    }
}

/// Read all intact frames of a log without modifying it
pub fn read<M: Message + Default>(path: &Path) -> io::Result<Replay<M>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Replay {
                records: Vec::new(),
                valid_len: 0,
                file_len: 0,
            });
        }
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    let mut offset = 0usize;
    while let Some((record, next)) = decode_frame::<M>(&data, offset) {
        records.push(record);
        offset = next;
    }

    Ok(Replay {
        records,
        valid_len: offset as u64,
        file_len: data.len() as u64,
    })
}

/// Read a log and cut off any torn tail so new frames append cleanly
pub fn recover<M: Message + Default>(path: &Path) -> io::Result<Replay<M>> {
    let replay = read::<M>(path)?;
    if replay.torn_bytes() > 0 {
        tracing::warn!(
            path = %path.display(),
            torn_bytes = replay.torn_bytes(),
            valid_bytes = replay.valid_len,
            "Truncating torn tail of queue log"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(replay.valid_len)?;
        file.sync_all()?;
    }
    Ok(replay)
}

fn decode_frame<M: Message + Default>(data: &[u8], offset: usize) -> Option<(M, usize)> {
    let header = data.get(offset..offset + FRAME_HEADER_LEN)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return None;
    }

    let start = offset + FRAME_HEADER_LEN;
    let body = data.get(start..start + len)?;
    if crc32fast::hash(body) != crc {
        return None;
    }

    let record = M::decode(body).ok()?;
    Some((record, start + len))
}

fn encode_frame<M: Message>(record: &M, buf: &mut Vec<u8>) {
    let body = record.encode_to_vec();
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    buf.extend_from_slice(&body);
}

/// A replacement for a log, written next to it as `<name>.log.tmp` and
/// renamed over it once complete
#[derive(Debug)]
pub struct StagedLog {
    tmp: PathBuf,
    file: File,
}

impl StagedLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        let tmp = path.with_extension("log.tmp");
        let file = File::create(&tmp)?;
        Ok(Self { tmp, file })
    }

    /// Write framed records and sync them to disk
    pub fn write_all<'a, M, I>(&mut self, records: I) -> io::Result<()>
    where
        M: Message + 'a,
        I: IntoIterator<Item = &'a M>,
    {
        let mut buf = Vec::new();
        for record in records {
            encode_frame(record, &mut buf);
        }
        if !buf.is_empty() {
            self.file.write_all(&buf)?;
        }
        self.file.sync_all()
    }

    /// Atomically replace the log at `path`
    pub fn install(self, path: &Path) -> io::Result<()> {
        drop(self.file);
        fs::rename(&self.tmp, path)?;
        sync_parent_dir(path);
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
        && let Err(e) = dir.sync_all()
    {
        tracing::debug!(error = %e, path = %parent.display(), "Failed to sync queue directory");
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// An open log positioned for appends
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    file: File,
    fsync: FsyncPolicy,
}

impl LogFile {
    pub fn open(path: &Path, fsync: FsyncPolicy) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            fsync,
        })
    }

    /// Append one framed record
    pub fn append<M: Message>(&mut self, record: &M) -> io::Result<()> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + record.encoded_len());
        encode_frame(record, &mut buf);
        self.file.write_all(&buf)?;
        if self.fsync == FsyncPolicy::Always {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drop every record in the log
    #[allow(dead_code)]
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()
    }

    /// Reopen after the file was replaced on disk
    pub fn reopen(&mut self) -> io::Result<()> {
        *self = Self::open(&self.path, self.fsync)?;
        Ok(())
    }
}
