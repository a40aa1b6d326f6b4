use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store;

/// One durable store mutation. JSON payloads are kept as text because bincode
/// cannot decode self-describing `serde_json::Value`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    Set { path: String, json: String },
    Update { path: String, json: String },
    Remove { path: String },
}

impl StoreOp {
    pub fn encode(write: &store::Write) -> Result<Self, store::StoreError> {
        Ok(match write {
            store::Write::Set { path, value } => StoreOp::Set {
                path: path.clone(),
                json: serde_json::to_string(value)?,
            },
            store::Write::Update { path, partial } => StoreOp::Update {
                path: path.clone(),
                json: serde_json::to_string(partial)?,
            },
            store::Write::Remove { path } => StoreOp::Remove { path: path.clone() },
        })
    }

    pub fn decode(&self) -> Result<store::Write, store::StoreError> {
        Ok(match self {
            StoreOp::Set { path, json } => store::Write::Set {
                path: path.clone(),
                value: serde_json::from_str(json)?,
            },
            StoreOp::Update { path, json } => store::Write::Update {
                path: path.clone(),
                partial: serde_json::from_str(json)?,
            },
            StoreOp::Remove { path } => store::Write::Remove { path: path.clone() },
        })
    }
}

/// Largest payload replay will allocate for. A longer length prefix can only come
/// from a corrupt tail.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn write_frame(writer: &mut impl Write, op: &StoreOp) -> io::Result<()> {
    let payload =
        bincode::serialize(op).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf`. `false` means the file ended first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact payload, or `None` where the usable log ends.
fn read_frame(reader: &mut impl Read, path: &Path) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        warn!("bad frame length {len} in {}, discarding tail", path.display());
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        debug!("torn last entry in {}", path.display());
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        warn!("checksum mismatch in {}, discarding tail", path.display());
        return Ok(None);
    }
    Ok(Some(payload))
}

fn compact_tmp_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

/// Append-only log of store writes.
///
/// Each entry is `[u32 len][bincode StoreOp][u32 crc32]`, little-endian, where `len`
/// counts the payload only. Replay stops at the first torn or corrupt entry.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, op: &StoreOp) -> io::Result<()> {
        self.append_buffered(op)?;
        self.flush_sync()
    }

    /// Buffer an op. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, op: &StoreOp) -> io::Result<()> {
        write_frame(&mut self.writer, op)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write `ops` to the side file that `swap_compact_file` installs.
    pub fn write_compact_file(path: &Path, ops: &[StoreOp]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(compact_tmp_path(path))?);
        for op in ops {
            write_frame(&mut writer, op)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Replace the log with the side file and keep appending to the new one.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, ops: &[StoreOp]) -> io::Result<()> {
        Self::write_compact_file(&self.path, ops)?;
        self.swap_compact_file()
    }

    /// Every intact op in the log at `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<StoreOp>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut ops = Vec::new();
        while let Some(payload) = read_frame(&mut reader, path)? {
            match bincode::deserialize::<StoreOp>(&payload) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    warn!("undecodable entry in {}: {e}", path.display());
                    break;
                }
            }
        }
        Ok(ops)
    }
}
