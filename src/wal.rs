use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one event as `[len][bincode][crc32]`. Returns the bytes written.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + payload.len() as u64)
}

/// Result of reading a log back.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the valid prefix.
    pub valid_bytes: u64,
    /// Bytes after the last valid entry (torn write or corruption).
    pub discarded_bytes: u64,
}

/// Append-only write-ahead log of booking engine events.
///
/// Entry layout: `[u32 LE: len][bincode Event][u32 LE: crc32 of payload]`.
/// A torn final entry is dropped on replay; the engine never applies an event
/// to memory before its entry has been fsynced.
///
/// A batch that fails to reach disk is cut off again with [`Wal::rollback`],
/// so the file only ever holds entries some caller was told succeeded.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
    pending_bytes: u64,
    pending_appends: u64,
    /// Set when a rollback could not restore `durable_len`.
    poisoned: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_bytes: 0,
            pending_appends: 0,
            poisoned: false,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an entry. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned after a failed rollback"));
        }
        // Counted before writing: a partly encoded entry still has to be cut off.
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        self.pending_bytes += encode_event(&mut self.writer, event)?;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned after a failed rollback"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Drop everything written since the last successful `flush_sync`:
    /// bytes still buffered and bytes that reached the file unsynced.
    /// On failure the log refuses all further appends.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.appends_since_compact -= self.pending_appends;
        self.pending_appends = 0;
        self.pending_bytes = 0;
        let result = self.truncate_to_durable();
        self.poisoned = result.is_err();
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts drops the buffer instead of flushing it.
        let (stale_file, _unwritten) = stale.into_parts();
        drop(stale_file);
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    #[cfg(test)]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot to the side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        // The snapshot replaces whatever a failed rollback left behind.
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Cut a torn or corrupt tail so later appends stay reachable on replay.
    pub fn discard_tail(path: &Path, valid_bytes: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_bytes)?;
        file.sync_all()
    }

    /// Read every valid entry. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        let mut consumed: u64 = 0;

        while let Some(event) = read_entry(&mut reader)? {
            match event {
                Entry::Valid(event, size) => {
                    replay.events.push(event);
                    consumed += size;
                }
                Entry::Corrupt => break,
            }
        }

        replay.valid_bytes = consumed;
        replay.discarded_bytes = total.saturating_sub(consumed);
        Ok(replay)
    }
}

enum Entry {
    Valid(Event, u64),
    Corrupt,
}

/// `Ok(None)` on a clean or torn end of file.
fn read_entry(reader: &mut impl Read) -> io::Result<Option<Entry>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }

    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Some(Entry::Corrupt));
    }

    Ok(Some(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Entry::Valid(event, 8 + len as u64),
        Err(_) => Entry::Corrupt,
    }))
}

/// `Ok(false)` when the reader ends before `buf` is filled.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
