// Append-friendly block container.
//
// An archive is a flat file of parts, each belonging to a named stream.
// A part is a varint metadata word followed by its payload bytes. The
// stream table (name, raw size, part offsets) lives in a footer written
// on finalize; the last eight bytes of the file hold the footer length.
//
// Appending reopens the file, drops the footer, continues writing parts
// and writes a fresh footer on finalize. Existing parts are never moved.

use crate::varint::{push_cstr, push_vuint, read_vuint, take_cstr, take_vuint, write_vuint};
use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
struct PartMeta {
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct StreamMeta {
    name: String,
    raw_size: u64,
    parts: Vec<PartMeta>,
}

#[derive(Debug)]
enum Mode {
    Read(BufReader<File>),
    Write(BufWriter<File>),
}

/// Stream id handed out by [`Container::register`]
pub type StreamId = usize;

/// Saved tail of an archive opened for append, for restoring the
/// original file when the append fails
#[derive(Debug)]
struct AppendRollback {
    data_end: u64,
    tail: Vec<u8>,
}

#[derive(Debug)]
pub struct Container {
    mode: Mode,
    write_offset: u64,
    streams: Vec<StreamMeta>,
    by_name: AHashMap<String, StreamId>,
    finalized: bool,
    append_rollback: Option<AppendRollback>,
}

impl Container {
    /// Create a fresh archive file for writing
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("cannot create archive {}", path.as_ref().display()))?;
        Ok(Container {
            mode: Mode::Write(BufWriter::new(file)),
            write_offset: 0,
            streams: Vec::new(),
            by_name: AHashMap::new(),
            finalized: false,
            append_rollback: None,
        })
    }

    /// Open an existing archive for reading
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)
            .with_context(|| format!("cannot open archive {}", path.as_ref().display()))?;
        let mut container = Container {
            mode: Mode::Read(BufReader::new(file)),
            write_offset: 0,
            streams: Vec::new(),
            by_name: AHashMap::new(),
            finalized: true,
            append_rollback: None,
        };
        container.load_footer()?;
        Ok(container)
    }

    /// Reopen an existing archive for appending. The footer is dropped
    /// and rewritten on finalize; stored parts stay where they are.
    pub fn open_append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut container = Self::open(&path)?;
        let (data_end, tail) = {
            let Mode::Read(reader) = &mut container.mode else {
                unreachable!()
            };
            let file_size = reader.get_ref().metadata()?.len();
            reader.seek(SeekFrom::End(-8))?;
            let mut footer_size = [0u8; 8];
            reader.read_exact(&mut footer_size)?;
            let data_end = file_size - 8 - u64::from_le_bytes(footer_size);

            // Keep the original footer so a failed append can restore it
            reader.seek(SeekFrom::Start(data_end))?;
            let mut tail = vec![0u8; (file_size - data_end) as usize];
            reader.read_exact(&mut tail)?;
            (data_end, tail)
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("cannot reopen archive {}", path.as_ref().display()))?;
        file.set_len(data_end)?;
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(data_end))?;

        container.mode = Mode::Write(writer);
        container.write_offset = data_end;
        container.finalized = false;
        container.append_rollback = Some(AppendRollback { data_end, tail });
        Ok(container)
    }

    /// Undo a failed append: drop everything written since open_append
    /// and put the original footer back
    pub fn abort_append(&mut self) -> Result<()> {
        let Some(rollback) = self.append_rollback.take() else {
            return Ok(());
        };
        let Mode::Write(writer) = &mut self.mode else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_mut().set_len(rollback.data_end)?;
        writer.seek(SeekFrom::Start(rollback.data_end))?;
        writer.write_all(&rollback.tail)?;
        writer.flush()?;
        self.finalized = true;
        Ok(())
    }

    /// Register a stream (or return the id of an existing one)
    pub fn register(&mut self, name: &str) -> StreamId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.streams.len();
        self.streams.push(StreamMeta {
            name: name.to_string(),
            raw_size: 0,
            parts: Vec::new(),
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn stream_id(&self, name: &str) -> Option<StreamId> {
        self.by_name.get(name).copied()
    }

    /// Stream names matching a prefix, in registration order
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.streams
            .iter()
            .filter(|s| s.name.starts_with(prefix))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn part_count(&self, id: StreamId) -> usize {
        self.streams.get(id).map_or(0, |s| s.parts.len())
    }

    pub fn raw_size(&self, id: StreamId) -> u64 {
        self.streams.get(id).map_or(0, |s| s.raw_size)
    }

    pub fn add_raw_size(&mut self, id: StreamId, delta: u64) {
        if let Some(s) = self.streams.get_mut(id) {
            s.raw_size += delta;
        }
    }

    /// Total payload bytes stored for a stream
    pub fn packed_size(&self, id: StreamId) -> u64 {
        self.streams
            .get(id)
            .map_or(0, |s| s.parts.iter().map(|p| p.size).sum())
    }

    /// Append a part to a stream
    pub fn append_part(&mut self, id: StreamId, data: &[u8], metadata: u64) -> Result<()> {
        if id >= self.streams.len() {
            bail!("invalid stream id {id}");
        }
        let Mode::Write(writer) = &mut self.mode else {
            bail!("archive is not open for writing");
        };

        let offset = self.write_offset;
        let meta_len = write_vuint(writer, metadata)?;
        writer.write_all(data)?;
        self.write_offset += (meta_len + data.len()) as u64;

        self.streams[id].parts.push(PartMeta {
            offset,
            size: data.len() as u64,
        });
        Ok(())
    }

    /// Read a part by index. Returns (payload, metadata).
    pub fn read_part(&mut self, id: StreamId, part_ix: usize) -> Result<(Vec<u8>, u64)> {
        let part = *self
            .streams
            .get(id)
            .and_then(|s| s.parts.get(part_ix))
            .with_context(|| format!("no part {part_ix} in stream {id}"))?;
        let Mode::Read(reader) = &mut self.mode else {
            bail!("archive is not open for reading");
        };

        reader.seek(SeekFrom::Start(part.offset))?;
        let metadata = read_vuint(reader)?;
        let mut data = vec![0u8; part.size as usize];
        reader.read_exact(&mut data)?;
        Ok((data, metadata))
    }

    /// Read the last part of a stream (catalog snapshots)
    pub fn read_last_part(&mut self, id: StreamId) -> Result<(Vec<u8>, u64)> {
        let last = self.part_count(id);
        if last == 0 {
            bail!("stream {id} has no parts");
        }
        self.read_part(id, last - 1)
    }

    /// Flush parts and write the footer. Must be called exactly once on
    /// a written archive; skipping it (the abort path) leaves the file
    /// without a footer, i.e. unreadable by design.
    pub fn finalize(&mut self) -> Result<()> {
        let Mode::Write(writer) = &mut self.mode else {
            return Ok(());
        };
        if self.finalized {
            return Ok(());
        }

        let mut footer = Vec::new();
        push_vuint(&mut footer, self.streams.len() as u64);
        for stream in &self.streams {
            push_cstr(&mut footer, &stream.name);
            push_vuint(&mut footer, stream.raw_size);
            push_vuint(&mut footer, stream.parts.len() as u64);
            for part in &stream.parts {
                push_vuint(&mut footer, part.offset);
                push_vuint(&mut footer, part.size);
            }
        }

        writer.write_all(&footer)?;
        writer.write_all(&(footer.len() as u64).to_le_bytes())?;
        writer.flush()?;
        self.finalized = true;
        Ok(())
    }

    fn load_footer(&mut self) -> Result<()> {
        let Mode::Read(reader) = &mut self.mode else {
            unreachable!()
        };
        let file_size = reader.get_ref().metadata()?.len();
        if file_size < 8 {
            bail!("archive too short to hold a footer");
        }

        reader.seek(SeekFrom::End(-8))?;
        let mut footer_size_bytes = [0u8; 8];
        reader.read_exact(&mut footer_size_bytes)?;
        let footer_size = u64::from_le_bytes(footer_size_bytes);
        if footer_size + 8 > file_size {
            bail!("archive footer length out of range");
        }

        reader.seek(SeekFrom::Start(file_size - 8 - footer_size))?;
        let mut footer = vec![0u8; footer_size as usize];
        reader.read_exact(&mut footer)?;

        let mut ptr = footer.as_slice();
        let no_streams = take_vuint(&mut ptr)?;
        for _ in 0..no_streams {
            let name = take_cstr(&mut ptr)?;
            let raw_size = take_vuint(&mut ptr)?;
            let no_parts = take_vuint(&mut ptr)?;
            let mut parts = Vec::with_capacity(no_parts as usize);
            for _ in 0..no_parts {
                let offset = take_vuint(&mut ptr)?;
                let size = take_vuint(&mut ptr)?;
                parts.push(PartMeta { offset, size });
            }
            let id = self.streams.len();
            self.by_name.insert(name.clone(), id);
            self.streams.push(StreamMeta {
                name,
                raw_size,
                parts,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.parc");

        {
            let mut c = Container::create(&path).unwrap();
            let s = c.register("alpha");
            c.append_part(s, b"hello", 42).unwrap();
            c.append_part(s, b"world", 99).unwrap();
            c.add_raw_size(s, 100);
            c.finalize().unwrap();
        }

        let mut c = Container::open(&path).unwrap();
        let s = c.stream_id("alpha").unwrap();
        assert_eq!(c.part_count(s), 2);
        assert_eq!(c.raw_size(s), 100);
        assert_eq!(c.read_part(s, 0).unwrap(), (b"hello".to_vec(), 42));
        assert_eq!(c.read_part(s, 1).unwrap(), (b"world".to_vec(), 99));
    }

    #[test]
    fn append_preserves_existing_parts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.parc");

        {
            let mut c = Container::create(&path).unwrap();
            let s = c.register("data");
            c.append_part(s, b"one", 1).unwrap();
            c.finalize().unwrap();
        }
        {
            let mut c = Container::open_append(&path).unwrap();
            let s = c.stream_id("data").unwrap();
            c.append_part(s, b"two", 2).unwrap();
            let fresh = c.register("extra");
            c.append_part(fresh, b"three", 3).unwrap();
            c.finalize().unwrap();
        }

        let mut c = Container::open(&path).unwrap();
        let s = c.stream_id("data").unwrap();
        assert_eq!(c.part_count(s), 2);
        assert_eq!(c.read_part(s, 0).unwrap(), (b"one".to_vec(), 1));
        assert_eq!(c.read_part(s, 1).unwrap(), (b"two".to_vec(), 2));
        let e = c.stream_id("extra").unwrap();
        assert_eq!(c.read_part(e, 0).unwrap(), (b"three".to_vec(), 3));
    }

    #[test]
    fn prefix_enumeration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.parc");
        let mut c = Container::create(&path).unwrap();
        c.register("g0r");
        c.register("g0d");
        c.register("samples");
        assert_eq!(c.names_with_prefix("g0").len(), 2);
        assert_eq!(c.names_with_prefix("samples").len(), 1);
        c.finalize().unwrap();
    }

    #[test]
    fn aborted_append_restores_original() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.parc");

        {
            let mut c = Container::create(&path).unwrap();
            let s = c.register("data");
            c.append_part(s, b"keep", 7).unwrap();
            c.finalize().unwrap();
        }
        let original_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut c = Container::open_append(&path).unwrap();
            let s = c.stream_id("data").unwrap();
            c.append_part(s, b"discard", 8).unwrap();
            c.abort_append().unwrap();
        }

        assert_eq!(std::fs::metadata(&path).unwrap().len(), original_len);
        let mut c = Container::open(&path).unwrap();
        let s = c.stream_id("data").unwrap();
        assert_eq!(c.part_count(s), 1);
        assert_eq!(c.read_part(s, 0).unwrap(), (b"keep".to_vec(), 7));
    }

    #[test]
    fn unfinalized_archive_is_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.parc");
        {
            let mut c = Container::create(&path).unwrap();
            let s = c.register("data");
            c.append_part(s, b"junk", 0).unwrap();
            // no finalize
        }
        assert!(Container::open(&path).is_err());
    }
}
