//! The persistent build log: a streaming, append-only record of executed
//! commands and discovered dependencies, used to decide what is out of date
//! on later runs.
//!
//! Each run appends to the log file; loading replays all records in series,
//! newer records superseding older ones.  Once the share of superseded
//! records crosses a threshold the file is rewritten (recompacted).
//!
//! On-disk format: a stream of records, each a 4-byte little-endian size
//! prefix followed by that many payload bytes.  The first payload byte is a
//! tag selecting one of four record kinds:
//!
//!   version  [tag=0] u32 version                    -- must come first
//!   build    [tag=1] u64 command_hash, i32 start_time, i32 end_time,
//!                    i64 mtime, output path bytes
//!   path     [tag=2] u32 checksum, path bytes       -- assigns the next
//!                    dense id; checksum is the id's ones' complement, to
//!                    detect concurrent writers
//!   deps     [tag=3] i32 output id, i64 mtime, u32 count, count * u32 ids
//!
//! Every record write is flushed so a crash can lose at most one partial
//! record; loading truncates the file back to the last whole record.

use crate::graph::{EdgeId, NodeId, State, TimeStamp};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

pub const FILENAME: &str = ".majak_log";

const CURRENT_VERSION: u32 = 1;
const OLDEST_SUPPORTED_VERSION: u32 = 1;

/// Record size cap, low enough to keep single-write flushing honest.
const MAX_RECORD_SIZE: usize = (1 << 20) - 1;

const TAG_VERSION: u8 = 0;
const TAG_BUILD: u8 = 1;
const TAG_PATH: u8 = 2;
const TAG_DEPS: u8 = 3;

/// 64-bit MurmurHash2, matching the reference implementation so command
/// hashes are stable across processes.
pub fn hash_command(command: &str) -> u64 {
    const SEED: u64 = 0xDECAFBADDECAFBAD;
    const M: u64 = 0xc6a4a7935bd1e995;
    const R: u32 = 47;
    let data = command.as_bytes();
    let mut h = SEED ^ (data.len() as u64).wrapping_mul(M);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut k: u64 = 0;
        for (i, &b) in rem.iter().enumerate() {
            k |= (b as u64) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(M);
    }
    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// Can answer questions about the manifest for the BuildLog.
pub trait BuildLogUser {
    /// Whether a given output is no longer part of the build manifest.
    /// Only called during recompaction, so it doesn't have to be fast.
    fn is_path_dead(&self, state: &State, path: &str) -> bool;
}

/// A previously-run command, looked up by output path.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub output: String,
    pub command_hash: u64,
    pub start_time: i32,
    pub end_time: i32,
    pub mtime: TimeStamp,
}

/// Dependencies discovered when an output was last built.
#[derive(Debug, Clone, PartialEq)]
pub struct Deps {
    pub mtime: TimeStamp,
    pub nodes: Vec<NodeId>,
}

/// Outcome of loading the on-disk log.
pub enum LoadStatus {
    Loaded,
    /// Loaded with data loss; carries a warning for the user.
    Recovered(String),
}

#[derive(Default)]
pub struct BuildLog {
    /// Maps output path -> latest command record.
    entries: HashMap<String, LogEntry>,
    /// Maps log id -> node.
    nodes: Vec<NodeId>,
    /// Maps log id -> deps of that id.
    deps: Vec<Option<Deps>>,
    file: Option<BufWriter<File>>,
    needs_recompaction: bool,
}

/// Writes one length-prefixed record and flushes, so partial writes are
/// bounded to a single record.
fn flush_record(file: &mut BufWriter<File>, payload: &[u8]) -> anyhow::Result<()> {
    assert!(payload.len() <= MAX_RECORD_SIZE);
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(payload)?;
    file.flush()?;
    Ok(())
}

/// Cursor over one record payload; every getter bounds-checks so corrupt
/// records fail verification instead of panicking.
struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        RecordReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Some(s)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }
    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> Option<i32> {
        Some(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn rest_str(&mut self) -> Option<&'a str> {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        std::str::from_utf8(s).ok()
    }
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog::default()
    }

    pub fn entries(&self) -> &HashMap<String, LogEntry> {
        &self.entries
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn deps_count(&self) -> usize {
        self.deps.iter().filter(|d| d.is_some()).count()
    }

    pub fn lookup_by_output(&self, path: &str) -> Option<&LogEntry> {
        self.entries.get(path)
    }

    /// Deps recorded for a node, if it has ever appeared in the deps stream.
    pub fn deps_for(&self, state: &State, node: NodeId) -> Option<&Deps> {
        let id = state.node(node).log_id?;
        self.deps.get(id)?.as_ref()
    }

    /// Open the log for appending, recompacting first if loading decided the
    /// file has too much dead weight.
    pub fn open_for_write(
        &mut self,
        path: &Path,
        user: &dyn BuildLogUser,
        state: &mut State,
    ) -> anyhow::Result<()> {
        if self.needs_recompaction {
            self.recompact(path, user, state)?;
            self.needs_recompaction = false;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| anyhow::anyhow!("open {}: {}", path.display(), err))?;
        // Append mode doesn't position the file pointer at the end on all
        // platforms; do it explicitly so stream_position is meaningful.
        let len = file.seek(std::io::SeekFrom::End(0))?;
        let mut file = BufWriter::new(file);
        if len == 0 {
            let mut payload = vec![TAG_VERSION];
            payload.extend_from_slice(&CURRENT_VERSION.to_le_bytes());
            flush_record(&mut file, &payload)?;
        }
        self.file = Some(file);
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Record a finished command, one entry per output.
    pub fn record_command(
        &mut self,
        state: &State,
        edge: EdgeId,
        start_time: i32,
        end_time: i32,
        mtime: TimeStamp,
    ) -> anyhow::Result<()> {
        let command = state.evaluate_command_with_rsp(edge);
        let command_hash = hash_command(&command);
        let outs = state.edge(edge).outs.clone();
        for out in outs {
            let path = state.node(out).path.clone();
            self.record_command_entry(path, command_hash, start_time, end_time, mtime)?;
        }
        Ok(())
    }

    fn record_command_entry(
        &mut self,
        path: String,
        command_hash: u64,
        start_time: i32,
        end_time: i32,
        mtime: TimeStamp,
    ) -> anyhow::Result<()> {
        let entry = self
            .entries
            .entry(path.clone())
            .or_insert_with(|| LogEntry {
                output: path,
                command_hash: 0,
                start_time: 0,
                end_time: 0,
                mtime: 0,
            });
        entry.command_hash = command_hash;
        entry.start_time = start_time;
        entry.end_time = end_time;
        entry.mtime = mtime;

        if let Some(file) = &mut self.file {
            let mut payload = Vec::with_capacity(29 + entry.output.len());
            payload.push(TAG_BUILD);
            payload.extend_from_slice(&entry.command_hash.to_le_bytes());
            payload.extend_from_slice(&entry.start_time.to_le_bytes());
            payload.extend_from_slice(&entry.end_time.to_le_bytes());
            payload.extend_from_slice(&entry.mtime.to_le_bytes());
            payload.extend_from_slice(entry.output.as_bytes());
            flush_record(file, &payload)?;
        }
        Ok(())
    }

    /// Record the dependencies discovered while building `node`.
    pub fn record_deps(
        &mut self,
        state: &mut State,
        node: NodeId,
        mtime: TimeStamp,
        deps: &[NodeId],
    ) -> anyhow::Result<()> {
        // Assign ids to all nodes that are missing one.
        let mut made_change = false;
        if state.node(node).log_id.is_none() {
            self.record_id(state, node)?;
            made_change = true;
        }
        for &dep in deps {
            if state.node(dep).log_id.is_none() {
                self.record_id(state, dep)?;
                made_change = true;
            }
        }

        // See if the new data differs from what we already have.
        if !made_change {
            match self.deps_for(state, node) {
                Some(existing) if existing.mtime == mtime && existing.nodes == deps => {
                    return Ok(());
                }
                _ => {}
            }
        }

        let out_id = state.node(node).log_id.unwrap();
        if let Some(file) = &mut self.file {
            let mut payload = Vec::with_capacity(17 + deps.len() * 4);
            payload.push(TAG_DEPS);
            payload.extend_from_slice(&(out_id as i32).to_le_bytes());
            payload.extend_from_slice(&mtime.to_le_bytes());
            payload.extend_from_slice(&(deps.len() as u32).to_le_bytes());
            for &dep in deps {
                let id = state.node(dep).log_id.unwrap() as u32;
                payload.extend_from_slice(&id.to_le_bytes());
            }
            flush_record(file, &payload)?;
        }

        self.update_deps(
            out_id,
            Deps {
                mtime,
                nodes: deps.to_vec(),
            },
        );
        Ok(())
    }

    /// Write a path record, assigning the node the next dense id.
    fn record_id(&mut self, state: &mut State, node: NodeId) -> anyhow::Result<()> {
        let id = self.nodes.len();
        if let Some(file) = &mut self.file {
            let path = &state.node(node).path;
            let mut payload = Vec::with_capacity(5 + path.len());
            payload.push(TAG_PATH);
            payload.extend_from_slice(&(!(id as u32)).to_le_bytes());
            payload.extend_from_slice(path.as_bytes());
            flush_record(file, &payload)?;
        }
        state.node_mut(node).log_id = Some(id);
        self.nodes.push(node);
        Ok(())
    }

    /// Returns true if a prior deps record was replaced.
    fn update_deps(&mut self, out_id: usize, deps: Deps) -> bool {
        if out_id >= self.deps.len() {
            self.deps.resize(out_id + 1, None);
        }
        let was_there = self.deps[out_id].is_some();
        self.deps[out_id] = Some(deps);
        was_there
    }

    /// Load the log, recovering from truncation and concurrent-writer damage.
    /// An unreadable log never fails the build; at worst it is deleted and
    /// everything rebuilds.
    pub fn load(&mut self, path: &Path, state: &mut State) -> anyhow::Result<LoadStatus> {
        let buf = match std::fs::read(path) {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadStatus::Loaded)
            }
            Err(err) => return Err(anyhow::anyhow!("read {}: {}", path.display(), err)),
        };
        if buf.is_empty() {
            return Ok(LoadStatus::Loaded);
        }

        let mut ofs = 0;

        // The first record must carry a supported version.
        let version = read_record(&buf, &mut ofs).and_then(|payload| {
            let mut r = RecordReader::new(payload);
            if r.u8()? != TAG_VERSION {
                return None;
            }
            r.u32()
        });
        let valid = matches!(version, Some(v) if (OLDEST_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&v));
        if !valid {
            let why = match version {
                None => "missing log version entry".to_owned(),
                Some(v) => format!("unsupported log version {}", v),
            };
            std::fs::remove_file(path)
                .map_err(|err| anyhow::anyhow!("remove invalid build log: {}", err))?;
            // An empty build log just causes us to rebuild the outputs.
            return Ok(LoadStatus::Recovered(format!("{}; starting over", why)));
        }
        let version = version.unwrap();

        let mut total_entry_count = 0usize;
        let mut unique_entry_count = 0usize;
        let mut total_dep_record_count = 0usize;
        let mut unique_dep_record_count = 0usize;

        let mut last_good = ofs;
        let truncated = loop {
            let record_start = ofs;
            let payload = match read_record(&buf, &mut ofs) {
                Some(p) => p,
                None => break record_start < buf.len(),
            };
            if !self.apply_record(
                payload,
                state,
                &mut total_entry_count,
                &mut unique_entry_count,
                &mut total_dep_record_count,
                &mut unique_dep_record_count,
            ) {
                break true;
            }
            last_good = ofs;
        };

        if truncated {
            // Try to recover by dropping everything from the first bad
            // record on.
            let file = std::fs::OpenOptions::new().write(true).open(path)?;
            file.set_len(last_good as u64)?;
            return Ok(LoadStatus::Recovered(
                "premature end of file; recovering".to_owned(),
            ));
        }

        // Decide whether it's time to rebuild the log:
        // - if we're upgrading versions
        // - if it's getting large
        const MIN_COMPACTION_ENTRY_COUNT: usize = 100;
        const MIN_COMPACTION_DEPS_COUNT: usize = 1000;
        const COMPACTION_RATIO: usize = 3;
        if version < CURRENT_VERSION
            || (total_entry_count > MIN_COMPACTION_ENTRY_COUNT
                && total_entry_count > unique_entry_count * COMPACTION_RATIO)
            || (total_dep_record_count > MIN_COMPACTION_DEPS_COUNT
                && total_dep_record_count > unique_dep_record_count * COMPACTION_RATIO)
        {
            self.needs_recompaction = true;
        }

        Ok(LoadStatus::Loaded)
    }

    /// Apply one record to the in-memory state; false means the record
    /// failed verification.
    fn apply_record(
        &mut self,
        payload: &[u8],
        state: &mut State,
        total_entry_count: &mut usize,
        unique_entry_count: &mut usize,
        total_dep_record_count: &mut usize,
        unique_dep_record_count: &mut usize,
    ) -> bool {
        let mut r = RecordReader::new(payload);
        let tag = match r.u8() {
            Some(t) => t,
            None => return false,
        };
        match tag {
            TAG_BUILD => {
                let fields = (|| {
                    let command_hash = r.u64()?;
                    let start_time = r.i32()?;
                    let end_time = r.i32()?;
                    let mtime = r.i64()?;
                    let output = r.rest_str()?;
                    Some((command_hash, start_time, end_time, mtime, output))
                })();
                let (command_hash, start_time, end_time, mtime, output) = match fields {
                    Some(f) => f,
                    None => return false,
                };
                *total_entry_count += 1;
                if !self.entries.contains_key(output) {
                    *unique_entry_count += 1;
                }
                let entry = self
                    .entries
                    .entry(output.to_owned())
                    .or_insert_with(|| LogEntry {
                        output: output.to_owned(),
                        command_hash: 0,
                        start_time: 0,
                        end_time: 0,
                        mtime: 0,
                    });
                entry.command_hash = command_hash;
                entry.start_time = start_time;
                entry.end_time = end_time;
                entry.mtime = mtime;
                true
            }
            TAG_PATH => {
                let fields = (|| {
                    let checksum = r.u32()?;
                    let path = r.rest_str()?;
                    Some((checksum, path))
                })();
                let (checksum, path) = match fields {
                    Some(f) => f,
                    None => return false,
                };
                let id = self.nodes.len();
                // A checksum mismatch means another process wrote the file
                // concurrently; drop everything from here on.
                if !(id as u32) != checksum {
                    return false;
                }
                // The node either already exists with correct slash_bits, or
                // it is an implicit dep whose slashes don't affect commands.
                let node = state.node_id(path, 0);
                if state.node(node).log_id.is_some() {
                    return false;
                }
                state.node_mut(node).log_id = Some(id);
                self.nodes.push(node);
                true
            }
            TAG_DEPS => {
                let fields = (|| {
                    let out_id = r.i32()?;
                    let mtime = r.i64()?;
                    let count = r.u32()?;
                    let ids = r.take(count as usize * 4)?;
                    Some((out_id, mtime, count, ids))
                })();
                let (out_id, mtime, count, ids) = match fields {
                    Some(f) => f,
                    None => return false,
                };
                if out_id < 0 || out_id as usize >= self.nodes.len() {
                    return false;
                }
                let mut nodes = Vec::with_capacity(count as usize);
                for i in 0..count as usize {
                    let dep = u32::from_le_bytes(ids[i * 4..i * 4 + 4].try_into().unwrap());
                    match self.nodes.get(dep as usize) {
                        Some(&node) => nodes.push(node),
                        None => return false,
                    }
                }
                *total_dep_record_count += 1;
                if !self.update_deps(out_id as usize, Deps { mtime, nodes }) {
                    *unique_dep_record_count += 1;
                }
                true
            }
            // A second version record, or an unknown tag: not written by us.
            _ => false,
        }
    }

    /// Rewrite the log next to the original, dropping dead outputs and
    /// superseded records, then atomically rename it into place.
    pub fn recompact(
        &mut self,
        path: &Path,
        user: &dyn BuildLogUser,
        state: &mut State,
    ) -> anyhow::Result<()> {
        self.close();
        let temp_path = PathBuf::from(format!("{}.recompact", path.display()));

        // open_for_write appends; make sure we're not appending to a
        // leftover from a recompaction attempt that crashed.
        let _ = std::fs::remove_file(&temp_path);

        // Clear all known ids so the new log can reassign them densely.
        for &node in &self.nodes {
            state.node_mut(node).log_id = None;
        }

        let mut new_log = BuildLog::new();
        new_log.open_for_write(&temp_path, user, state)?;

        for (output, entry) in &self.entries {
            if user.is_path_dead(state, output) {
                continue;
            }
            new_log.record_command_entry(
                entry.output.clone(),
                entry.command_hash,
                entry.start_time,
                entry.end_time,
                entry.mtime,
            )?;
        }

        // Re-issue deps records for nodes whose deps are still reachable
        // from the manifest.
        for old_id in 0..self.deps.len() {
            let deps = match &self.deps[old_id] {
                Some(deps) => deps.clone(),
                None => continue, // a leaf, no deps of its own
            };
            let node = self.nodes[old_id];
            if !is_deps_entry_live(state, node) {
                continue;
            }
            new_log.record_deps(state, node, deps.mtime, &deps.nodes)?;
        }

        new_log.close();

        // Steal the new log's data.
        self.entries = new_log.entries;
        self.nodes = new_log.nodes;
        self.deps = new_log.deps;

        std::fs::rename(&temp_path, path)
            .map_err(|err| anyhow::anyhow!("rename recompacted log: {}", err))?;
        Ok(())
    }
}

/// Whether a node's deps entry is still reachable from the manifest: its
/// producing edge exists and asks for deps.  Entries for files that fell out
/// of the build get dropped at recompaction.
fn is_deps_entry_live(state: &State, node: NodeId) -> bool {
    match state.node(node).in_edge {
        Some(edge) => !state.edge_binding(edge, "deps").is_empty(),
        None => false,
    }
}

/// Read one size-prefixed record; advances `ofs` past it.  None at a clean
/// EOF or on a short/oversized record (ofs is left at the record start).
fn read_record<'a>(buf: &'a [u8], ofs: &mut usize) -> Option<&'a [u8]> {
    let start = *ofs;
    if start + 4 > buf.len() {
        return None;
    }
    let size = u32::from_le_bytes(buf[start..start + 4].try_into().unwrap()) as usize;
    if size > MAX_RECORD_SIZE || start + 4 + size > buf.len() {
        return None;
    }
    *ofs = start + 4 + size;
    Some(&buf[start + 4..start + 4 + size])
}
