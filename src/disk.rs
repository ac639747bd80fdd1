//! Filesystem access used by the build, behind a trait so the dirty scan and
//! builder can be exercised against an in-memory filesystem in tests.

use crate::graph::TimeStamp;
use std::io::ErrorKind;
use std::path::Path;

pub trait DiskInterface {
    /// stat() a path; 0 means absent.
    fn stat(&self, path: &str) -> anyhow::Result<TimeStamp>;
    /// Read a file; Ok(None) means not found, other errors propagate.
    fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;
    fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()>;
    /// Create one directory; succeeds if it already exists.
    fn make_dir(&self, path: &str) -> anyhow::Result<()>;
    /// Remove a file; Ok(false) means it was already missing.
    fn remove_file(&self, path: &str) -> anyhow::Result<bool>;

    /// Create the directories containing `path`, ancestors first.
    fn make_dirs(&self, path: &str) -> anyhow::Result<()> {
        let dir = match Path::new(path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => return Ok(()),
        };
        let dir_str = dir.to_str().unwrap_or_default();
        if self.stat(dir_str)? > 0 {
            return Ok(()); // Exists already; we're done.
        }
        self.make_dirs(dir_str)?;
        self.make_dir(dir_str)
    }
}

#[cfg(unix)]
fn mtime_of(meta: &std::fs::Metadata) -> TimeStamp {
    use std::os::unix::fs::MetadataExt;
    meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
}

#[cfg(not(unix))]
fn mtime_of(meta: &std::fs::Metadata) -> TimeStamp {
    match meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
    {
        Some(d) => d.as_nanos() as TimeStamp,
        None => 0,
    }
}

pub struct RealDiskInterface {}

impl DiskInterface for RealDiskInterface {
    fn stat(&self, path: &str) -> anyhow::Result<TimeStamp> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(mtime_of(&meta)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(anyhow::anyhow!("stat {}: {}", path, err)),
        }
    }

    fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow::anyhow!("read {}: {}", path, err)),
        }
    }

    fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()> {
        std::fs::write(path, contents).map_err(|err| anyhow::anyhow!("write {}: {}", path, err))
    }

    fn make_dir(&self, path: &str) -> anyhow::Result<()> {
        match std::fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(anyhow::anyhow!("mkdir {}: {}", path, err)),
        }
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow::anyhow!("remove {}: {}", path, err)),
        }
    }
}

/// In-memory filesystem for tests: files with explicit mtimes, no real I/O.
#[cfg(test)]
pub struct VirtualDisk {
    files: std::cell::RefCell<std::collections::HashMap<String, (TimeStamp, Vec<u8>)>>,
    now: std::cell::Cell<TimeStamp>,
}

#[cfg(test)]
impl VirtualDisk {
    pub fn new() -> Self {
        VirtualDisk {
            files: Default::default(),
            now: std::cell::Cell::new(1),
        }
    }

    /// Create a file with the next mtime tick.
    pub fn create(&self, path: &str, contents: &str) -> TimeStamp {
        let t = self.now.get();
        self.now.set(t + 1);
        self.files
            .borrow_mut()
            .insert(path.to_owned(), (t, contents.as_bytes().to_vec()));
        t
    }

    pub fn create_at(&self, path: &str, mtime: TimeStamp, contents: &str) {
        self.files
            .borrow_mut()
            .insert(path.to_owned(), (mtime, contents.as_bytes().to_vec()));
    }
}

#[cfg(test)]
impl DiskInterface for VirtualDisk {
    fn stat(&self, path: &str) -> anyhow::Result<TimeStamp> {
        Ok(self
            .files
            .borrow()
            .get(path)
            .map(|(mtime, _)| *mtime)
            .unwrap_or(0))
    }

    fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.files.borrow().get(path).map(|(_, data)| data.clone()))
    }

    fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()> {
        self.create(path, contents);
        Ok(())
    }

    fn make_dir(&self, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.files.borrow_mut().remove(path).is_some())
    }
}
