//! Moving byte ranges of the queue file in and out of process memory.
//!
//! Three strategies share one entry pair, `get` and `release`:
//! positioned reads into a heap buffer, a page-rounded mapping per region,
//! or pointer arithmetic into one mapping of the whole file. Every `get`
//! first records the range in the in-use table and takes the record lock,
//! so bookkeeping is identical across strategies.

mod inuse;

use std::fs::File;
use std::os::unix::fs::FileExt;

use log::{debug, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::layout::round_up;
use crate::lock::{lock_range, unlock_range};
use crate::{Error, Result};

use inuse::InUse;

/// How a range is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mode {
    pub write: bool,
    pub wait: bool,
    pub lock: bool,
}

impl Mode {
    pub const READ: Mode = Mode {
        write: false,
        wait: true,
        lock: true,
    };
    pub const WRITE: Mode = Mode {
        write: true,
        wait: true,
        lock: true,
    };
    pub const WRITE_NOWAIT: Mode = Mode {
        write: true,
        wait: false,
        lock: true,
    };

    pub const fn unlocked(self) -> Mode {
        Mode {
            write: self.write,
            wait: self.wait,
            lock: false,
        }
    }
}

/// Memory-access strategy of an open queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `pread`/`pwrite` through a heap buffer.
    Buffered,
    /// One mapping per accessed region.
    RegionMap,
    /// One mapping of the whole file.
    WholeMap,
}

enum Mapping {
    Write(MmapMut),
    Read(Mmap),
}

impl Mapping {
    fn ptr(&mut self) -> *mut u8 {
        match self {
            Mapping::Write(map) => map.as_mut_ptr(),
            // Read-only mappings are never written through.
            Mapping::Read(map) => map.as_ptr() as *mut u8,
        }
    }

    fn len(&self) -> usize {
        match self {
            Mapping::Write(map) => map.len(),
            Mapping::Read(map) => map.len(),
        }
    }
}

enum Backing {
    Buffer(Vec<u8>),
    Region(Mapping),
    Whole,
}

struct Held {
    mode: Mode,
    ptr: *mut u8,
    backing: Backing,
}

pub(crate) struct RegionAccess {
    file: File,
    strategy: Strategy,
    writable: bool,
    private: bool,
    locking: bool,
    sparse: bool,
    page_size: u64,
    total_len: u64,
    whole: Option<Mapping>,
    held: InUse<Held>,
}

// SAFETY: the raw pointers in `held` point into buffers and mappings owned
// by this value; it is only used behind the queue mutex.
unsafe impl Send for RegionAccess {}

pub(crate) struct AccessOptions {
    pub strategy: Strategy,
    pub writable: bool,
    pub private: bool,
    pub locking: bool,
    pub sparse: bool,
    pub page_size: u64,
    pub total_len: u64,
}

impl RegionAccess {
    pub fn new(file: File, options: AccessOptions) -> Self {
        Self {
            file,
            strategy: options.strategy,
            writable: options.writable,
            private: options.private,
            locking: options.locking,
            sparse: options.sparse,
            page_size: options.page_size,
            total_len: options.total_len,
            whole: None,
            held: InUse::default(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[cfg(test)]
    pub fn is_held(&self, offset: u64) -> bool {
        self.held.contains(offset)
    }

    /// Pointer and extent of a held range.
    pub fn held(&self, offset: u64) -> Option<(*mut u8, u64)> {
        self.held
            .get(offset)
            .map(|entry| (entry.value.ptr, entry.extent))
    }

    #[cfg(test)]
    pub fn held_offsets(&self) -> Vec<u64> {
        self.held.offsets()
    }

    /// Brings `[offset, offset + extent)` into memory.
    pub fn get(&mut self, offset: u64, extent: u64, mode: Mode) -> Result<*mut u8> {
        if self.held.contains(offset) {
            return Err(Error::AlreadyReserved);
        }
        if mode.write && !self.writable {
            return Err(Error::ReadOnly);
        }
        let locked = self.locking && mode.lock;
        if locked {
            lock_range(&self.file, offset, extent, mode.write, mode.wait)?;
        }
        match self.bring_in(offset, extent) {
            Ok((ptr, backing)) => {
                self.held
                    .insert(offset, extent, Held { mode, ptr, backing })?;
                Ok(ptr)
            }
            Err(err) => {
                if locked {
                    let _ = unlock_range(&self.file, offset, extent);
                }
                Err(err)
            }
        }
    }

    /// Commits a held range; `modified` buffered ranges are written back.
    pub fn release(&mut self, offset: u64, modified: bool) -> Result<()> {
        let entry = self.held.remove(offset).ok_or(Error::NotFound)?;
        let mut result = Ok(());
        if let Backing::Buffer(buf) = &entry.value.backing {
            if modified && entry.value.mode.write {
                result = self.file.write_all_at(buf, offset).map_err(Error::from);
            }
        }
        drop(entry.value.backing);
        if self.locking && entry.value.mode.lock {
            unlock_range(&self.file, offset, entry.extent)?;
        }
        result
    }

    /// Releases every held range without writing buffers back.
    pub fn release_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for offset in self.held.offsets() {
            if let Err(err) = self.release(offset, false) {
                result = Err(err);
            }
        }
        result
    }

    fn bring_in(&mut self, offset: u64, extent: u64) -> Result<(*mut u8, Backing)> {
        loop {
            let attempt = match self.strategy {
                Strategy::Buffered => return self.read_buffer(offset, extent),
                Strategy::RegionMap => self.map_region(offset, extent),
                Strategy::WholeMap => self.map_whole(offset, extent),
            };
            match attempt {
                Err(Error::Io(err)) if err.raw_os_error() == Some(libc::EIO) => {
                    warn!("mapping failed with EIO; switching to buffered access");
                    self.strategy = Strategy::Buffered;
                }
                other => return other,
            }
        }
    }

    fn read_buffer(&mut self, offset: u64, extent: u64) -> Result<(*mut u8, Backing)> {
        let mut buf = vec![0u8; extent as usize];
        let mut done = 0usize;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
        let ptr = buf.as_mut_ptr();
        Ok((ptr, Backing::Buffer(buf)))
    }

    fn map(&self, offset: u64, len: usize) -> std::io::Result<Mapping> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len);
        // SAFETY: the file stays open for the mapping's lifetime and
        // concurrent modification is coordinated through record locks.
        unsafe {
            if !self.writable {
                options.map(&self.file).map(Mapping::Read)
            } else if self.private {
                options.map_copy(&self.file).map(Mapping::Write)
            } else {
                options.map_mut(&self.file).map(Mapping::Write)
            }
        }
    }

    fn map_region(&mut self, offset: u64, extent: u64) -> Result<(*mut u8, Backing)> {
        let start = offset - offset % self.page_size;
        let delta = (offset - start) as usize;
        let len = round_up(delta as u64 + extent, self.page_size);
        if self.writable {
            self.ensure_len(start + len)?;
        }
        let mut mapping = self.map(start, len as usize)?;
        debug!("mapped region [{start}, +{len}) for offset {offset}");
        let ptr = unsafe { mapping.ptr().add(delta) };
        Ok((ptr, Backing::Region(mapping)))
    }

    fn map_whole(&mut self, offset: u64, extent: u64) -> Result<(*mut u8, Backing)> {
        let end = offset + extent;
        if self.whole.as_ref().map_or(true, |map| (map.len() as u64) < end) {
            if self.writable {
                self.ensure_len(self.total_len.max(end))?;
            }
            let len = self.total_len.max(self.file.metadata()?.len()).max(end);
            if self.held_whole() {
                return Err(Error::Corrupt("whole-file mapping too short"));
            }
            self.whole = Some(self.map(0, len as usize)?);
        }
        let whole = self
            .whole
            .as_mut()
            .ok_or(Error::Corrupt("whole-file mapping missing"))?;
        let ptr = unsafe { whole.ptr().add(offset as usize) };
        Ok((ptr, Backing::Whole))
    }

    fn held_whole(&self) -> bool {
        self.held
            .iter()
            .any(|entry| matches!(entry.value.backing, Backing::Whole))
    }

    /// Extends the file to `len` bytes.
    pub fn ensure_len(&self, len: u64) -> Result<()> {
        grow(&self.file, len, self.sparse)
    }
}

/// Grows `file` to `len` bytes: sparse via `set_len`, otherwise by writing
/// zeros so the blocks are allocated up front.
pub(crate) fn grow(file: &File, len: u64, sparse: bool) -> Result<()> {
    let current = file.metadata()?.len();
    if current >= len {
        return Ok(());
    }
    if sparse {
        file.set_len(len)?;
        return Ok(());
    }
    let zeros = vec![0u8; 1 << 16];
    let mut at = current;
    while at < len {
        let chunk = ((len - at) as usize).min(zeros.len());
        file.write_all_at(&zeros[..chunk], at)?;
        at += chunk as u64;
    }
    Ok(())
}
