//! The product-queue facade.
//!
//! Every public call takes the instance mutex, then the control-block
//! record lock (shared for readers, exclusive for writers), and works on
//! typed views of the control and index segments until it releases them.
//! Data regions are locked individually through the access layer.

mod insert;
mod sequence;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info};

use crate::access::{grow, AccessOptions, Mode, RegionAccess, Strategy};
use crate::config::{CreateOptions, QueueConfig};
use crate::control::{Control, Residence, CONTROL_LEN, MAX_WRITE_COUNT};
use crate::index::fblk::LevelRng;
use crate::index::{Index, IndexLayout};
use crate::layout::{page_size, Geometry};
use crate::lock::SignalGuard;
use crate::timestamp::{Clock, Timestamp};
use crate::{Error, Result};

pub use insert::Reservation;
pub use sequence::{ProductRef, SeqDelete, Step};

/// Offset half of an unset cursor.
pub const OFFSET_NONE: u64 = u64::MAX;

/// Iteration position: insertion time plus region offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub time: Timestamp,
    pub offset: u64,
}

impl Cursor {
    pub const NONE: Cursor = Cursor {
        time: Timestamp::NONE,
        offset: OFFSET_NONE,
    };

    pub fn is_none(&self) -> bool {
        self.time.is_none()
    }
}

/// Allocator and age statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    pub products: u64,
    pub free_regions: u64,
    pub empty_slots: u64,
    pub max_free_extent: u64,
    pub bytes: u64,
    pub max_products: u64,
    pub max_free_regions: u64,
    pub min_empty_slots: u64,
    pub max_bytes: u64,
    /// Seconds since the oldest product was inserted; 0 when empty.
    pub oldest_age: f64,
}

/// A shared product queue backed by one file.
pub struct ProductQueue {
    path: PathBuf,
    config: QueueConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    access: RegionAccess,
    geometry: Geometry,
    writable: bool,
    open: bool,
    clock: Arc<dyn Clock>,
    cursor: Cursor,
    rng: LevelRng,
    /// Smallest extent allocated through this instance.
    smallest_extent: u64,
    /// Last "future product" warning per origin host.
    future_warned: HashMap<String, Timestamp>,
}

/// Control block and index segment brought in by `ctl_get`.
struct ControlHold {
    ctl: *mut u8,
    ctl_len: usize,
    index: *mut u8,
    index_len: usize,
    _signals: Option<SignalGuard>,
}

impl ControlHold {
    fn control(&self) -> Control<&[u8]> {
        // SAFETY: both ranges stay held by the access layer until this
        // hold is passed to `ctl_rel`.
        Control::new(unsafe { std::slice::from_raw_parts(self.ctl, self.ctl_len) })
    }

    fn index(&self, layout: &IndexLayout) -> Index<&[u8]> {
        Index::new(
            unsafe { std::slice::from_raw_parts(self.index, self.index_len) },
            layout,
        )
    }

    fn parts_mut(&mut self, layout: &IndexLayout) -> (Control<&mut [u8]>, Index<&mut [u8]>) {
        let ctl = unsafe { std::slice::from_raw_parts_mut(self.ctl, self.ctl_len) };
        let index = unsafe { std::slice::from_raw_parts_mut(self.index, self.index_len) };
        (Control::new(ctl), Index::new_mut(index, layout))
    }
}

fn select_strategy(config: &QueueConfig, total_len: u64) -> Strategy {
    if config.no_map {
        Strategy::Buffered
    } else if config.map_regions || total_len > isize::MAX as u64 {
        Strategy::RegionMap
    } else {
        Strategy::WholeMap
    }
}

impl Inner {
    fn new(file: File, geometry: Geometry, config: &QueueConfig, writable: bool) -> Self {
        let access = RegionAccess::new(
            file,
            AccessOptions {
                strategy: select_strategy(config, geometry.total_len()),
                writable,
                private: config.private_map,
                locking: !config.no_lock,
                sparse: config.sparse,
                page_size: geometry.page_size,
                total_len: geometry.total_len(),
            },
        );
        Self {
            access,
            geometry,
            writable,
            open: true,
            clock: Arc::clone(&config.clock),
            cursor: Cursor::NONE,
            rng: LevelRng::seeded(),
            smallest_extent: u64::MAX,
            future_warned: HashMap::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Invalid("product-queue is closed"))
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::ReadOnly)
        }
    }

    /// Locks the control block and brings in the index segment. Writers
    /// also block asynchronous signals until `ctl_rel`.
    fn ctl_get(&mut self, write: bool) -> Result<ControlHold> {
        let signals = if write {
            Some(SignalGuard::block()?)
        } else {
            None
        };
        let mode = if write { Mode::WRITE } else { Mode::READ };
        let ctl_len = self.geometry.data_offset;
        let ctl = self.access.get(0, ctl_len, mode)?;
        let index = match self.access.get(
            self.geometry.index_offset,
            self.geometry.index_size,
            mode.unlocked(),
        ) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = self.access.release(0, false);
                return Err(err);
            }
        };
        Ok(ControlHold {
            ctl,
            ctl_len: ctl_len as usize,
            index,
            index_len: self.geometry.index_size as usize,
            _signals: signals,
        })
    }

    fn ctl_rel(&mut self, hold: ControlHold, modified: bool) -> Result<()> {
        let index = self.access.release(self.geometry.index_offset, modified);
        let ctl = self.access.release(0, modified);
        drop(hold);
        index.and(ctl)
    }

    /// Runs `op` under the control lock and releases it on every path.
    fn with_ctl<T>(
        &mut self,
        write: bool,
        op: impl FnOnce(&mut Self, &mut ControlHold) -> Result<T>,
    ) -> Result<T> {
        let mut hold = self.ctl_get(write)?;
        let result = op(self, &mut hold);
        let released = self.ctl_rel(hold, write);
        let value = result?;
        released?;
        Ok(value)
    }

    /// Validates the indexes and, for writers, registers in the write count.
    fn attach(&mut self) -> Result<()> {
        let writable = self.writable;
        let layout = self.geometry.index;
        self.with_ctl(writable, |_, hold| {
            if !hold.index(&layout).is_valid(&layout) {
                error!("index segment does not match control block");
                return Err(Error::Corrupt("index segment inconsistent"));
            }
            if !writable {
                return Ok(());
            }
            let (mut ctl, _) = hold.parts_mut(&layout);
            if !ctl.has_write_count() {
                ctl.init_write_count();
            }
            let count = ctl.write_count();
            if count >= MAX_WRITE_COUNT {
                return Err(Error::TooManyWriters);
            }
            ctl.set_write_count(count + 1);
            if !ctl.has_metrics() {
                ctl.init_metrics();
            }
            if !ctl.has_metrics_2() {
                ctl.init_metrics_2();
            }
            Ok(())
        })
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let released = self.access.release_all();
        if self.writable {
            let layout = self.geometry.index;
            self.with_ctl(true, |_, hold| {
                let (mut ctl, _) = hold.parts_mut(&layout);
                match ctl.write_count() {
                    0 => {
                        error!("write count prematurely 0");
                        Err(Error::Corrupt("write count already zero"))
                    }
                    count => {
                        ctl.set_write_count(count - 1);
                        Ok(())
                    }
                }
            })?;
        }
        released
    }

    fn read_metadata_view<T>(
        &mut self,
        op: impl FnOnce(&Control<&[u8]>, &Index<&[u8]>, Timestamp) -> T,
    ) -> Result<T> {
        let layout = self.geometry.index;
        let now = self.clock.now();
        self.with_ctl(false, |_, hold| {
            let ctl = hold.control();
            let index = hold.index(&layout);
            Ok(op(&ctl, &index, now))
        })
    }
}

/// Borrows `len` bytes of a held region.
///
/// SAFETY: `ptr` must come from the access layer and stay held for the
/// lifetime of the returned slice.
pub(crate) unsafe fn region<'a>(ptr: *mut u8, len: u64) -> &'a [u8] {
    std::slice::from_raw_parts(ptr, len as usize)
}

pub(crate) unsafe fn region_mut<'a>(ptr: *mut u8, len: u64) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(ptr, len as usize)
}

impl ProductQueue {
    /// Creates and initialises a queue file, then opens it for writing.
    pub fn create(
        path: impl AsRef<Path>,
        options: CreateOptions,
        config: QueueConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if config.read_only {
            return Err(Error::Invalid("cannot create a read-only queue"));
        }
        let geometry = Geometry::new(options.data_size, options.slots, options.align)?;
        let mut open = OpenOptions::new();
        open.read(true).write(true).mode(options.mode);
        if config.no_clobber {
            open.create_new(true);
        } else {
            open.create(true).truncate(true);
        }
        let file = open.open(&path)?;
        match Self::initialise(file, geometry, &config) {
            Ok(inner) => {
                info!(
                    "created product-queue {} ({} data bytes, {} slots)",
                    path.display(),
                    geometry.data_size,
                    geometry.slots
                );
                Ok(Self {
                    path,
                    config,
                    inner: Mutex::new(inner),
                })
            }
            Err(err) => {
                error!("initialising {} failed: {err}", path.display());
                let _ = std::fs::remove_file(&path);
                Err(err)
            }
        }
    }

    fn initialise(file: File, geometry: Geometry, config: &QueueConfig) -> Result<Inner> {
        grow(&file, geometry.total_len(), config.sparse)?;
        let mut inner = Inner::new(file, geometry, config, true);
        let layout = geometry.index;
        inner.with_ctl(true, |inner, hold| {
            let (mut ctl, mut index) = hold.parts_mut(&layout);
            index.init(
                &layout,
                &mut inner.rng,
                geometry.data_offset,
                geometry.initial_extent(),
            )?;
            // Magic last, once everything behind it is consistent.
            ctl.init(&geometry);
            Ok(())
        })?;
        Ok(inner)
    }

    /// Opens an existing queue.
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writable = !config.read_only;
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;

        let mut header = vec![0u8; CONTROL_LEN];
        if file.metadata()?.len() < CONTROL_LEN as u64 {
            return Err(Error::NotAQueue);
        }
        file.read_exact_at(&mut header, 0)?;
        let geometry = Control::new(&header[..]).geometry(page_size())?;
        let file_len = file.metadata()?.len();
        if file_len < geometry.total_len() {
            if !writable {
                return Err(Error::Corrupt("queue file shorter than its geometry"));
            }
            grow(&file, geometry.total_len(), config.sparse)?;
        }

        let mut inner = Inner::new(file, geometry, &config, writable);
        inner.attach()?;
        debug!(
            "opened product-queue {} with {:?} access",
            path.display(),
            inner.access.strategy()
        );
        Ok(Self {
            path,
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Releases held regions and, for writers, the write-count entry.
    pub fn close(self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.shutdown()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::Poisoned)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        inner.ensure_open()?;
        Ok(inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn page_size(&self) -> u64 {
        self.geometry().map_or_else(|_| page_size(), |geom| geom.page_size)
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Ok(self.lock()?.geometry)
    }

    pub fn data_size(&self) -> Result<u64> {
        Ok(self.lock()?.geometry.data_size)
    }

    pub fn slot_count(&self) -> Result<u64> {
        Ok(self.lock()?.geometry.slots)
    }

    pub fn strategy(&self) -> Result<Strategy> {
        Ok(self.lock()?.access.strategy())
    }

    /// Bytes of data segment ever used, and the most products ever held.
    pub fn highwater(&self) -> Result<(u64, u64)> {
        self.lock_open()?
            .read_metadata_view(|ctl, _, _| (ctl.highwater(), ctl.max_products()))
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.lock_open()?.read_metadata_view(|_, index, now| {
            let counters = index.regions.counters();
            let oldest_age = index
                .times
                .first(&index.blocks)
                .map_or(0.0, |entry| now.secs_since(entry.time));
            QueueStats {
                products: counters.in_use,
                free_regions: counters.free,
                empty_slots: counters.empty,
                max_free_extent: counters.max_free_extent,
                bytes: counters.bytes,
                max_products: counters.max_in_use,
                max_free_regions: counters.max_free,
                min_empty_slots: counters.min_empty,
                max_bytes: counters.max_bytes,
                oldest_age,
            }
        })
    }

    /// Whether a product has ever been evicted to make room.
    pub fn is_full(&self) -> Result<bool> {
        self.lock_open()?.read_metadata_view(|ctl, _, _| ctl.is_full())
    }

    /// Insertion time of the newest product, `Timestamp::NONE` if none.
    pub fn most_recent(&self) -> Result<Timestamp> {
        self.lock_open()?.read_metadata_view(|ctl, _, _| ctl.most_recent())
    }

    /// Insertion time of the oldest product, `Timestamp::NONE` if empty.
    pub fn oldest_cursor(&self) -> Result<Timestamp> {
        self.lock_open()?.read_metadata_view(|_, index, _| {
            index
                .times
                .first(&index.blocks)
                .map_or(Timestamp::NONE, |entry| entry.time)
        })
    }

    pub fn min_virtual_residence(&self) -> Result<Residence> {
        self.lock_open()?.read_metadata_view(|ctl, _, _| ctl.residence())
    }

    pub fn clear_min_virtual_residence(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.ensure_writable()?;
        let layout = inner.geometry.index;
        inner.with_ctl(true, |_, hold| {
            let (mut ctl, _) = hold.parts_mut(&layout);
            ctl.set_residence(Residence {
                time: Timestamp::NONE,
                bytes: -1,
                slots: 0,
            });
            Ok(())
        })
    }

    /// Logs the free list in extent order at debug level.
    pub fn fext_dump(&self) -> Result<()> {
        self.lock_open()?.read_metadata_view(|_, index, _| {
            let free = index.regions.free_extents(&index.blocks);
            debug!("{} free regions", free.len());
            for (offset, extent) in free {
                debug!("  extent {extent} at {offset}");
            }
        })
    }

    /// Walks the time index and checks each entry against the region list
    /// and the signature index. Returns the number of products.
    pub fn check(&self) -> Result<u64> {
        let mut inner = self.lock_open()?;
        let layout = inner.geometry.index;
        inner.with_ctl(false, |inner, hold| {
            let index = hold.index(&layout);
            let mut products = 0u64;
            let mut cursor = index.times.first(&index.blocks);
            while let Some(entry) = cursor {
                let Some(rix) = index.regions.find(entry.offset) else {
                    error!(
                        "time entry {} points at offset {} with no region",
                        entry.time, entry.offset
                    );
                    return Err(Error::Corrupt("time entry without region"));
                };
                let info = inner
                    .metadata_at(entry.offset, index.regions.extent(rix))
                    .map_err(|err| {
                        error!("product at offset {} unreadable: {err}", entry.offset);
                        Error::Corrupt("undecodable product metadata")
                    })?;
                if index.sigs.find(&info.signature) != Some(entry.offset) {
                    error!(
                        "signature {} of product at offset {} not indexed there",
                        info.signature, entry.offset
                    );
                    return Err(Error::Corrupt("signature index disagrees"));
                }
                products += 1;
                cursor = index.times.next(&index.blocks, &entry);
            }
            let in_use = index.regions.counters().in_use;
            let signatures = index.sigs.len();
            if in_use != products || signatures != products {
                error!(
                    "{products} time entries, {in_use} regions in use, {signatures} signatures"
                );
                return Err(Error::Corrupt("index counts disagree"));
            }
            Ok(products)
        })
    }

    /// Releases a region kept by `sequence_lock`.
    pub fn release(&self, offset: u64) -> Result<()> {
        let mut inner = self.lock_open()?;
        match inner.access.release(offset, false) {
            Ok(()) => Ok(()),
            Err(Error::NotFound) => Err(Error::NotFound),
            Err(Error::Io(err)) if err.raw_os_error() == Some(libc::EBADF) => {
                Err(Error::Invalid("queue file descriptor invalid"))
            }
            Err(err) => {
                error!("releasing region at {offset} failed: {err}");
                Err(Error::Corrupt("region release failed"))
            }
        }
    }

    /// Number of processes with the queue open for writing.
    pub fn write_count(path: impl AsRef<Path>) -> Result<u32> {
        let queue = Self::open(path, QueueConfig::read_only())?;
        let count = queue.lock_open()?.read_metadata_view(|ctl, _, _| {
            ctl.has_write_count().then(|| ctl.write_count())
        })?;
        queue.close()?;
        count.ok_or(Error::Invalid("queue predates write counting"))
    }

    /// Resets the write count after a writer crashed. Returns the count
    /// found before the reset.
    pub fn clear_write_count(path: impl AsRef<Path>) -> Result<u32> {
        let queue = Self::open(path, QueueConfig::default().quiet())?;
        let previous = {
            let mut inner = queue.lock_open()?;
            let layout = inner.geometry.index;
            inner.with_ctl(true, |_, hold| {
                let (mut ctl, _) = hold.parts_mut(&layout);
                // Our own registration is undone by close.
                let previous = ctl.write_count().saturating_sub(1);
                ctl.set_write_count(1);
                Ok(previous)
            })?
        };
        queue.close()?;
        Ok(previous)
    }
}

impl Drop for ProductQueue {
    fn drop(&mut self) {
        match self.inner.get_mut() {
            Ok(inner) => {
                if let Err(err) = inner.shutdown() {
                    error!("closing {} failed: {err}", self.path.display());
                }
            }
            Err(_) => error!("closing {} skipped: mutex poisoned", self.path.display()),
        }
    }
}
