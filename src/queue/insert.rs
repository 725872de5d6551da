//! Allocation, eviction and the insert paths.

use log::{debug, error, info, warn};

use super::{region, region_mut, ControlHold, Inner, ProductQueue};
use crate::access::Mode;
use crate::control::{Control, Residence};
use crate::index::fblk::LevelRng;
use crate::index::{Index, TimeEntry};
use crate::layout::round_up;
use crate::product::{Product, ProductInfo, Signature};
use crate::timestamp::{Direction, Timestamp};
use crate::wait::notify_waiters;
use crate::{Error, Result};

/// A free region is split only if the tail could hold another product
/// of the smallest size seen plus this much.
const SPLIT_SLACK: u64 = 64;

/// Future products are reported at most this often per origin host.
const FUTURE_WARN_SECS: f64 = 3600.0;

/// Tolerated lead of a product's creation time over the local clock.
const FUTURE_TOLERANCE_SECS: i64 = 30;

type IndexMut<'a> = Index<&'a mut [u8]>;
type ControlMut<'a> = Control<&'a mut [u8]>;

pub(super) struct Allocation {
    pub offset: u64,
    pub extent: u64,
    pub ptr: *mut u8,
}

/// A region reserved for a product being written in place.
///
/// Dropping an unfinalized reservation discards it.
pub struct Reservation<'q> {
    queue: &'q ProductQueue,
    offset: u64,
    extent: u64,
    signature: Signature,
    payload_at: usize,
    ptr: *mut u8,
    done: bool,
}

impl Reservation<'_> {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// The whole region, metadata included.
    pub fn region_mut(&mut self) -> &mut [u8] {
        // SAFETY: the region stays held by this process until the
        // reservation is finalized or discarded.
        unsafe { region_mut(self.ptr, self.extent) }
    }

    /// The bytes after the metadata written by `reserve`.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let at = self.payload_at;
        &mut self.region_mut()[at..]
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Err(err) = self.queue.discard_region(self.offset, &self.signature) {
            error!("discarding reservation at {} failed: {err}", self.offset);
        }
    }
}

/// Removes a product's index entries. The caller holds its region.
fn unlink_product(
    index: &mut IndexMut<'_>,
    rng: &mut LevelRng,
    entry: &TimeEntry,
    rix: usize,
    signature: &Signature,
) -> Result<()> {
    if index.sigs.find_delete(signature).is_none() {
        error!("signature {signature} at offset {} not indexed", entry.offset);
        return Err(Error::Corrupt("signature missing from index"));
    }
    index.times.delete(&mut index.blocks, entry)?;
    index.regions.free(&mut index.blocks, rng, rix)
}

impl Inner {
    /// Claims a region for `size` bytes under `signature` and holds it for
    /// writing. Evicts the oldest unlocked products as needed.
    pub(super) fn allocate(
        &mut self,
        ctl: &mut ControlMut<'_>,
        index: &mut IndexMut<'_>,
        size: u64,
        signature: &Signature,
    ) -> Result<Allocation> {
        if index.sigs.find(signature).is_some() {
            debug!("duplicate product {signature}");
            return Err(Error::Duplicate);
        }
        if index.regions.counters().empty == 0 {
            self.make_slot(ctl, index)?;
        }
        let extent = round_up(size, self.geometry.align);
        self.smallest_extent = self.smallest_extent.min(extent);

        let rix = match index.regions.get(&mut index.blocks, extent)? {
            Some(rix) => rix,
            None => self.make_space(ctl, index, extent)?,
        };
        if extent + self.smallest_extent + SPLIT_SLACK < index.regions.extent(rix) {
            if let Err(err) = index
                .regions
                .split(&mut index.blocks, &mut self.rng, rix, extent)
            {
                index.regions.put(&mut index.blocks, &mut self.rng, rix)?;
                return Err(err);
            }
        }

        let offset = index.regions.offset(rix);
        let extent = index.regions.extent(rix);
        index.regions.mark(rix);
        let ptr = match self.access.get(offset, extent, Mode::WRITE) {
            Ok(ptr) => ptr,
            Err(err) => {
                index.regions.unmark(rix);
                index.regions.put(&mut index.blocks, &mut self.rng, rix)?;
                return Err(err);
            }
        };
        if let Err(err) = index.sigs.add(signature, offset) {
            let _ = self.access.release(offset, false);
            index.regions.unmark(rix);
            index.regions.put(&mut index.blocks, &mut self.rng, rix)?;
            return Err(err);
        }

        let highwater = offset + extent - self.geometry.data_offset;
        if highwater > ctl.highwater() {
            ctl.set_highwater(highwater);
        }
        let in_use = index.regions.in_use();
        if in_use > ctl.max_products() {
            ctl.set_max_products(in_use);
        }
        Ok(Allocation {
            offset,
            extent,
            ptr,
        })
    }

    fn make_slot(&mut self, ctl: &mut ControlMut<'_>, index: &mut IndexMut<'_>) -> Result<()> {
        loop {
            if index.regions.in_use() == 0 {
                return Err(Error::Exhausted);
            }
            self.delete_oldest_locked(ctl, index)?;
            if index.regions.counters().empty > 0 {
                return Ok(());
            }
        }
    }

    fn make_space(
        &mut self,
        ctl: &mut ControlMut<'_>,
        index: &mut IndexMut<'_>,
        extent: u64,
    ) -> Result<usize> {
        loop {
            if index.regions.in_use() == 0 {
                return Err(Error::Exhausted);
            }
            self.delete_oldest_locked(ctl, index)?;
            if let Some(rix) = index.regions.get(&mut index.blocks, extent)? {
                return Ok(rix);
            }
        }
    }

    /// Deletes the oldest product whose region no one has locked.
    pub(super) fn delete_oldest_locked(
        &mut self,
        ctl: &mut ControlMut<'_>,
        index: &mut IndexMut<'_>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut cursor = index.times.first(&index.blocks);
        while let Some(entry) = cursor {
            let Some(rix) = index.regions.find(entry.offset) else {
                break;
            };
            match self.try_delete(index, &entry, rix) {
                Ok(info) => {
                    ctl.set_full(true);
                    self.record_residence(ctl, index, entry.time, &info, now);
                    return Ok(());
                }
                Err(Error::Locked) | Err(Error::AlreadyReserved) => {
                    debug!("product at {} is locked; trying the next oldest", entry.offset);
                    cursor = index.times.next(&index.blocks, &entry);
                }
                Err(err) => return Err(err),
            }
        }
        error!("no unlocked products left to delete!");
        Err(Error::Locked)
    }

    /// Deletes one product if its region can be write-locked without
    /// waiting.
    pub(super) fn try_delete(
        &mut self,
        index: &mut IndexMut<'_>,
        entry: &TimeEntry,
        rix: usize,
    ) -> Result<ProductInfo> {
        let offset = index.regions.offset(rix);
        if offset != entry.offset {
            error!("time entry offset {} but region offset {offset}", entry.offset);
            return Err(Error::Corrupt("time and region offsets disagree"));
        }
        let extent = index.regions.extent(rix);
        let ptr = self.access.get(offset, extent, Mode::WRITE_NOWAIT)?;
        // SAFETY: held until the release below.
        let result = match ProductInfo::decode(unsafe { region(ptr, extent) }) {
            Ok(info) => unlink_product(index, &mut self.rng, entry, rix, &info.signature)
                .map(|()| info),
            Err(_) => {
                error!("undecodable product metadata at offset {offset}");
                Err(Error::Corrupt("undecodable product metadata"))
            }
        };
        if let Err(err) = self.access.release(offset, false) {
            error!("releasing deleted region at {offset}: {err}");
        }
        result
    }

    /// Lowers the minimum virtual residence time if this eviction beat it.
    fn record_residence(
        &self,
        ctl: &mut ControlMut<'_>,
        index: &IndexMut<'_>,
        inserted: Timestamp,
        info: &ProductInfo,
        now: Timestamp,
    ) {
        let created = inserted.min(info.arrival);
        if created >= now {
            return;
        }
        let residence = Timestamp::from_micros(now.as_micros() - created.as_micros());
        let current = ctl.residence();
        if current.time.is_none() || residence < current.time {
            let counters = index.regions.counters();
            ctl.set_residence(Residence {
                time: residence,
                bytes: counters.bytes as i64,
                slots: counters.in_use,
            });
            info!(
                "minimum virtual residence time {residence} s at {} bytes, {} products",
                counters.bytes, counters.in_use
            );
        }
    }

    /// Warns, at most hourly per origin, about products created in the
    /// future.
    fn vet_creation_time(&mut self, info: &ProductInfo, now: Timestamp) {
        if info.arrival <= now.add_secs(FUTURE_TOLERANCE_SECS) {
            return;
        }
        let origin = info
            .origin
            .split_once("_v_")
            .map_or(info.origin.as_str(), |(host, _)| host);
        let due = self
            .future_warned
            .get(origin)
            .map_or(true, |last| now.secs_since(*last) >= FUTURE_WARN_SECS);
        if due {
            warn!(
                "Future product from \"{origin}\" ({} s ahead). Fix local or ingest clock.",
                info.arrival.secs_since(now) as i64
            );
            self.future_warned.insert(origin.to_string(), now);
        }
    }

    /// Drops the entries of a region allocated but never indexed by time.
    fn abandon(&mut self, index: &mut IndexMut<'_>, offset: u64, signature: &Signature) {
        index.sigs.find_delete(signature);
        let _ = self.access.release(offset, false);
        if let Some(rix) = index.regions.find(offset) {
            if let Err(err) = index.regions.free(&mut index.blocks, &mut self.rng, rix) {
                error!("freeing abandoned region at {offset}: {err}");
            }
        }
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.geometry.data_size {
            return Err(Error::TooBig {
                size,
                capacity: self.geometry.data_size,
            });
        }
        Ok(())
    }

    fn insert(&mut self, product: &Product) -> Result<()> {
        self.ensure_writable()?;
        product.info.validate()?;
        if product.data.len() != product.info.size as usize {
            return Err(Error::Invalid("declared size differs from payload length"));
        }
        let size = product.encoded_len() as u64;
        self.check_size(size)?;
        let layout = self.geometry.index;
        self.with_ctl(true, |inner, hold| {
            let (mut ctl, mut index) = hold.parts_mut(&layout);
            let alloc = inner.allocate(&mut ctl, &mut index, size, &product.info.signature)?;
            // SAFETY: held for writing by `allocate`.
            let buf = unsafe { region_mut(alloc.ptr, alloc.extent) };
            let now = inner.clock.now();
            let stored = product.encode_into(buf).and_then(|_| {
                index
                    .times
                    .add(&mut index.blocks, &mut inner.rng, alloc.offset, now)
            });
            match stored {
                Ok(key) => {
                    ctl.set_most_recent(key);
                    inner.vet_creation_time(&product.info, now);
                    inner.access.release(alloc.offset, true)
                }
                Err(err) => {
                    inner.abandon(&mut index, alloc.offset, &product.info.signature);
                    Err(err)
                }
            }
        })
    }

    fn reserve(
        &mut self,
        size: u64,
        signature: &Signature,
        info: Option<&ProductInfo>,
    ) -> Result<Allocation> {
        self.ensure_writable()?;
        if let Some(info) = info {
            info.validate()?;
        }
        self.check_size(size)?;
        let layout = self.geometry.index;
        self.with_ctl(true, |inner, hold| {
            let (mut ctl, mut index) = hold.parts_mut(&layout);
            let alloc = inner.allocate(&mut ctl, &mut index, size, signature)?;
            if let Some(info) = info {
                // SAFETY: held for writing by `allocate`.
                let buf = unsafe { region_mut(alloc.ptr, alloc.extent) };
                if let Err(err) = info.encode_into(buf) {
                    inner.abandon(&mut index, alloc.offset, signature);
                    return Err(err);
                }
            }
            Ok(alloc)
        })
    }

    /// Indexes a written reservation by insertion time.
    fn commit(&mut self, hold: &mut ControlHold, offset: u64, info: &ProductInfo) -> Result<()> {
        let layout = self.geometry.index;
        let (mut ctl, mut index) = hold.parts_mut(&layout);
        let now = self.clock.now();
        match index.times.add(&mut index.blocks, &mut self.rng, offset, now) {
            Ok(key) => {
                ctl.set_most_recent(key);
                self.vet_creation_time(info, now);
                Ok(())
            }
            Err(err) => {
                self.abandon(&mut index, offset, &info.signature);
                Err(err)
            }
        }
    }

    /// Reads the metadata of the product at `offset`.
    pub(super) fn metadata_at(&mut self, offset: u64, extent: u64) -> Result<ProductInfo> {
        if let Some((ptr, held)) = self.access.held(offset) {
            // SAFETY: held by this process.
            return ProductInfo::decode(unsafe { region(ptr, held) });
        }
        let ptr = self.access.get(offset, extent, Mode::READ.unlocked())?;
        // SAFETY: held until the release below.
        let info = ProductInfo::decode(unsafe { region(ptr, extent) });
        self.access.release(offset, false)?;
        info
    }

    /// Finds the time entry for the product at `offset`, searching from
    /// shortly before its creation time and wrapping once.
    pub(super) fn time_entry_at(
        &mut self,
        index: &Index<&[u8]>,
        offset: u64,
        extent: u64,
    ) -> Result<TimeEntry> {
        let info = self.metadata_at(offset, extent)?;
        let search = info.arrival.sub_secs(FUTURE_TOLERANCE_SECS);
        let times = &index.times;
        let start = times
            .find(&index.blocks, search, Direction::Backward)
            .or_else(|| times.find(&index.blocks, search, Direction::Exact))
            .or_else(|| times.find(&index.blocks, search, Direction::Forward))
            .or_else(|| times.first(&index.blocks))
            .ok_or(Error::NotFound)?;
        let mut cursor = Some(start);
        while let Some(entry) = cursor {
            if entry.offset == offset {
                return Ok(entry);
            }
            cursor = times.next(&index.blocks, &entry);
        }
        let mut cursor = times.first(&index.blocks);
        while let Some(entry) = cursor {
            if entry.index == start.index {
                break;
            }
            if entry.offset == offset {
                return Ok(entry);
            }
            cursor = times.next(&index.blocks, &entry);
        }
        Err(Error::NotFound)
    }

    fn free_reserved(&mut self, offset: u64, signature: &Signature) -> Result<()> {
        let _ = self.access.release(offset, false);
        let layout = self.geometry.index;
        self.with_ctl(true, |inner, hold| {
            let (_, mut index) = hold.parts_mut(&layout);
            let rix = index
                .regions
                .find(offset)
                .ok_or(Error::Invalid("no allocated region at offset"))?;
            if index.sigs.find_delete(signature).is_none() {
                return Err(Error::Invalid("reservation signature not indexed"));
            }
            index.regions.free(&mut index.blocks, &mut inner.rng, rix)
        })
    }
}

impl ProductQueue {
    /// Inserts a copy of `product`, evicting the oldest unlocked products
    /// if space is short.
    pub fn insert(&self, product: &Product) -> Result<()> {
        self.insert_notify(product, self.config.notify_on_insert)
    }

    /// Inserts without signalling waiting readers.
    pub fn insert_quiet(&self, product: &Product) -> Result<()> {
        self.insert_notify(product, false)
    }

    fn insert_notify(&self, product: &Product, notify: bool) -> Result<()> {
        self.lock_open()?.insert(product)?;
        if notify {
            notify_waiters();
        }
        Ok(())
    }

    /// Reserves space for a product of `info.size` payload bytes and
    /// writes its metadata. Fill `payload_mut` then `finalize`. An empty
    /// payload is allowed; the metadata alone occupies the region.
    pub fn reserve(&self, info: &ProductInfo) -> Result<Reservation<'_>> {
        let size = info.encoded_len() as u64;
        let alloc = self.lock_open()?.reserve(size, &info.signature, Some(info))?;
        Ok(self.reservation(alloc, info.signature, info.metadata_len()))
    }

    /// Reserves `size` raw bytes. The caller writes the full encoded
    /// product, metadata included, so `size` must be positive; zero fails
    /// with `Invalid`.
    pub fn reserve_raw(&self, size: usize, signature: Signature) -> Result<Reservation<'_>> {
        if size == 0 {
            return Err(Error::Invalid("empty product"));
        }
        let alloc = self.lock_open()?.reserve(size as u64, &signature, None)?;
        Ok(self.reservation(alloc, signature, 0))
    }

    fn reservation(
        &self,
        alloc: Allocation,
        signature: Signature,
        payload_at: usize,
    ) -> Reservation<'_> {
        Reservation {
            queue: self,
            offset: alloc.offset,
            extent: alloc.extent,
            signature,
            payload_at,
            ptr: alloc.ptr,
            done: false,
        }
    }

    fn claim(&self, reservation: &mut Reservation<'_>) -> Result<()> {
        if !std::ptr::eq(reservation.queue, self) {
            return Err(Error::Invalid("reservation belongs to another queue"));
        }
        reservation.done = true;
        Ok(())
    }

    /// Publishes a reservation: validates what was written, writes it
    /// back and indexes it by insertion time.
    pub fn finalize(&self, mut reservation: Reservation<'_>) -> Result<()> {
        self.claim(&mut reservation)?;
        let offset = reservation.offset;
        let signature = reservation.signature;
        {
            let mut inner = self.lock_open()?;
            let (ptr, extent) = inner.access.held(offset).ok_or(Error::NotFound)?;
            // SAFETY: held since `reserve`.
            let info = match ProductInfo::decode(unsafe { region(ptr, extent) }) {
                Ok(info) if info.encoded_len() as u64 <= extent => info,
                Ok(info) => {
                    inner.free_reserved(offset, &signature)?;
                    return Err(Error::TooBig {
                        size: info.encoded_len() as u64,
                        capacity: extent,
                    });
                }
                Err(_) => {
                    inner.free_reserved(offset, &signature)?;
                    return Err(Error::Corrupt("reserved product metadata undecodable"));
                }
            };
            inner.access.release(offset, true)?;
            inner.with_ctl(true, |inner, hold| inner.commit(hold, offset, &info))?;
        }
        if self.config.notify_on_insert {
            notify_waiters();
        }
        Ok(())
    }

    /// Like `finalize`, but first replaces the reservation's signature.
    /// Fails with `Duplicate`, freeing the region, if the new signature
    /// is already queued.
    pub fn finalize_with_signature(
        &self,
        mut reservation: Reservation<'_>,
        signature: Signature,
    ) -> Result<()> {
        self.claim(&mut reservation)?;
        let offset = reservation.offset;
        let provisional = reservation.signature;
        {
            let mut inner = self.lock_open()?;
            let (ptr, extent) = inner.access.held(offset).ok_or(Error::NotFound)?;
            // SAFETY: held since `reserve`.
            let buf = unsafe { region_mut(ptr, extent) };
            buf[crate::product::SIGNATURE_RANGE].copy_from_slice(&signature.0);
            let info = match ProductInfo::decode(buf) {
                Ok(info) => info,
                Err(_) => {
                    inner.free_reserved(offset, &provisional)?;
                    return Err(Error::Corrupt("reserved product metadata undecodable"));
                }
            };
            inner.access.release(offset, true)?;
            let layout = inner.geometry.index;
            inner.with_ctl(true, |inner, hold| {
                {
                    let (_, mut index) = hold.parts_mut(&layout);
                    if signature != provisional {
                        if index.sigs.find(&signature).is_some() {
                            if let Some(rix) = index.regions.find(offset) {
                                index.sigs.find_delete(&provisional);
                                index.regions.free(&mut index.blocks, &mut inner.rng, rix)?;
                            }
                            return Err(Error::Duplicate);
                        }
                        if index.sigs.find_delete(&provisional).is_none() {
                            error!("provisional signature {provisional} not indexed");
                        }
                        index.sigs.add(&signature, offset)?;
                    }
                }
                inner.commit(hold, offset, &info)
            })?;
        }
        if self.config.notify_on_insert {
            notify_waiters();
        }
        Ok(())
    }

    /// Frees a reservation without publishing it.
    pub fn discard(&self, mut reservation: Reservation<'_>) -> Result<()> {
        self.claim(&mut reservation)?;
        self.discard_region(reservation.offset, &reservation.signature)
    }

    fn discard_region(&self, offset: u64, signature: &Signature) -> Result<()> {
        self.lock_open()?.free_reserved(offset, signature)
    }

    /// Deletes the product with `signature` unless someone holds it.
    pub fn delete_by_signature(&self, signature: &Signature) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.ensure_writable()?;
        let layout = inner.geometry.index;
        inner.with_ctl(true, |inner, hold| {
            let (offset, rix, extent) = {
                let index = hold.index(&layout);
                let offset = index.sigs.find(signature).ok_or(Error::NotFound)?;
                let rix = index
                    .regions
                    .find(offset)
                    .ok_or(Error::Corrupt("signature indexes a free region"))?;
                (offset, rix, index.regions.extent(rix))
            };
            let entry = match inner.time_entry_at(&hold.index(&layout), offset, extent) {
                Ok(entry) => entry,
                Err(Error::NotFound) => {
                    error!("product {signature} at offset {offset} has no time-index entry");
                    return Err(Error::Corrupt("signature has no time entry"));
                }
                Err(err) => return Err(err),
            };
            let (_, mut index) = hold.parts_mut(&layout);
            match inner.try_delete(&mut index, &entry, rix) {
                Ok(info) => {
                    debug!("deleted {} ({signature})", info.ident);
                    Ok(())
                }
                Err(Error::AlreadyReserved) => Err(Error::Locked),
                Err(err) => Err(err),
            }
        })
    }

    /// Evicts the oldest product that no one holds.
    pub fn delete_oldest(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.ensure_writable()?;
        let layout = inner.geometry.index;
        inner.with_ctl(true, |inner, hold| {
            let (mut ctl, mut index) = hold.parts_mut(&layout);
            if index.times.len() == 0 {
                return Err(Error::NotFound);
            }
            inner.delete_oldest_locked(&mut ctl, &mut index)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreateOptions, QueueConfig};

    fn queue_with_one(dir: &tempfile::TempDir) -> (ProductQueue, Product) {
        let queue = ProductQueue::create(
            dir.path().join("unlinked.pq"),
            CreateOptions::new(16 * 1024, 16),
            QueueConfig::default().quiet(),
        )
        .expect("create");
        let product = Product::from_payload("orphan", 1, 0, vec![5u8; 200]);
        queue.insert(&product).expect("insert");
        (queue, product)
    }

    fn drop_time_entry(queue: &ProductQueue) {
        let mut inner = queue.lock().expect("lock");
        let layout = inner.geometry.index;
        inner
            .with_ctl(true, |_, hold| {
                let (_, mut index) = hold.parts_mut(&layout);
                let entry = index.times.first(&index.blocks).expect("time entry");
                index.times.delete(&mut index.blocks, &entry)
            })
            .expect("unlink time entry");
    }

    #[test]
    fn delete_by_signature_without_time_entry_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (queue, product) = queue_with_one(&dir);
        assert_eq!(queue.check().expect("check"), 1);
        drop_time_entry(&queue);

        assert!(matches!(
            queue.delete_by_signature(&product.info.signature),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(queue.check(), Err(Error::Corrupt(_))));
        assert!(matches!(
            queue.delete_by_signature(&Signature([0x42; 16])),
            Err(Error::NotFound)
        ));
    }
}
