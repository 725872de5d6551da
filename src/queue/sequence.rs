//! Cursor-driven iteration in insertion-time order.

use std::time::Duration;

use log::{debug, error, log_enabled, Level};

use super::{region, Cursor, Inner, ProductQueue, OFFSET_NONE};
use crate::access::Mode;
use crate::class::ProductClass;
use crate::product::{decode, pad4, ProductInfo, Signature};
use crate::timestamp::{Direction, Timestamp};
use crate::{Error, Result};

/// A product as seen by a sequencing callback. Borrowed from the queue
/// for the duration of the call.
#[derive(Debug)]
pub struct ProductRef<'a> {
    pub info: ProductInfo,
    pub data: &'a [u8],
    /// Metadata and padded payload exactly as stored.
    pub encoded: &'a [u8],
    pub offset: u64,
    /// Insertion time.
    pub inserted: Timestamp,
}

/// Outcome of one sequencing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The product matched and the callback accepted it.
    Delivered,
    /// The product matched but the callback declined it; the cursor
    /// stays so the product is offered again.
    Declined,
    /// The cursor moved past a product outside the class.
    Skipped,
    /// No product in that direction.
    End,
}

/// Outcome of `sequence_delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqDelete {
    /// Deleted a product occupying `extent` bytes.
    Deleted { extent: u64, arrival: Timestamp },
    /// Moved past a product outside the class.
    Skipped { arrival: Timestamp },
    End,
}

impl Inner {
    fn start_cursor(&mut self, direction: Direction) -> Result<()> {
        if self.cursor.is_none() {
            self.cursor.time = match direction {
                Direction::Backward => Timestamp::ENDT,
                Direction::Forward => Timestamp::ZERO,
                Direction::Exact => return Err(Error::Invalid("exact match needs a cursor")),
            };
        }
        Ok(())
    }

    /// Moves the cursor one product and, given a class, offers a match to
    /// `deliver`. With `keep`, a delivered product's region stays held and
    /// its offset is returned.
    fn step<F>(
        &mut self,
        direction: Direction,
        class: Option<&ProductClass>,
        keep: bool,
        deliver: F,
    ) -> Result<(Step, Option<u64>)>
    where
        F: FnOnce(&ProductRef<'_>) -> bool,
    {
        self.start_cursor(direction)?;
        let layout = self.geometry.index;
        let hold = self.ctl_get(false)?;
        let (entry, extent) = {
            let index = hold.index(&layout);
            let Some(entry) = index
                .times
                .find(&index.blocks, self.cursor.time, direction)
            else {
                self.ctl_rel(hold, false)?;
                return Ok((Step::End, None));
            };
            let extent = index
                .regions
                .find(entry.offset)
                .map(|rix| index.regions.extent(rix))
                .filter(|&extent| extent <= self.geometry.data_size);
            (entry, extent)
        };
        self.cursor = Cursor {
            time: entry.time,
            offset: entry.offset,
        };
        let Some(class) = class else {
            self.ctl_rel(hold, false)?;
            return Ok((Step::Skipped, None));
        };
        let Some(extent) = extent else {
            error!(
                "Queue corrupt: time entry {} points at offset {} with no valid region",
                entry.time, entry.offset
            );
            self.ctl_rel(hold, false)?;
            return Ok((Step::Skipped, None));
        };
        let ptr = match self.access.get(entry.offset, extent, Mode::READ) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = self.ctl_rel(hold, false);
                return Err(err);
            }
        };
        if let Err(err) = self.ctl_rel(hold, false) {
            let _ = self.access.release(entry.offset, false);
            return Err(err);
        }
        if log_enabled!(Level::Debug) {
            debug!("Delay: {:.4} sec", self.clock.now().secs_since(entry.time));
        }

        // SAFETY: held until released below or by `release`.
        let bytes = unsafe { region(ptr, extent) };
        let (info, data) = match decode(bytes) {
            Ok(decoded) => decoded,
            Err(_) => {
                let _ = self.access.release(entry.offset, false);
                error!("undecodable product at offset {}", entry.offset);
                return Err(Error::Corrupt("undecodable product"));
            }
        };
        debug!(
            "time(insert)-time(create): {:.4} s",
            entry.time.secs_since(info.arrival)
        );
        let step = if class.matches(&info) {
            let encoded_len = (info.metadata_len() + pad4(info.size as usize)).min(bytes.len());
            let product = ProductRef {
                info,
                data,
                encoded: &bytes[..encoded_len],
                offset: entry.offset,
                inserted: entry.time,
            };
            if deliver(&product) {
                Step::Delivered
            } else {
                self.cursor = Cursor {
                    time: match direction {
                        Direction::Backward => entry.time.incr(),
                        _ => entry.time.decr(),
                    },
                    offset: OFFSET_NONE,
                };
                Step::Declined
            }
        } else {
            Step::Skipped
        };
        if keep && step == Step::Delivered {
            return Ok((step, Some(entry.offset)));
        }
        self.access.release(entry.offset, false)?;
        Ok((step, None))
    }

    fn sequence_delete(
        &mut self,
        direction: Direction,
        class: &ProductClass,
        wait: bool,
    ) -> Result<SeqDelete> {
        self.ensure_writable()?;
        self.start_cursor(direction)?;
        let layout = self.geometry.index;
        let data_size = self.geometry.data_size;
        self.with_ctl(true, |inner, hold| {
            let (_, mut index) = hold.parts_mut(&layout);
            let Some(entry) = index
                .times
                .find(&index.blocks, inner.cursor.time, direction)
            else {
                return Ok(SeqDelete::End);
            };
            let rix = index
                .regions
                .find(entry.offset)
                .ok_or(Error::Corrupt("time entry without region"))?;
            let extent = index.regions.extent(rix);
            if extent > data_size {
                return Err(Error::Corrupt("region larger than data segment"));
            }
            let mode = if wait { Mode::WRITE } else { Mode::WRITE_NOWAIT };
            let ptr = inner.access.get(entry.offset, extent, mode)?;
            inner.cursor = Cursor {
                time: entry.time,
                offset: OFFSET_NONE,
            };
            // SAFETY: held until the release below.
            let info = match ProductInfo::decode(unsafe { region(ptr, extent) }) {
                Ok(info) => info,
                Err(_) => {
                    let _ = inner.access.release(entry.offset, false);
                    return Err(Error::Corrupt("undecodable product metadata"));
                }
            };
            if !class.matches(&info) {
                inner.access.release(entry.offset, false)?;
                return Ok(SeqDelete::Skipped {
                    arrival: info.arrival,
                });
            }
            let mut indexed = true;
            let removed = index.times.delete(&mut index.blocks, &entry).and_then(|()| {
                indexed = index.sigs.find_delete(&info.signature).is_some();
                index.regions.free(&mut index.blocks, &mut inner.rng, rix)
            });
            inner.access.release(entry.offset, false)?;
            removed?;
            if !indexed {
                // Removed from the other indexes all the same.
                error!(
                    "signature {} at offset {} not in signature index",
                    info.signature, entry.offset
                );
                return Err(Error::Corrupt("signature missing from index"));
            }
            Ok(SeqDelete::Deleted {
                extent,
                arrival: info.arrival,
            })
        })
    }

    fn set_cursor_from_signature(&mut self, signature: &Signature) -> Result<()> {
        let layout = self.geometry.index;
        let entry = self.with_ctl(false, |inner, hold| {
            let index = hold.index(&layout);
            let offset = index.sigs.find(signature).ok_or(Error::NotFound)?;
            let rix = index
                .regions
                .find(offset)
                .ok_or(Error::Corrupt("signature indexes a free region"))?;
            inner.time_entry_at(&index, offset, index.regions.extent(rix))
        })?;
        self.cursor = Cursor {
            time: entry.time,
            offset: entry.offset,
        };
        Ok(())
    }

    fn set_cursor_from_class(&mut self, class: &ProductClass) -> Result<Direction> {
        if class.from.is_none() || class.to.is_none() {
            return Err(Error::Invalid("class time window unset"));
        }
        self.cursor = Cursor {
            time: class.from,
            offset: OFFSET_NONE,
        };
        let towards = if class.from > class.to {
            if class.from == Timestamp::ENDT {
                return Ok(Direction::Backward);
            }
            Direction::Forward
        } else {
            if class.from == Timestamp::ZERO {
                return Ok(Direction::Forward);
            }
            Direction::Backward
        };
        let layout = self.geometry.index;
        let from = class.from;
        let neighbour = self.with_ctl(false, |_, hold| {
            let index = hold.index(&layout);
            Ok(index.times.find(&index.blocks, from, towards))
        })?;
        if let Some(entry) = neighbour {
            self.cursor.time = entry.time;
        }
        Ok(towards.reverse())
    }

    fn last_match(&mut self, class: &ProductClass) -> Result<Option<ProductInfo>> {
        let floor = class.from;
        self.cursor = Cursor {
            time: class.to,
            offset: OFFSET_NONE,
        };
        let mut found = None;
        loop {
            let (step, _) = self.step(Direction::Backward, Some(class), false, |product| {
                found = Some(product.info.clone());
                true
            })?;
            if matches!(step, Step::End | Step::Delivered) {
                break;
            }
            if self.cursor.time.sec < floor.sec {
                break;
            }
        }
        if self.cursor.time == Timestamp::ENDT {
            self.cursor = Cursor::NONE;
        }
        Ok(found)
    }
}

impl ProductQueue {
    /// Moves the cursor one product in `direction` and hands a product in
    /// `class` to `deliver`, which returns whether it accepted it.
    ///
    /// The queue stays locked while `deliver` runs; it must not call back
    /// into this queue.
    pub fn sequence<F>(
        &self,
        direction: Direction,
        class: &ProductClass,
        deliver: F,
    ) -> Result<Step>
    where
        F: FnOnce(&ProductRef<'_>) -> bool,
    {
        let mut inner = self.lock_open()?;
        Ok(inner.step(direction, Some(class), false, deliver)?.0)
    }

    /// Like `sequence`, but a delivered product's region stays read-locked
    /// until `release` is called with the returned offset.
    pub fn sequence_lock<F>(
        &self,
        direction: Direction,
        class: &ProductClass,
        deliver: F,
    ) -> Result<(Step, Option<u64>)>
    where
        F: FnOnce(&ProductRef<'_>) -> bool,
    {
        self.lock_open()?.step(direction, Some(class), true, deliver)
    }

    /// Moves the cursor one product without reading it.
    pub fn advance(&self, direction: Direction) -> Result<Step> {
        let mut inner = self.lock_open()?;
        Ok(inner.step(direction, None, false, |_| true)?.0)
    }

    /// Moves the cursor one product and deletes it if it is in `class`.
    /// Without `wait`, a product someone holds fails with `Locked`. A
    /// product missing from the signature index is still removed, then
    /// reported as `Corrupt`.
    pub fn sequence_delete(
        &self,
        direction: Direction,
        class: &ProductClass,
        wait: bool,
    ) -> Result<SeqDelete> {
        self.lock_open()?.sequence_delete(direction, class, wait)
    }

    /// Runs `op` on the product with `signature`, read-locked for the call.
    pub fn process_by_signature<T>(
        &self,
        signature: &Signature,
        op: impl FnOnce(&ProductRef<'_>) -> T,
    ) -> Result<T> {
        let mut inner = self.lock_open()?;
        let layout = inner.geometry.index;
        let (offset, extent, ptr) = inner.with_ctl(false, |inner, hold| {
            let index = hold.index(&layout);
            let offset = index.sigs.find(signature).ok_or(Error::NotFound)?;
            let rix = index
                .regions
                .find(offset)
                .ok_or(Error::Corrupt("signature indexes a free region"))?;
            let extent = index.regions.extent(rix);
            let ptr = inner.access.get(offset, extent, Mode::READ)?;
            Ok((offset, extent, ptr))
        })?;
        // SAFETY: held until the release below.
        let bytes = unsafe { region(ptr, extent) };
        let result = decode(bytes).map(|(info, data)| {
            let encoded_len = (info.metadata_len() + pad4(info.size as usize)).min(bytes.len());
            op(&ProductRef {
                info,
                data,
                encoded: &bytes[..encoded_len],
                offset,
                inserted: Timestamp::NONE,
            })
        });
        inner.access.release(offset, false)?;
        result.map_err(|_| Error::Corrupt("undecodable product"))
    }

    pub fn cursor(&self) -> Result<Cursor> {
        Ok(self.lock_open()?.cursor)
    }

    /// Positions the cursor at `time`.
    pub fn set_cursor(&self, time: Timestamp) -> Result<()> {
        self.lock_open()?.cursor = Cursor {
            time,
            offset: OFFSET_NONE,
        };
        Ok(())
    }

    pub fn set_cursor_offset(&self, offset: u64) -> Result<()> {
        self.lock_open()?.cursor.offset = offset;
        Ok(())
    }

    /// Positions the cursor on the product with `signature`.
    pub fn set_cursor_from_signature(&self, signature: &Signature) -> Result<()> {
        self.lock_open()?.set_cursor_from_signature(signature)
    }

    /// Positions the cursor at the edge of `class`'s time window and
    /// returns the direction to sequence in.
    pub fn set_cursor_from_class(&self, class: &ProductClass) -> Result<Direction> {
        self.lock_open()?.set_cursor_from_class(class)
    }

    /// Whether the cursor still lies inside `class` given products may
    /// arrive up to `max_latency` late.
    pub fn cursor_in_class(
        &self,
        direction: Direction,
        class: &ProductClass,
        max_latency: Duration,
    ) -> Result<bool> {
        let cursor = self.lock_open()?.cursor;
        if class.specs.is_empty() || cursor.is_none() {
            return Ok(false);
        }
        if class.is_all() {
            return Ok(true);
        }
        Ok(match direction {
            Direction::Backward => cursor.time >= class.to,
            _ => cursor.time <= class.to.add_duration(max_latency),
        })
    }

    /// Metadata of the newest product in `class`, scanning backward from
    /// the end of its window.
    pub fn last_match(&self, class: &ProductClass) -> Result<Option<ProductInfo>> {
        self.lock_open()?.last_match(class)
    }

    /// Advances `class.from` to the newest matching product's creation
    /// time. Returns false if nothing newer was found.
    pub fn class_set_from(&self, class: &mut ProductClass) -> Result<bool> {
        let mut inner = self.lock_open()?;
        match inner.last_match(class)? {
            Some(info) if info.arrival != class.from => {
                class.from = info.arrival;
                inner.cursor = Cursor::NONE;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreateOptions, QueueConfig};
    use crate::product::Product;

    #[test]
    fn sequence_delete_reports_missing_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = ProductQueue::create(
            dir.path().join("unsigned.pq"),
            CreateOptions::new(16 * 1024, 16),
            QueueConfig::default().quiet(),
        )
        .expect("create");
        let product = Product::from_payload("unsigned", 1, 0, vec![3u8; 100]);
        queue.insert(&product).expect("insert");
        {
            let mut inner = queue.lock().expect("lock");
            let layout = inner.geometry.index;
            inner
                .with_ctl(true, |_, hold| {
                    let (_, mut index) = hold.parts_mut(&layout);
                    Ok(index.sigs.find_delete(&product.info.signature))
                })
                .expect("unindex")
                .expect("was indexed");
        }

        let all = ProductClass::all();
        assert!(matches!(
            queue.sequence_delete(Direction::Forward, &all, false),
            Err(Error::Corrupt(_))
        ));
        // The product is gone from the other indexes regardless.
        assert_eq!(queue.stats().expect("stats").products, 0);
        assert_eq!(
            queue
                .sequence_delete(Direction::Forward, &all, false)
                .expect("end"),
            SeqDelete::End
        );
        assert_eq!(queue.check().expect("check"), 0);
    }
}
