//! Signature index: 128-bit content signature to region offset.

use crate::product::Signature;
use crate::slab::{get_u64, put_u64};
use crate::{Error, Result};

pub(crate) const SX_MAGIC: u64 = 0x5358_4841;
const NONE: u64 = u64::MAX;

const MAGIC: usize = 0;
const NALLOC: usize = 8;
const NELEMS: usize = 16;
const NCHAINS: usize = 24;
const FREE: usize = 32;
const NFREE: usize = 40;
const HEADER_LEN: usize = 48;

const ELEM_LEN: usize = 32;
const E_SIG: usize = 0;
const E_OFFSET: usize = 16;
const E_NEXT: usize = 24;

pub(crate) fn byte_len(slots: u64, nchains: u64) -> usize {
    HEADER_LEN + slots as usize * ELEM_LEN + nchains as usize * 8
}

pub(crate) struct SigIndex<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> SigIndex<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn word(&self, at: usize) -> u64 {
        get_u64(self.buf.as_ref(), at)
    }

    fn elem_at(ix: u64) -> usize {
        HEADER_LEN + ix as usize * ELEM_LEN
    }

    fn chain_at(&self, bucket: usize) -> usize {
        HEADER_LEN + self.word(NALLOC) as usize * ELEM_LEN + bucket * 8
    }

    pub fn is_valid(&self, slots: u64, nchains: u64) -> bool {
        self.word(MAGIC) == SX_MAGIC
            && self.word(NALLOC) == slots
            && self.word(NCHAINS) == nchains
    }

    pub fn len(&self) -> u64 {
        self.word(NELEMS)
    }

    fn bucket(&self, sig: &Signature) -> usize {
        let lead = u32::from_be_bytes([sig.0[0], sig.0[1], sig.0[2], sig.0[3]]);
        (lead as u64 % self.word(NCHAINS)) as usize
    }

    fn sig(&self, ix: u64) -> &[u8] {
        let at = Self::elem_at(ix) + E_SIG;
        &self.buf.as_ref()[at..at + 16]
    }

    pub fn find(&self, sig: &Signature) -> Option<u64> {
        let mut ix = self.word(self.chain_at(self.bucket(sig)));
        while ix != NONE {
            if self.sig(ix) == sig.0 {
                return Some(self.word(Self::elem_at(ix) + E_OFFSET));
            }
            ix = self.word(Self::elem_at(ix) + E_NEXT);
        }
        None
    }
}

impl SigIndex<&mut [u8]> {
    fn set_word(&mut self, at: usize, value: u64) {
        put_u64(self.buf, at, value);
    }

    pub fn init(&mut self, slots: u64, nchains: u64) {
        self.buf[..byte_len(slots, nchains)].fill(0);
        self.set_word(NALLOC, slots);
        self.set_word(NCHAINS, nchains);
        for ix in 0..slots {
            let next = if ix + 1 < slots { ix + 1 } else { NONE };
            self.set_word(Self::elem_at(ix) + E_OFFSET, NONE);
            self.set_word(Self::elem_at(ix) + E_NEXT, next);
        }
        self.set_word(FREE, if slots > 0 { 0 } else { NONE });
        self.set_word(NFREE, slots);
        self.set_word(NELEMS, 0);
        for bucket in 0..nchains as usize {
            let at = self.chain_at(bucket);
            self.set_word(at, NONE);
        }
        self.set_word(MAGIC, SX_MAGIC);
    }

    pub fn add(&mut self, sig: &Signature, offset: u64) -> Result<()> {
        let ix = self.word(FREE);
        if ix == NONE {
            return Err(Error::NoSpace("signature slots exhausted"));
        }
        let elem = Self::elem_at(ix);
        let next_free = self.word(elem + E_NEXT);
        self.set_word(FREE, next_free);
        let nfree = self.word(NFREE);
        self.set_word(NFREE, nfree - 1);

        self.buf[elem + E_SIG..elem + E_SIG + 16].copy_from_slice(&sig.0);
        self.set_word(elem + E_OFFSET, offset);
        let chain = self.chain_at(self.bucket(sig));
        let head = self.word(chain);
        self.set_word(elem + E_NEXT, head);
        self.set_word(chain, ix);
        let count = self.word(NELEMS);
        self.set_word(NELEMS, count + 1);
        Ok(())
    }

    /// Unlinks `sig` and returns the offset it mapped to.
    pub fn find_delete(&mut self, sig: &Signature) -> Option<u64> {
        let chain = self.chain_at(self.bucket(sig));
        let mut link_at = chain;
        let mut ix = self.word(chain);
        while ix != NONE {
            let elem = Self::elem_at(ix);
            if self.sig(ix) == sig.0 {
                let next = self.word(elem + E_NEXT);
                self.set_word(link_at, next);
                let offset = self.word(elem + E_OFFSET);
                let head = self.word(FREE);
                self.buf[elem + E_SIG..elem + E_SIG + 16].fill(0);
                self.set_word(elem + E_OFFSET, NONE);
                self.set_word(elem + E_NEXT, head);
                self.set_word(FREE, ix);
                let nfree = self.word(NFREE);
                self.set_word(NFREE, nfree + 1);
                let count = self.word(NELEMS);
                self.set_word(NELEMS, count - 1);
                return Some(offset);
            }
            link_at = elem + E_NEXT;
            ix = self.word(link_at);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(lead: u8, tail: u8) -> Signature {
        let mut bytes = [0u8; 16];
        bytes[0] = lead;
        bytes[15] = tail;
        Signature(bytes)
    }

    #[test]
    fn add_find_delete() {
        let mut buf = vec![0u8; byte_len(8, 2)];
        let mut sx = SigIndex::new(&mut buf[..]);
        sx.init(8, 2);
        // Same bucket, different signatures.
        sx.add(&sig(4, 1), 100).expect("add");
        sx.add(&sig(4, 2), 200).expect("add");
        sx.add(&sig(5, 1), 300).expect("add");
        assert_eq!(sx.find(&sig(4, 1)), Some(100));
        assert_eq!(sx.find(&sig(4, 2)), Some(200));
        assert_eq!(sx.find(&sig(4, 3)), None);
        assert_eq!(sx.find_delete(&sig(4, 1)), Some(100));
        assert_eq!(sx.find(&sig(4, 1)), None);
        assert_eq!(sx.find(&sig(4, 2)), Some(200));
        assert_eq!(sx.len(), 2);
    }

    #[test]
    fn delete_from_empty_chain() {
        let mut buf = vec![0u8; byte_len(4, 1)];
        let mut sx = SigIndex::new(&mut buf[..]);
        sx.init(4, 1);
        assert_eq!(sx.find_delete(&sig(1, 1)), None);
    }

    #[test]
    fn full_index_reports_no_space() {
        let mut buf = vec![0u8; byte_len(2, 1)];
        let mut sx = SigIndex::new(&mut buf[..]);
        sx.init(2, 1);
        sx.add(&sig(1, 0), 1).expect("add");
        sx.add(&sig(2, 0), 2).expect("add");
        assert!(matches!(sx.add(&sig(3, 0), 3), Err(Error::NoSpace(_))));
        sx.find_delete(&sig(1, 0)).expect("present");
        sx.add(&sig(3, 0), 3).expect("slot recycled");
        assert_eq!(sx.find(&sig(3, 0)), Some(3));
    }
}
