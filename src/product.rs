//! Data-products and their portable on-disk encoding.
//!
//! Every field is big-endian and padded to four bytes:
//!
//! ```text
//! arrival.sec i32 | arrival.usec i32 | signature [16]
//! origin (u32 len + bytes) | feedtype u32 | seqno u32
//! ident (u32 len + bytes) | size u32 | payload
//! ```

use std::fmt;
use std::str::FromStr;

use crate::timestamp::Timestamp;
use crate::{Error, Result};

/// Longest origin host name.
pub const ORIGIN_MAX: usize = 64;
/// Longest product identifier.
pub const IDENT_MAX: usize = 255;
/// Fixed part of the encoded metadata.
const FIXED_LEN: usize = 44;
/// Byte range of the signature inside an encoded product.
pub(crate) const SIGNATURE_RANGE: std::ops::Range<usize> = 8..24;

#[inline]
pub(crate) fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// 128-bit content signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature(pub [u8; 16]);

impl Signature {
    pub const ZERO: Signature = Signature([0u8; 16]);

    /// Leading 16 bytes of the payload's BLAKE3 hash.
    pub fn of(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut out = [0u8; 16];
        out.copy_from_slice(&hash.as_bytes()[..16]);
        Signature(out)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.len() != 32 || !text.is_ascii() {
            return Err(Error::Invalid("signature must be 32 hex digits"));
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[2 * i..2 * i + 2], 16)
                .map_err(|_| Error::Invalid("signature must be 32 hex digits"))?;
        }
        Ok(Signature(out))
    }
}

/// Product metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub arrival: Timestamp,
    pub signature: Signature,
    pub origin: String,
    pub feedtype: u32,
    pub seqno: u32,
    pub ident: String,
    /// Payload length in bytes.
    pub size: u32,
}

impl ProductInfo {
    /// Metadata for `data` arriving now from this host.
    pub fn for_payload(ident: impl Into<String>, feedtype: u32, seqno: u32, data: &[u8]) -> Self {
        Self {
            arrival: Timestamp::now(),
            signature: Signature::of(data),
            origin: local_hostname(),
            feedtype,
            seqno,
            ident: ident.into(),
            size: data.len() as u32,
        }
    }

    pub fn metadata_len(&self) -> usize {
        FIXED_LEN + pad4(self.origin.len()) + pad4(self.ident.len())
    }

    /// Metadata plus padded payload.
    pub fn encoded_len(&self) -> usize {
        self.metadata_len() + pad4(self.size as usize)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.origin.len() > ORIGIN_MAX {
            return Err(Error::Invalid("origin longer than 64 bytes"));
        }
        if self.ident.len() > IDENT_MAX {
            return Err(Error::Invalid("identifier longer than 255 bytes"));
        }
        Ok(())
    }

    /// Writes the metadata to the front of `buf`; returns its length.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        self.validate()?;
        let len = self.metadata_len();
        if buf.len() < len {
            return Err(Error::Invalid("buffer too small for metadata"));
        }
        let mut w = Writer { buf, at: 0 };
        w.u32(self.arrival.sec as i32 as u32);
        w.u32(self.arrival.usec as i32 as u32);
        w.bytes(&self.signature.0);
        w.string(&self.origin);
        w.u32(self.feedtype);
        w.u32(self.seqno);
        w.string(&self.ident);
        w.u32(self.size);
        Ok(w.at)
    }

    /// Decodes the metadata at the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader { buf, at: 0 };
        let sec = r.u32()? as i32 as i64;
        let usec = r.u32()? as i32 as i64;
        let mut signature = [0u8; 16];
        signature.copy_from_slice(r.take(16)?);
        let origin = r.string(ORIGIN_MAX)?;
        let feedtype = r.u32()?;
        let seqno = r.u32()?;
        let ident = r.string(IDENT_MAX)?;
        let size = r.u32()?;
        Ok(Self {
            arrival: Timestamp::new(sec, usec),
            signature: Signature(signature),
            origin,
            feedtype,
            seqno,
            ident,
            size,
        })
    }
}

/// Metadata plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub info: ProductInfo,
    pub data: Vec<u8>,
}

impl Product {
    pub fn new(info: ProductInfo, data: Vec<u8>) -> Result<Self> {
        if info.size as usize != data.len() {
            return Err(Error::Invalid("declared size differs from payload length"));
        }
        Ok(Self { info, data })
    }

    /// Product arriving now with a content-derived signature.
    pub fn from_payload(
        ident: impl Into<String>,
        feedtype: u32,
        seqno: u32,
        data: Vec<u8>,
    ) -> Self {
        let info = ProductInfo::for_payload(ident, feedtype, seqno, &data);
        Self { info, data }
    }

    pub fn encoded_len(&self) -> usize {
        self.info.encoded_len()
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let meta = self.info.encode_into(buf)?;
        let end = meta + pad4(self.data.len());
        if buf.len() < end {
            return Err(Error::Invalid("buffer too small for product"));
        }
        buf[meta..meta + self.data.len()].copy_from_slice(&self.data);
        buf[meta + self.data.len()..end].fill(0);
        Ok(end)
    }
}

/// Splits an encoded product into metadata and payload.
pub fn decode(buf: &[u8]) -> Result<(ProductInfo, &[u8])> {
    let info = ProductInfo::decode(buf)?;
    let start = info.metadata_len();
    let end = start + info.size as usize;
    if buf.len() < end {
        return Err(Error::Corrupt("product payload truncated"));
    }
    Ok((info, &buf[start..end]))
}

pub(crate) fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let mut name = String::from_utf8_lossy(&buf[..end]).into_owned();
    name.truncate(ORIGIN_MAX);
    name
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn u32(&mut self, value: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&value.to_be_bytes());
        self.at += 4;
    }

    fn bytes(&mut self, value: &[u8]) {
        self.buf[self.at..self.at + value.len()].copy_from_slice(value);
        let padded = pad4(value.len());
        self.buf[self.at + value.len()..self.at + padded].fill(0);
        self.at += padded;
    }

    fn string(&mut self, value: &str) {
        self.u32(value.len() as u32);
        self.bytes(value.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let padded = pad4(len);
        if self.buf.len() < self.at + padded {
            return Err(Error::Corrupt("product metadata truncated"));
        }
        let out = &self.buf[self.at..self.at + len];
        self.at += padded;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("slice length")))
    }

    fn string(&mut self, max: usize) -> Result<String> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(Error::Corrupt("product string too long"));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Corrupt("product string not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Product {
        let data = b"hello, queue".to_vec();
        let info = ProductInfo {
            arrival: Timestamp::new(1_700_000_000, 123_456),
            signature: Signature::of(&data),
            origin: "ingest.example.org".to_string(),
            feedtype: 0x10,
            seqno: 42,
            ident: "SAUS70 KWBC 011200".to_string(),
            size: data.len() as u32,
        };
        Product::new(info, data).expect("product")
    }

    #[test]
    fn encoding_layout() {
        let product = sample();
        // 44 + pad4(18) + pad4(18) = 84; payload 12.
        assert_eq!(product.info.metadata_len(), 84);
        assert_eq!(product.encoded_len(), 96);
        let mut buf = vec![0xffu8; product.encoded_len()];
        let written = product.encode_into(&mut buf).expect("encode");
        assert_eq!(written, 96);
        assert_eq!(&buf[0..4], &1_700_000_000u32.to_be_bytes());
        assert_eq!(&buf[SIGNATURE_RANGE], &product.info.signature.0);
        assert_eq!(&buf[24..28], &18u32.to_be_bytes());
        assert_eq!(&buf[46..48], &[0, 0]);

        let (info, payload) = decode(&buf).expect("decode");
        assert_eq!(info, product.info);
        assert_eq!(payload, b"hello, queue");
    }

    #[test]
    fn truncated_metadata_is_corrupt() {
        let product = sample();
        let mut buf = vec![0u8; product.encoded_len()];
        product.encode_into(&mut buf).expect("encode");
        assert!(matches!(
            ProductInfo::decode(&buf[..40]),
            Err(Error::Corrupt(_))
        ));
        assert!(matches!(decode(&buf[..90]), Err(Error::Corrupt(_))));
    }

    #[test]
    fn oversized_ident_rejected() {
        let mut product = sample();
        product.info.ident = "x".repeat(IDENT_MAX + 1);
        let mut buf = vec![0u8; product.encoded_len()];
        assert!(matches!(product.encode_into(&mut buf), Err(Error::Invalid(_))));
    }

    #[test]
    fn signature_hex() {
        let sig = Signature::of(b"abc");
        let text = sig.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<Signature>().expect("parse"), sig);
        assert!("abc".parse::<Signature>().is_err());
    }
}
