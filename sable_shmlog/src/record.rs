//! Log record wire format.
//!
//! A record is a two-word header followed by a payload rounded up to whole
//! 32-bit words. Header word 0 packs the tag into bits 31..24 and the
//! payload byte length into bits 23..0; header word 1 carries the
//! transaction id, except for [`Tag::Batch`] records where it carries the
//! batch payload length in bytes (the header length field is 0 there).
//!
//! Words are little-endian on the wire. Two sentinel words can appear in
//! the ring where a header word is expected; both use reserved tag octets
//! so they can never be produced by a valid `(tag << 24) | len` encoding.

use sable::consts::WORD_SIZE;
use sable::tags::{Tag, RAW_BOGUS, RAW_RESERVED};

/// "No record here yet" - readers wait and re-poll this word.
pub const ENDMARKER: u32 = ((RAW_RESERVED as u32) << 24) | 0x0045_4545;

/// "Ring wrapped" - readers seek back to word 0.
pub const WRAPMARKER: u32 = ((RAW_BOGUS as u32) << 24) | 0x0057_5757;

/// Mask of the payload-length bits of header word 0.
pub const LEN_MASK: u32 = 0x00ff_ffff;

/// Header size in words.
pub const HDR_WORDS: usize = 2;

/// Pack header word 0.
#[inline]
pub fn pack_hdr(tag: u8, len: usize) -> u32 {
    debug_assert!(tag != RAW_BOGUS && tag != RAW_RESERVED);
    debug_assert!(len as u32 <= LEN_MASK);
    ((tag as u32) << 24) | len as u32
}

/// Tag octet of header word 0.
#[inline]
pub fn hdr_tag(word: u32) -> u8 {
    (word >> 24) as u8
}

/// Payload byte length of header word 0.
#[inline]
pub fn hdr_len(word: u32) -> usize {
    (word & LEN_MASK) as usize
}

/// Words occupied by a payload of `len` bytes.
#[inline]
pub fn payload_words(len: usize) -> usize {
    len.div_ceil(WORD_SIZE)
}

/// Total words occupied by a record with a payload of `len` bytes.
#[inline]
pub fn record_words(len: usize) -> usize {
    HDR_WORDS + payload_words(len)
}

/// A decoded log record, payload copied out of shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// On-wire tag octet.
    pub tag: u8,
    /// Transaction id (batch byte length for Batch records).
    pub txid: u32,
    /// Payload, exactly the length from the header.
    pub payload: Vec<u8>,
}

impl Record {
    /// Decoded tag, if the octet is a known tag.
    pub fn tag(&self) -> Option<Tag> {
        Tag::from_raw(self.tag)
    }

    /// Payload as text with the trailing NUL stripped.
    ///
    /// `None` for binary payloads or records without the terminator.
    pub fn text(&self) -> Option<&str> {
        let (last, body) = self.payload.split_last()?;
        if *last != 0 {
            return None;
        }
        std::str::from_utf8(body).ok()
    }

    /// Parse a Batch payload into its constituent records.
    ///
    /// `None` if this record is not a Batch.
    pub fn unbatch(&self) -> Option<Vec<Record>> {
        if self.tag()? != Tag::Batch {
            return None;
        }
        Some(parse_records(&self.payload))
    }
}

/// Parse a dense byte sequence of records (a batch payload or a copied
/// span of the ring body). Stops at the first spot too short to hold a
/// header or whose header claims more payload than remains.
pub fn parse_records(bytes: &[u8]) -> Vec<Record> {
    let mut out = Vec::new();
    let mut off = 0;
    while off + HDR_WORDS * WORD_SIZE <= bytes.len() {
        let w0 = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let w1 = u32::from_le_bytes(bytes[off + 4..off + 8].try_into().unwrap());
        let tag = hdr_tag(w0);
        if tag == RAW_BOGUS || tag == RAW_RESERVED {
            break;
        }
        let len = hdr_len(w0);
        let start = off + HDR_WORDS * WORD_SIZE;
        if start + payload_words(len) * WORD_SIZE > bytes.len() {
            break;
        }
        out.push(Record {
            tag,
            txid: w1,
            payload: bytes[start..start + len].to_vec(),
        });
        off = start + payload_words(len) * WORD_SIZE;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let w = pack_hdr(Tag::Debug.raw(), 100);
        assert_eq!(hdr_tag(w), Tag::Debug.raw());
        assert_eq!(hdr_len(w), 100);
    }

    #[test]
    fn test_sentinels_use_reserved_tags() {
        assert_eq!(hdr_tag(ENDMARKER), RAW_RESERVED);
        assert_eq!(hdr_tag(WRAPMARKER), RAW_BOGUS);
        assert_ne!(ENDMARKER, WRAPMARKER);
    }

    #[test]
    fn test_word_rounding() {
        assert_eq!(payload_words(0), 0);
        assert_eq!(payload_words(1), 1);
        assert_eq!(payload_words(4), 1);
        assert_eq!(payload_words(5), 2);
        assert_eq!(record_words(9), 5);
    }

    #[test]
    fn test_parse_records() {
        let mut bytes = Vec::new();
        for (tag, txid, text) in [
            (Tag::Begin, 7u32, "req 6 rxreq\0"),
            (Tag::ReqUrl, 7, "/index.html\0"),
        ] {
            bytes.extend_from_slice(&pack_hdr(tag.raw(), text.len()).to_le_bytes());
            bytes.extend_from_slice(&txid.to_le_bytes());
            bytes.extend_from_slice(text.as_bytes());
            bytes.resize(bytes.len().next_multiple_of(WORD_SIZE), 0);
        }

        let records = parse_records(&bytes);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag(), Some(Tag::Begin));
        assert_eq!(records[0].text(), Some("req 6 rxreq"));
        assert_eq!(records[1].txid, 7);
        assert_eq!(records[1].text(), Some("/index.html"));
    }

    #[test]
    fn test_parse_stops_on_short_payload() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&pack_hdr(Tag::Debug.raw(), 1000).to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(b"tiny");
        assert!(parse_records(&bytes).is_empty());
    }
}
