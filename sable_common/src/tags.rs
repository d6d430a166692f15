//! Log record tags.
//!
//! Every record carries an 8-bit tag in the top octet of its header word.
//! Tag 0 (`RAW_BOGUS`) and tag 255 (`RAW_RESERVED`) are never emitted;
//! they are reserved so the ring sentinels can never collide with a valid
//! `(tag << 24) | len` header encoding.

use bitflags::bitflags;

/// Reserved low tag value. Never written to the ring.
pub const RAW_BOGUS: u8 = 0;

/// Reserved high tag value. Never written to the ring.
pub const RAW_RESERVED: u8 = 255;

bitflags! {
    /// Per-tag metadata flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagFlags: u8 {
        /// Payload is raw bytes, not NUL-terminated text.
        const BINARY = 0x01;
    }
}

/// Log record tag.
///
/// Discriminants are the on-wire tag octets. The framing tags
/// (`Begin`, `End`, `Link`, `Batch`) and `Timestamp`/`Debug` are load
/// bearing for the log format; the rest describe cache/proxy traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Transaction start: "type parent-id reason".
    Begin = 1,
    /// Transaction end. Empty payload.
    End = 2,
    /// Reference to a child transaction: "type child-id reason".
    Link = 3,
    /// Container for a flushed per-writer buffer. Header length is 0;
    /// the second header word holds the batch payload length in bytes.
    Batch = 4,
    /// Timing checkpoint: "event: now since-start since-previous".
    Timestamp = 5,
    /// Free-form diagnostic text.
    Debug = 6,
    /// Error condition description.
    Error = 7,
    /// Client session accepted.
    SessOpen = 8,
    /// Client session closed.
    SessClose = 9,
    /// Request method.
    ReqMethod = 10,
    /// Request URL.
    ReqUrl = 11,
    /// Request protocol version.
    ReqProtocol = 12,
    /// Request header line.
    ReqHeader = 13,
    /// Response status code.
    RespStatus = 14,
    /// Response header line.
    RespHeader = 15,
    /// Response body byte count.
    Length = 16,
    /// Cache hit on an object.
    Hit = 17,
    /// Cache miss.
    Miss = 18,
    /// Backend connection opened.
    BackendOpen = 19,
    /// Backend connection closed.
    BackendClose = 20,
    /// Object lifetime decision.
    Ttl = 21,
    /// Object lookup hash input. Raw bytes.
    Hash = 22,
}

impl Tag {
    /// The on-wire tag octet.
    #[inline]
    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Decode an on-wire tag octet. Reserved and unknown octets map to `None`.
    pub fn from_raw(raw: u8) -> Option<Tag> {
        Some(match raw {
            1 => Tag::Begin,
            2 => Tag::End,
            3 => Tag::Link,
            4 => Tag::Batch,
            5 => Tag::Timestamp,
            6 => Tag::Debug,
            7 => Tag::Error,
            8 => Tag::SessOpen,
            9 => Tag::SessClose,
            10 => Tag::ReqMethod,
            11 => Tag::ReqUrl,
            12 => Tag::ReqProtocol,
            13 => Tag::ReqHeader,
            14 => Tag::RespStatus,
            15 => Tag::RespHeader,
            16 => Tag::Length,
            17 => Tag::Hit,
            18 => Tag::Miss,
            19 => Tag::BackendOpen,
            20 => Tag::BackendClose,
            21 => Tag::Ttl,
            22 => Tag::Hash,
            _ => return None,
        })
    }

    /// Tag name as shown by log-reading tools.
    pub fn name(self) -> &'static str {
        match self {
            Tag::Begin => "Begin",
            Tag::End => "End",
            Tag::Link => "Link",
            Tag::Batch => "Batch",
            Tag::Timestamp => "Timestamp",
            Tag::Debug => "Debug",
            Tag::Error => "Error",
            Tag::SessOpen => "SessOpen",
            Tag::SessClose => "SessClose",
            Tag::ReqMethod => "ReqMethod",
            Tag::ReqUrl => "ReqUrl",
            Tag::ReqProtocol => "ReqProtocol",
            Tag::ReqHeader => "ReqHeader",
            Tag::RespStatus => "RespStatus",
            Tag::RespHeader => "RespHeader",
            Tag::Length => "Length",
            Tag::Hit => "Hit",
            Tag::Miss => "Miss",
            Tag::BackendOpen => "BackendOpen",
            Tag::BackendClose => "BackendClose",
            Tag::Ttl => "TTL",
            Tag::Hash => "Hash",
        }
    }

    /// Per-tag flags.
    pub fn flags(self) -> TagFlags {
        match self {
            Tag::Hash => TagFlags::BINARY,
            _ => TagFlags::empty(),
        }
    }

    /// Look a tag up by its tool-facing name. Case sensitive.
    pub fn from_name(name: &str) -> Option<Tag> {
        (1..=u8::MAX)
            .filter_map(Tag::from_raw)
            .find(|t| t.name() == name)
    }
}
