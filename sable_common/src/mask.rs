//! Per-tag suppression bitmap.
//!
//! A packed 256-bit map indexed by tag octet. Append entry points test the
//! tag's bit before any formatting work and drop the record if it is set.
//! The map is shared between worker threads and the control plane, which
//! may flip bits while writers are in flight; plain relaxed atomics are
//! enough since a late-observed flip only delays suppression by one record.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::tags::Tag;

/// Runtime-mutable tag suppression map.
#[derive(Debug, Default)]
pub struct TagMask {
    bytes: [AtomicU8; 32],
}

impl TagMask {
    /// Empty mask: every tag passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mask with the named tags suppressed.
    ///
    /// Unknown names are reported back so configuration loading can reject
    /// them; the known ones are applied regardless.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let mask = Self::new();
        for name in names {
            match Tag::from_name(name) {
                Some(tag) => mask.set(tag),
                None => return Err(name.to_string()),
            }
        }
        Ok(mask)
    }

    #[inline]
    fn slot(tag: Tag) -> (usize, u8) {
        let raw = tag.raw() as usize;
        (raw >> 3, 0x80 >> (raw & 7))
    }

    /// Suppress `tag`.
    pub fn set(&self, tag: Tag) {
        let (byte, bit) = Self::slot(tag);
        self.bytes[byte].fetch_or(bit, Ordering::Relaxed);
    }

    /// Stop suppressing `tag`.
    pub fn clear(&self, tag: Tag) {
        let (byte, bit) = Self::slot(tag);
        self.bytes[byte].fetch_and(!bit, Ordering::Relaxed);
    }

    /// Whether records of `tag` are currently dropped.
    #[inline]
    pub fn is_masked(&self, tag: Tag) -> bool {
        let (byte, bit) = Self::slot(tag);
        self.bytes[byte].load(Ordering::Relaxed) & bit != 0
    }
}
