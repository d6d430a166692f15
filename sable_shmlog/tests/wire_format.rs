//! Property tests for the record wire format.

use proptest::prelude::*;
use sable::consts::WORD_SIZE;
use sable::params::LogParams;
use sable::tags::Tag;
use sable_shmlog::record::{pack_hdr, hdr_len, hdr_tag, parse_records, ENDMARKER, WRAPMARKER};
use sable_shmlog::{LogCursor, Shmlog};

fn arb_tag() -> impl Strategy<Value = Tag> {
    (1u8..=22).prop_map(|raw| Tag::from_raw(raw).unwrap())
}

fn encode(records: &[(Tag, u32, Vec<u8>)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (tag, txid, payload) in records {
        bytes.extend_from_slice(&pack_hdr(tag.raw(), payload.len()).to_le_bytes());
        bytes.extend_from_slice(&txid.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes.resize(bytes.len().next_multiple_of(WORD_SIZE), 0);
    }
    bytes
}

proptest! {
    #[test]
    fn prop_header_round_trip(raw in 1u8..=254, len in 0usize..(1 << 24)) {
        let word = pack_hdr(raw, len);
        prop_assert_eq!(hdr_tag(word), raw);
        prop_assert_eq!(hdr_len(word), len);
        prop_assert_ne!(word, ENDMARKER);
        prop_assert_ne!(word, WRAPMARKER);
    }

    #[test]
    fn prop_record_stream_round_trip(
        records in proptest::collection::vec(
            (arb_tag(), any::<u32>(), proptest::collection::vec(any::<u8>(), 0..100)),
            0..20,
        )
    ) {
        let parsed = parse_records(&encode(&records));
        prop_assert_eq!(parsed.len(), records.len());
        for (rec, (tag, txid, payload)) in parsed.iter().zip(&records) {
            prop_assert_eq!(rec.tag(), Some(*tag));
            prop_assert_eq!(rec.txid, *txid);
            prop_assert_eq!(&rec.payload, payload);
        }
    }
}

proptest! {
    // Each case maps a fresh arena file; keep the count down.
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_texts_survive_ring_trip(
        texts in proptest::collection::vec("[ -~]{0,100}", 1..20)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let params = LogParams {
            log_space: 256 * 1024,
            log_reclen: 64,
            ..LogParams::default()
        };
        let shm = Shmlog::bootstrap(dir.path(), params).unwrap();
        let mut log = shm.txlog();
        for text in &texts {
            log.append_text(Tag::Debug, text);
        }
        log.flush(false);

        let mut cursor = LogCursor::attach(dir.path()).unwrap();
        let mut seen = Vec::new();
        for batch in cursor.drain() {
            for rec in batch.unbatch().unwrap() {
                seen.push(rec.text().unwrap().to_string());
            }
        }
        prop_assert_eq!(seen.len(), texts.len());
        for (got, want) in seen.iter().zip(&texts) {
            // Truncation to reclen - 1 bytes, NUL excluded.
            let want_trunc = &want[..want.len().min(63)];
            prop_assert_eq!(got, want_trunc);
        }
    }
}
