//! Record formatting, truncation, batching and masking seen from the
//! reader side.

use sable::params::LogParams;
use sable::tags::Tag;
use sable_shmlog::{LogCursor, Record, Shmlog};
use tempfile::TempDir;

fn small_shmlog(reclen: usize) -> (TempDir, Shmlog) {
    let dir = tempfile::tempdir().unwrap();
    let params = LogParams {
        log_space: 16 * 1024,
        log_reclen: reclen,
        log_buffer: 4096,
        ..LogParams::default()
    };
    let shm = Shmlog::bootstrap(dir.path(), params).unwrap();
    (dir, shm)
}

/// Flush the writer and unpack every record from every pending batch.
fn drain_inner(cursor: &mut LogCursor) -> Vec<Record> {
    let mut out = Vec::new();
    for record in cursor.drain() {
        match record.unbatch() {
            Some(inner) => out.extend(inner),
            None => out.push(record),
        }
    }
    out
}

#[test]
fn test_text_truncation() {
    let (dir, shm) = small_shmlog(64);
    let mut log = shm.txlog();

    let long = "x".repeat(200);
    log.append_text(Tag::Debug, &long);
    log.flush(false);

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = drain_inner(&mut cursor);
    assert_eq!(records.len(), 1);

    let rec = &records[0];
    assert_eq!(rec.payload.len(), 64);
    assert_eq!(*rec.payload.last().unwrap(), 0);
    let text = rec.text().unwrap();
    assert!(text.len() <= 63);
    assert_eq!(text, &long[..63]);
}

#[test]
fn test_binary_truncation_marks_suffix() {
    let (dir, shm) = small_shmlog(64);
    let mut log = shm.txlog();

    let data = vec![0xabu8; 200];
    log.append_bin(Tag::Hash, &data);
    log.flush(false);

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = drain_inner(&mut cursor);
    assert_eq!(records.len(), 1);

    // 31 input bytes fit: 62 hex chars, a '-' marking the cut, then NUL.
    let rec = &records[0];
    assert_eq!(rec.payload.len(), 63);
    assert_eq!(rec.payload[62], b'-');
    assert!(rec.payload[..62].iter().all(|&b| b == b'a' || b == b'b'));
}

#[test]
fn test_binary_untruncated_round_trip() {
    let (dir, shm) = small_shmlog(64);
    let mut log = shm.txlog();

    log.append_bin(Tag::Hash, &[0x00, 0x9f, 0xff]);
    log.flush(false);

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = drain_inner(&mut cursor);
    assert_eq!(records[0].text(), Some("009fff"));
}

#[test]
fn test_batch_atomicity_and_order() {
    let (dir, shm) = small_shmlog(255);
    let mut log = shm.txlog();

    for i in 0..50 {
        log.append_fmt(Tag::Debug, format_args!("record {i:02}"));
    }
    log.flush(false);

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let batches = cursor.drain();
    assert_eq!(batches.len(), 1, "one flush must yield one batch record");

    let batch = &batches[0];
    assert_eq!(batch.tag(), Some(Tag::Batch));
    // For batches the second header word carries the payload byte length.
    assert_eq!(batch.txid as usize, batch.payload.len());

    let inner = batch.unbatch().unwrap();
    assert_eq!(inner.len(), 50);
    for (i, rec) in inner.iter().enumerate() {
        assert_eq!(rec.text().unwrap(), format!("record {i:02}"));
    }
}

#[test]
fn test_overflow_splits_into_batches() {
    let (dir, shm) = small_shmlog(255);
    let mut log = shm.txlog();

    // Way more than log_buffer holds; overflow flushes must kick in.
    for i in 0..500 {
        log.append_fmt(Tag::Debug, format_args!("spill {i:04}"));
    }
    log.flush(false);

    assert!(shm.stats().shm_flushes.load(std::sync::atomic::Ordering::Relaxed) > 0);

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = drain_inner(&mut cursor);
    assert_eq!(records.len(), 500);
    assert_eq!(records[499].text(), Some("spill 0499"));
}

#[test]
fn test_timestamp_deltas() {
    let (dir, shm) = small_shmlog(255);
    let mut log = shm.txlog();

    let first = 100.0;
    let mut prev = 100.0;
    log.append_ts("A", first, &mut prev, 100.5);
    log.append_ts("B", first, &mut prev, 101.25);
    log.flush(false);
    assert_eq!(prev, 101.25);

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = drain_inner(&mut cursor);
    assert_eq!(records[0].text(), Some("A: 100.500000 0.500000 0.500000"));
    assert_eq!(records[1].text(), Some("B: 101.250000 1.250000 0.750000"));
}

#[test]
fn test_mask_suppresses_and_releases() {
    let (dir, shm) = small_shmlog(255);
    let mut log = shm.txlog();

    for i in 0..3 {
        log.append_fmt(Tag::Debug, format_args!("before {i}"));
    }
    shm.mask().set(Tag::Debug);
    for i in 0..3 {
        log.append_fmt(Tag::Debug, format_args!("masked {i}"));
        log.append_fmt(Tag::Error, format_args!("unmasked {i}"));
    }
    shm.mask().clear(Tag::Debug);
    for i in 0..2 {
        log.append_fmt(Tag::Debug, format_args!("after {i}"));
    }
    log.flush(false);

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = drain_inner(&mut cursor);

    let debugs: Vec<_> = records
        .iter()
        .filter(|r| r.tag() == Some(Tag::Debug))
        .collect();
    assert_eq!(debugs.len(), 5);
    assert!(debugs.iter().all(|r| !r.text().unwrap().starts_with("masked")));
    // Other tags flowed while Debug was masked.
    assert_eq!(
        records
            .iter()
            .filter(|r| r.tag() == Some(Tag::Error))
            .count(),
        3
    );
}

#[test]
fn test_transaction_framing() {
    let (dir, shm) = small_shmlog(255);
    let mut log = shm.txlog();

    log.begin("req", 100, 99, "rxreq");
    log.append_text(Tag::ReqUrl, "/a");
    log.change_id("req", "restart", 101);
    log.append_text(Tag::ReqUrl, "/b");
    log.end();

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = drain_inner(&mut cursor);

    let summary: Vec<_> = records
        .iter()
        .map(|r| (r.tag().unwrap(), r.txid, r.text().unwrap_or("").to_string()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Tag::Begin, 100, "req 99 rxreq".to_string()),
            (Tag::ReqUrl, 100, "/a".to_string()),
            (Tag::Link, 100, "req 101 restart".to_string()),
            (Tag::End, 100, String::new()),
            (Tag::Begin, 101, "req 100 restart".to_string()),
            (Tag::ReqUrl, 101, "/b".to_string()),
            (Tag::End, 101, String::new()),
        ]
    );

    // After end() the writer is idle: no id, nothing buffered.
    assert_eq!(log.id(), 0);
    assert_eq!(log.buffered_bytes(), 0);
    log.flush(false);
    assert!(cursor.next().is_none());
}

#[test]
#[should_panic(expected = "no open transaction")]
fn test_end_without_begin_is_a_bug() {
    let (_dir, shm) = small_shmlog(255);
    let mut log = shm.txlog();
    log.end();
}

#[test]
fn test_sync_mode_flushes_every_append() {
    let dir = tempfile::tempdir().unwrap();
    let params = LogParams {
        log_space: 16 * 1024,
        sync_log: true,
        ..LogParams::default()
    };
    let shm = Shmlog::bootstrap(dir.path(), params).unwrap();
    let mut log = shm.txlog();

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    log.append_text(Tag::Debug, "one");
    assert_eq!(log.buffered_bytes(), 0);
    let records = drain_inner(&mut cursor);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text(), Some("one"));
}

#[test]
fn test_unbuffered_emit() {
    let (dir, shm) = small_shmlog(255);

    shm.emit_text(Tag::SessOpen, 7, "127.0.0.1 43210");
    shm.emit_fmt(Tag::SessClose, 7, format_args!("timeout {}", 5));

    let mut cursor = LogCursor::attach(dir.path()).unwrap();
    let records = cursor.drain();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].tag(), Some(Tag::SessOpen));
    assert_eq!(records[0].txid, 7);
    assert_eq!(records[0].text(), Some("127.0.0.1 43210"));
    assert_eq!(records[1].text(), Some("timeout 5"));
}

#[test]
fn test_buffered_bytes_accounts_padded_records() {
    let (_dir, shm) = small_shmlog(255);
    let mut log = shm.txlog();

    // "abc" + NUL = 4 bytes payload, one word; 8 header bytes on top.
    log.append_text(Tag::Debug, "abc");
    assert_eq!(log.buffered_bytes(), 12);
    assert_eq!(log.buffered_records(), 1);

    // 5 bytes payload rounds to two words.
    log.append_text(Tag::Debug, "abcd");
    assert_eq!(log.buffered_bytes(), 12 + 16);
    assert_eq!(log.buffered_records(), 2);
}
