//! Emit a synthetic request workload into the shared-memory log.
//!
//! Run together with `log_tail` pointed at the same directory:
//!
//! ```bash
//! cargo run --example log_writer -- /tmp/sable-demo
//! cargo run --example log_tail -- /tmp/sable-demo
//! ```

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sable::params::LogParams;
use sable::tags::Tag;
use sable_shmlog::Shmlog;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    sable_shmlog::init_tracing();

    let dir = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "/tmp/sable-demo".to_string()),
    );
    std::fs::create_dir_all(&dir)?;

    let params = LogParams {
        log_space: 1024 * 1024,
        ..LogParams::default()
    };
    let shm = Shmlog::bootstrap(&dir, params)?;
    println!("writing into {}", shm.arena().path().display());

    let mut log = shm.txlog();
    let urls = ["/", "/index.html", "/api/items", "/static/logo.png"];
    loop {
        for (i, url) in urls.iter().enumerate() {
            let txid = shm.next_txid();
            let start = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
            let mut prev = start;

            log.begin("req", txid, 0, "rxreq");
            log.append_text(Tag::ReqMethod, "GET");
            log.append_text(Tag::ReqUrl, url);
            log.append_text(Tag::ReqProtocol, "HTTP/1.1");
            log.append_fmt(Tag::RespStatus, format_args!("{}", 200));
            if i % 2 == 0 {
                log.append_text(Tag::Hit, "cached object");
            } else {
                log.append_text(Tag::Miss, "fetched from backend");
            }
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
            log.append_ts("Resp", start, &mut prev, now);
            log.end();

            std::thread::sleep(Duration::from_millis(250));
        }
    }
}
