//! Follow the shared-memory log of a running instance, like a tiny
//! external log reader would.

use std::path::PathBuf;
use std::time::Duration;

use sable_shmlog::LogCursor;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "/tmp/sable-demo".to_string()),
    );

    let mut cursor = LogCursor::attach(&dir)?;
    println!("attached, segment_n = {:#x}", cursor.head_segment_n());

    loop {
        let mut idle = true;
        while let Some(record) = cursor.next() {
            idle = false;
            let inner = match record.unbatch() {
                Some(inner) => inner,
                None => vec![record],
            };
            for rec in inner {
                let tag = rec
                    .tag()
                    .map(|t| t.name().to_string())
                    .unwrap_or_else(|| format!("tag#{}", rec.tag));
                match rec.text() {
                    Some(text) => println!("{:10} {:<12} {}", rec.txid, tag, text),
                    None => println!("{:10} {:<12} {} bytes", rec.txid, tag, rec.payload.len()),
                }
            }
        }
        if idle {
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
