//! Publish a small record of host statistics, once per interval.
//!
//! The record goes into a `systemStats` allocation of the arena configured by the `SHM_ARENA_*`
//! environment, for instance when run under `shm-arena host`. Without a usable arena, it is printed
//! to stdout instead.
//!
//! Under a host, the publisher opens the arena and allocates its slot itself, which makes it the
//! single writer of the allocation table. Run at most one publisher per arena: two of them would
//! race on the bump pointer and overwrite each other's table.
use std::error::Error;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use shm_arena::{ArenaOptions, ArenaStats, IpcAllocator};
use tracing_subscriber::EnvFilter;

/// Room for the record, with plenty to spare.
const SLOT_SIZE: usize = 512;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemStats {
    sample: u64,
    timestamp: u64,
    load_average: Option<[f64; 3]>,
    arena: Option<ArenaStats>,
}

enum Sink {
    Arena { arena: IpcAllocator, offset: usize },
    Stdout,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let interval = std::env::args()
        .nth(1)
        .and_then(|num| num.parse().ok())
        .map_or(Duration::from_millis(1000), Duration::from_millis);

    let limit = std::env::args()
        .nth(2)
        .and_then(|num| num.parse().ok())
        .unwrap_or(u64::MAX);

    let mut sink = connect();

    for sample in 0..limit {
        let mut record = SystemStats {
            sample,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |since| since.as_secs()),
            load_average: load_average(),
            arena: None,
        };

        match &mut sink {
            Sink::Arena { arena, offset } => {
                record.arena = arena.stats().ok();
                if let Err(err) = arena.write_json(*offset, &record) {
                    tracing::error!(error = &err as &dyn Error, "failed to publish sample {sample}");
                }
            }
            Sink::Stdout => match serde_json::to_string(&record) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::error!("failed to print sample {sample}: {err}"),
            },
        }

        std::thread::sleep(interval);
    }
}

fn connect() -> Sink {
    let options = match ArenaOptions::from_env() {
        Ok(options) => options,
        Err(err) => {
            tracing::warn!(error = &err as &dyn Error, "invalid arena configuration, printing to stdout");
            return Sink::Stdout;
        }
    };

    let mut arena = IpcAllocator::new(options);

    // A host may have created the arena for us already.
    let attached = arena.open().or_else(|err| {
        tracing::debug!(error = &err as &dyn Error, "no arena to open, creating one");
        arena.init()
    });

    if let Err(err) = attached {
        tracing::warn!(error = &err as &dyn Error, "shared memory is unavailable, printing to stdout");
        return Sink::Stdout;
    }

    match arena.malloc(SLOT_SIZE, "systemStats") {
        Ok(block) => {
            tracing::info!(name = arena.name(), offset = block.offset, "publishing into arena");
            Sink::Arena {
                arena,
                offset: block.offset,
            }
        }
        Err(err) => {
            tracing::warn!(error = &err as &dyn Error, "no room in the arena, printing to stdout");
            Sink::Stdout
        }
    }
}

/// The 1, 5 and 15 minute load averages.
fn load_average() -> Option<[f64; 3]> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    let mut fields = text.split_whitespace().map(|field| field.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}
