// Logging setup for racelink
// tracing output goes to stderr, or to a file when --debug is given

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PATH: &str = "/tmp/racelink-debug.log";

/// Filter used when `RUST_LOG` is not set
fn default_directives(debug: bool) -> &'static str {
    if debug {
        "racelink=debug,signaling_server=debug,info"
    } else {
        "warn"
    }
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(debug)))
}

/// Install the global subscriber
///
/// With `debug` the log file is truncated and gets a header, and every
/// event from then on is appended to it. `RUST_LOG` overrides the level
/// either way. Calling this more than once keeps the first subscriber.
pub fn init(debug: bool) -> io::Result<()> {
    if !debug {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter(false))
            .with_writer(io::stderr)
            .try_init();
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(LOG_FILE_PATH)?;

    writeln!(file, "=== racelink debug log ===")?;
    writeln!(file, "Session started: {:?}", SystemTime::now())?;
    writeln!(file, "To monitor: tail -f {}", LOG_FILE_PATH)?;
    writeln!(file, "==========================\n")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(true))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}
