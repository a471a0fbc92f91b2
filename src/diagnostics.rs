//! Rank-prefixed diagnostics.
//!
//! Every log line carries the MPI-style rank of this process so that output
//! from many ranks can be interleaved and still attributed. Severity maps to
//! the `[info]`, `[warning]` and `[fatal]` prefixes used by all tools that
//! parse the run log.

use log::LevelFilter;
use std::io::Write;

fn level_tag(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "[fatal]",
        log::Level::Warn => "[warning]",
        log::Level::Info => "[info]",
        log::Level::Debug => "[debug]",
        log::Level::Trace => "[trace]",
    }
}

/// Initialise the process-wide logger. Safe to call more than once (tests);
/// only the first call wins.
pub fn init(rank: usize) {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .filter_level(LevelFilter::Info)
        .format(move |buf, record| {
            writeln!(
                buf,
                "rank {}: {} {}",
                rank,
                level_tag(record.level()),
                record.args()
            )
        });
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_tags() {
        assert_eq!(level_tag(log::Level::Error), "[fatal]");
        assert_eq!(level_tag(log::Level::Warn), "[warning]");
        assert_eq!(level_tag(log::Level::Info), "[info]");
    }
}
