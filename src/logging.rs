use std::io::Write;

use chrono::Local;
use env_logger::Builder;
use log::Level;

/// Installs the process logger. `RUST_LOG`, when set, overrides `level`.
/// Returns false if a logger was already installed.
pub fn init(level: Level) -> bool {
    let mut builder = Builder::new();
    builder
        .filter_level(level.to_level_filter())
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let installed = init(Level::Debug);
        if installed && std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(log::max_level(), log::LevelFilter::Debug);
        }
        assert!(!init(Level::Info));
    }
}
