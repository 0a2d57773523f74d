use log::{LevelFilter, Log, Metadata, Record};

static LOGGER: Logger = Logger {
    crate_target: "ikev2_core",
};

/// Installs a stdout logger; messages from other crates are limited to warnings.
pub fn setup_logger(max_level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Logger {
    crate_target: &'static str,
}

impl Logger {
    fn is_own_target(&self, target: &str) -> bool {
        target == self.crate_target
            || target
                .strip_prefix(self.crate_target)
                .is_some_and(|rest| rest.starts_with("::"))
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
            && (self.is_own_target(metadata.target()) || metadata.level() <= log::Level::Warn)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        println!(
            "{} {} -- {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Formats bytes as space-separated hex, for SPIs, nonces and other opaque values.
pub fn fmt_slice_hex(data: &[u8]) -> HexSlice<'_> {
    HexSlice(data)
}

pub struct HexSlice<'a>(&'a [u8]);

impl std::fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hex() {
        assert_eq!(fmt_slice_hex(&[0x01, 0xab, 0xff]).to_string(), "01 ab ff");
        assert_eq!(fmt_slice_hex(&[]).to_string(), "");
    }

    #[test]
    fn filters_targets() {
        assert!(LOGGER.is_own_target("ikev2_core"));
        assert!(LOGGER.is_own_target("ikev2_core::ikev2::session"));
        assert!(!LOGGER.is_own_target("ikev2_core_extra"));
        assert!(!LOGGER.is_own_target("tokio::runtime"));
    }
}
