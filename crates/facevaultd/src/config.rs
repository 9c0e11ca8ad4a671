use facevault_store::{ConfigError, StoreConfig};

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from `FACEVAULT_*` environment variables
/// and the optional TOML file named by `FACEVAULT_CONFIG`.
pub struct Config {
    pub store: StoreConfig,
    /// `FACEVAULT_BUS=system` selects the system bus (default: session).
    pub bus: Bus,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            store: StoreConfig::load()?,
            bus: parse_bus(std::env::var("FACEVAULT_BUS").ok().as_deref()),
        })
    }
}

fn parse_bus(value: Option<&str>) -> Bus {
    match value {
        Some("system") => Bus::System,
        _ => Bus::Session,
    }
}
