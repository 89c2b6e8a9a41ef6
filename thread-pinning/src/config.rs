use {
    crate::{affinity::PinStrategy, env::Environ, error::PinningError},
    serde::{Deserialize, Serialize},
};

/// Turns pinning on or off; pinning stays on unless set to a value other
/// than `yes`, `on`, `1` or `true`.
pub const PINNING_ENABLED_VAR: &str = "AGAVE_THREAD_PINNING";
/// Strategy name: `spread`, `core` or `logical`.
pub const PINNING_STRATEGY_VAR: &str = "AGAVE_THREAD_PINNING_STRATEGY";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinningConfig {
    pub enabled: bool,
    pub strategy: PinStrategy,
}

impl Default for PinningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: PinStrategy::Spread,
        }
    }
}

impl PinningConfig {
    /// Reads the config from `environ`, using defaults for unset keys.
    ///
    /// # Errors
    ///
    /// Returns [`PinningError::ParseError`] if the strategy is not a known name.
    pub fn from_env(environ: &Environ) -> Result<Self, PinningError> {
        let mut config = Self::default();
        if environ.exists(PINNING_ENABLED_VAR) {
            config.enabled = environ.is_enabled(PINNING_ENABLED_VAR);
        }
        if let Some(strategy) = environ.get(PINNING_STRATEGY_VAR) {
            config.strategy = strategy.parse()?;
        }
        Ok(config)
    }
}
