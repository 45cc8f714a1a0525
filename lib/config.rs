//! Run-wide configuration.
//!
//! The choice of symmetry backend is made once for an entire run and must agree
//! between every [`Basis`][crate::basis::Basis] that will ever be combined, so
//! it is carried in an explicit [`EngineConfig`] value that is handed to every
//! constructor rather than kept in global state.
//!
//! Configurations can be read from TOML:
//! ```toml
//! symmetry = "su2"   # or "local"
//! qn_base = 256
//! threads = 4        # 0 = one per logical CPU
//!
//! [truncation]
//! tolerance = 1e-8
//! min_kept = 16
//! ```

use std::{ fmt, path::Path };
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Returned when the configuration file can't be read.
    #[error("error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when the configuration text isn't valid TOML, holds an unknown
    /// key, or holds a value of the wrong type.
    #[error("error parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Returned when a key holds a value outside its allowed range.
    #[error("error in config: bad value for '{0}': {1}")]
    BadValue(String, String),
}
use ConfigError::*;
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Selects one of the two interchangeable symmetry backends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymmetryKind {
    /// Abelian symmetries only; quantum numbers compose by addition.
    #[default]
    #[serde(alias = "abelian")]
    Local,
    /// Non-abelian SU(2) spin symmetry.
    #[serde(alias = "su(2)", alias = "non-abelian")]
    Su2,
}

impl SymmetryKind {
    /// Return `true` for [`Self::Su2`].
    pub fn is_su2(self) -> bool { matches!(self, Self::Su2) }
}

impl fmt::Display for SymmetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Su2 => write!(f, "su2"),
        }
    }
}

/// Parameters steering which states are discarded by
/// [`Basis::change_basis`][crate::basis::Basis::change_basis].
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TruncationParams {
    /// Total weight that may be discarded beyond the requested number of kept
    /// states. Zero disables tolerance-based truncation.
    pub tolerance: f64,
    /// Never keep fewer than this many states when applying the tolerance.
    pub min_kept: usize,
}

impl Default for TruncationParams {
    fn default() -> Self { Self { tolerance: 0.0, min_kept: 1 } }
}

/// Everything a run needs to agree on before the first basis is built.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Active symmetry backend.
    pub symmetry: SymmetryKind,
    /// Radix for the quantum-number encoder; every individual label must be
    /// strictly less than this.
    pub qn_base: u64,
    /// Truncation controls.
    pub truncation: TruncationParams,
    /// Number of worker threads for the batched multiplier. `0` means one per
    /// logical CPU and `1` means everything runs on the calling thread.
    pub threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symmetry: SymmetryKind::Local,
            qn_base: 256,
            truncation: TruncationParams::default(),
            threads: 1,
        }
    }
}

impl EngineConfig {
    /// Create a new default configuration using a particular backend.
    pub fn with_symmetry(symmetry: SymmetryKind) -> Self {
        Self { symmetry, ..Self::default() }
    }

    /// Parse a configuration from TOML text. Missing keys take their default
    /// values.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        if config.qn_base < 2 {
            return Err(BadValue("qn_base".into(), "must be at least 2".into()));
        }
        let tol = config.truncation.tolerance;
        if !(0.0..=1.0).contains(&tol) {
            return Err(BadValue(
                "truncation.tolerance".into(), format!("{tol} is outside [0, 1]")));
        }
        Ok(config)
    }

    /// Read a configuration from a TOML file.
    pub fn from_file<P>(path: P) -> ConfigResult<Self>
    where P: AsRef<Path>
    {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Resolve [`Self::threads`] to an actual thread count.
    pub fn worker_threads(&self) -> usize {
        if self.threads == 0 { num_cpus::get() } else { self.threads }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.symmetry, SymmetryKind::Local);
    }

    #[test]
    fn full_table() {
        let text = r#"
            symmetry = "su2"
            qn_base = 64
            threads = 3

            [truncation]
            tolerance = 1e-6
            min_kept = 8
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.symmetry, SymmetryKind::Su2);
        assert_eq!(config.qn_base, 64);
        assert_eq!(config.threads, 3);
        assert_eq!(config.truncation.tolerance, 1e-6);
        assert_eq!(config.truncation.min_kept, 8);
    }

    #[test]
    fn unknown_key() {
        let err = EngineConfig::from_toml_str("symmetri = \"local\"").unwrap_err();
        assert!(matches!(err, Parse(_)));
        assert!(err.to_string().contains("symmetri"));
        let err = EngineConfig::from_toml_str("[truncation]\nfoo = 1").unwrap_err();
        assert!(matches!(err, Parse(_)));
        assert!(err.to_string().contains("foo"));
    }

    #[test]
    fn symmetry_aliases() {
        let config = EngineConfig::from_toml_str("symmetry = \"abelian\"").unwrap();
        assert_eq!(config.symmetry, SymmetryKind::Local);
        let config = EngineConfig::from_toml_str("symmetry = \"non-abelian\"").unwrap();
        assert_eq!(config.symmetry, SymmetryKind::Su2);
    }

    #[test]
    fn bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("symmetry = \"u1xu1\""),
            Err(Parse(_)),
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("qn_base = 1"),
            Err(BadValue(..)),
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("threads = -2"),
            Err(Parse(_)),
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[truncation]\ntolerance = 2.0"),
            Err(BadValue(..)),
        ));
    }

    #[test]
    fn worker_threads_resolves_zero() {
        let config = EngineConfig { threads: 0, ..EngineConfig::default() };
        assert!(config.worker_threads() >= 1);
        assert_eq!(EngineConfig::default().worker_threads(), 1);
    }
}
