//! Configuration for the arena and the speculation engine.

use crate::error::CacheError;

/// Default shared-memory region name.
pub const DEFAULT_SHM_NAME: &str = "SUFFIX_CACHE";

/// Default shared-memory region size: 500 GiB of (mostly untouched)
/// virtual address space.
pub const DEFAULT_SHM_SIZE: usize = 500 * 1024 * 1024 * 1024;

/// Default number of registry slots (distinct prompt fingerprints).
pub const DEFAULT_REGISTRY_SLOTS: usize = 65_536;

/// Configuration for the shared-memory arena.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// OS-visible name of the shared-memory region.
    pub name: String,
    /// Total region size in bytes.
    pub size_bytes: usize,
    /// Capacity of the fingerprint -> tree registry table.
    pub registry_slots: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SHM_NAME.to_string(),
            size_bytes: DEFAULT_SHM_SIZE,
            registry_slots: DEFAULT_REGISTRY_SLOTS,
        }
    }
}

impl ArenaConfig {
    /// Validate the configuration before creating an arena.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(CacheError::InvalidInput(format!(
                "invalid shared-memory name {:?}",
                self.name
            )));
        }
        if self.registry_slots == 0 {
            return Err(CacheError::InvalidInput(
                "registry_slots must be non-zero".into(),
            ));
        }
        // The region must at least hold the header, the registry table, and
        // one minimal tree.
        let min_size = 4096 + self.registry_slots * 24 + 64 * 1024;
        if self.size_bytes < min_size {
            return Err(CacheError::InvalidInput(format!(
                "arena of {} bytes is too small (need at least {min_size})",
                self.size_bytes
            )));
        }
        Ok(())
    }
}

/// Configuration for speculation and the per-request length controller.
#[derive(Debug, Clone)]
pub struct SpeculationConfig {
    /// Initial speculation length assigned to a freshly attached request.
    pub spec_start_len: usize,
    /// Upper bound for the adaptive speculation length.
    pub spec_max_len: usize,
    /// Minimum pattern-suffix length that is allowed to match. Shorter
    /// contexts are not informative enough to speculate from.
    pub min_match_len: usize,
    /// Default probability floor below which continuations are discarded.
    pub min_token_prob: f32,
    /// Number of trailing prompt tokens re-injected before each response in
    /// the upload stream, so that patterns straddling the prompt/response
    /// boundary remain matchable.
    pub prefix_reinjection: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            spec_start_len: 2,
            spec_max_len: 16,
            min_match_len: 3,
            min_token_prob: 0.1,
            prefix_reinjection: 5,
        }
    }
}

impl SpeculationConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.spec_start_len == 0 || self.spec_start_len > self.spec_max_len {
            return Err(CacheError::InvalidInput(format!(
                "speculation length bounds [{}, {}] are invalid",
                self.spec_start_len, self.spec_max_len
            )));
        }
        if self.min_match_len == 0 {
            return Err(CacheError::InvalidInput(
                "min_match_len must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_token_prob) {
            return Err(CacheError::InvalidInput(format!(
                "min_token_prob {} is outside [0, 1]",
                self.min_token_prob
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ArenaConfig::default().validate().unwrap();
        SpeculationConfig::default().validate().unwrap();
    }

    #[test]
    fn default_speculation_bounds() {
        let cfg = SpeculationConfig::default();
        assert_eq!(cfg.spec_start_len, 2);
        assert_eq!(cfg.spec_max_len, 16);
        assert_eq!(cfg.prefix_reinjection, 5);
    }

    #[test]
    fn rejects_zero_min_match() {
        let cfg = SpeculationConfig {
            min_match_len: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_spec_bounds() {
        let cfg = SpeculationConfig {
            spec_start_len: 32,
            spec_max_len: 16,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_tiny_arena() {
        let cfg = ArenaConfig {
            name: "t".into(),
            size_bytes: 1024,
            registry_slots: 16,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_slash_in_name() {
        let cfg = ArenaConfig {
            name: "a/b".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
