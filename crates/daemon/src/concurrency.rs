//! Worker pool sizing.
//!
//! Derives the number of worker slots from the CPU core count unless the
//! configuration names one explicitly.

use crate::config::SchedulerConfig;

/// Upper bound for an explicit parallelism setting.
pub const MAX_PARALLELISM: u32 = 64;

/// Worker slot count for a scheduler configuration.
///
/// - Explicit non-zero `parallelism` is used as is (capped at [`MAX_PARALLELISM`])
/// - Otherwise one slot per 8 logical cores, clamped to 1..=8
pub fn derive_parallelism(cfg: &SchedulerConfig) -> u32 {
    if cfg.parallelism > 0 {
        cfg.parallelism.min(MAX_PARALLELISM)
    } else {
        parallelism_for_cores(num_cpus::get() as u32)
    }
}

/// Auto-derived slot count for a core count.
pub fn parallelism_for_cores(cores: u32) -> u32 {
    (cores / 8).clamp(1, 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_derived_parallelism_bounds(cores in 1u32..512) {
            let n = parallelism_for_cores(cores);
            prop_assert!((1..=8).contains(&n), "{} cores gave {} slots", cores, n);
            if cores >= 16 {
                prop_assert!(n >= 2);
            }
        }

        #[test]
        fn prop_explicit_parallelism_preserved(explicit in 1u32..=MAX_PARALLELISM) {
            let cfg = SchedulerConfig {
                parallelism: explicit,
                ..SchedulerConfig::default()
            };
            prop_assert_eq!(derive_parallelism(&cfg), explicit);
        }
    }

    #[test]
    fn test_explicit_parallelism_capped() {
        let cfg = SchedulerConfig {
            parallelism: 1000,
            ..SchedulerConfig::default()
        };
        assert_eq!(derive_parallelism(&cfg), MAX_PARALLELISM);
    }

    #[test]
    fn test_auto_parallelism_is_positive() {
        assert!(derive_parallelism(&SchedulerConfig::default()) >= 1);
    }
}
