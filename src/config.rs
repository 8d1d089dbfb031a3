//! Environment-derived configuration, consulted only at the outermost
//! constructors (per the "Global state" design note: environment is read
//! once into a plain struct, never re-read deep inside leaf functions).

use std::path::PathBuf;

pub const DEFAULT_MIN_SHIFT: u32 = 14;
pub const DEFAULT_TBI_DEPTH: u32 = 5;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Index flavour requested via `VCF_INDEX_TYPE`.
    pub index_kind_gz: IndexKindGz,
    pub index_kind_plain: IndexKindPlain,
    /// Directory for shard temp files, from `SENTIEON_TMPDIR`.
    pub tmpdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKindGz {
    Tbi,
    Csi { min_shift: u32, depth: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKindPlain {
    Linear,
    IntervalTree,
}

impl Config {
    /// Build configuration from the process environment. Call once at each
    /// outermost entry point (`Tabix`/`TribbleIndex`/`Sharder` constructors);
    /// never call `std::env::var` from inner code.
    pub fn from_env() -> Self {
        Config {
            index_kind_gz: parse_gz_index_type(std::env::var("VCF_INDEX_TYPE").ok().as_deref()),
            index_kind_plain: parse_plain_index_type(
                std::env::var("VCF_INDEX_TYPE").ok().as_deref(),
            ),
            tmpdir: std::env::var_os("SENTIEON_TMPDIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        }
    }

    /// A configuration with defaults, ignoring the environment. Useful for
    /// tests that must not depend on process-wide state.
    pub fn defaults() -> Self {
        Config {
            index_kind_gz: IndexKindGz::Tbi,
            index_kind_plain: IndexKindPlain::Linear,
            tmpdir: std::env::temp_dir(),
        }
    }
}

fn parse_gz_index_type(raw: Option<&str>) -> IndexKindGz {
    let raw = match raw {
        Some(r) => r,
        None => return IndexKindGz::Tbi,
    };
    let mut parts = raw.split(':');
    match parts.next().and_then(|s| s.parse::<u32>().ok()) {
        Some(2) => {
            let min_shift = parts
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MIN_SHIFT);
            let depth = parts
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TBI_DEPTH);
            IndexKindGz::Csi { min_shift, depth }
        }
        _ => IndexKindGz::Tbi,
    }
}

fn parse_plain_index_type(raw: Option<&str>) -> IndexKindPlain {
    match raw.and_then(|s| s.split(':').next()).and_then(|s| s.parse::<u32>().ok()) {
        Some(2) => IndexKindPlain::IntervalTree,
        _ => IndexKindPlain::Linear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gz_index_is_tbi() {
        assert_eq!(parse_gz_index_type(None), IndexKindGz::Tbi);
        assert_eq!(parse_gz_index_type(Some("1")), IndexKindGz::Tbi);
        assert_eq!(parse_gz_index_type(Some("bogus")), IndexKindGz::Tbi);
    }

    #[test]
    fn csi_with_explicit_shift_and_depth() {
        assert_eq!(
            parse_gz_index_type(Some("2:15:6")),
            IndexKindGz::Csi { min_shift: 15, depth: 6 }
        );
        assert_eq!(
            parse_gz_index_type(Some("2")),
            IndexKindGz::Csi { min_shift: DEFAULT_MIN_SHIFT, depth: DEFAULT_TBI_DEPTH }
        );
    }

    #[test]
    fn default_plain_index_is_linear() {
        assert_eq!(parse_plain_index_type(None), IndexKindPlain::Linear);
        assert_eq!(parse_plain_index_type(Some("3")), IndexKindPlain::Linear);
    }

    #[test]
    fn plain_interval_tree_selected_by_two() {
        assert_eq!(parse_plain_index_type(Some("2")), IndexKindPlain::IntervalTree);
    }
}
