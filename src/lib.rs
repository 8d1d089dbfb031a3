//! Coordinate-sorted VCF I/O with BGZF framing and TBI/CSI/IDX random
//! access, plus a rayon-backed sharder for parallel interval processing.

pub mod bgzf;
pub mod config;
pub mod error;
pub mod index;
pub mod sharder;
pub mod vcf;

pub use config::Config;
pub use error::{Result, VcfError};
pub use sharder::{cut, Cse, Sharder};
pub use vcf::{HeaderCatalog, VcfReader, VcfWriter};
