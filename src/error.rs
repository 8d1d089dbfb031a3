use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VcfError>;

/// Errors raised across the BGZF codec, the TBI/CSI/IDX index readers and
/// writers, the VCF text layer, and the sharder.
#[derive(thiserror::Error, Debug)]
pub enum VcfError {
    /// Short read/write, seek failure, or any other bare I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad magic/version, corrupt BGZF block, CRC/size mismatch, mis-sized
    /// name table, or any other structural decode failure.
    #[error("format error: {detail}")]
    Format { detail: String },

    /// Unsupported mode string, stdin used as a read source, out-of-order
    /// `add()`, or an `.idx` path missing the required suffix.
    #[error("usage error: {detail}")]
    Usage { detail: String },

    /// A parse failure while decoding one VCF record, with the offending
    /// line attached for diagnostics.
    #[error("failed to parse VCF record: {detail} (line: {line:?})")]
    RecordParse { detail: String, line: String },

    /// A user-supplied map closure failed inside a shard worker.
    #[error("shard {index} failed: {source}")]
    Shard {
        index: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The sharded run was cancelled (panic or explicit cancellation) before
    /// all shards reduced.
    #[error("sharded run cancelled")]
    Cancelled,
}

impl VcfError {
    pub fn format(detail: impl Into<String>) -> Self {
        VcfError::Format { detail: detail.into() }
    }

    pub fn usage(detail: impl Into<String>) -> Self {
        VcfError::Usage { detail: detail.into() }
    }

    pub fn record_parse(detail: impl Into<String>, line: impl fmt::Display) -> Self {
        VcfError::RecordParse { detail: detail.into(), line: line.to_string() }
    }
}
