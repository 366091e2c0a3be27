use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("end of period cannot come before its start")]
    InvalidPeriod,

    /// Another caller is filling one or more of the period's blocks.
    /// Transient; retry after a short delay.
    #[error("{count} block(s) for this period are still being filled")]
    DraftBlocksPresent { count: usize },

    #[error("failed filling block [{start}, {end}]")]
    BlockFillFailed {
        start: i64,
        end: i64,
        #[source]
        source: tallydb_storage::Error,
    },

    #[error("query signature lookup-or-insert failed")]
    SignatureInsertFailed(#[source] tallydb_storage::Error),

    #[error("unknown block type: {0}")]
    UnknownBlockType(String),

    #[error("invalid datetime: {0}")]
    InvalidDate(String),

    #[error(transparent)]
    Storage(#[from] tallydb_storage::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
