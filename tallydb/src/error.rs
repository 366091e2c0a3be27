use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Query(#[from] tallydb_query::Error),

    #[error(transparent)]
    Storage(#[from] tallydb_storage::Error),
}
