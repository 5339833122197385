use crate::log::LogError;
use crate::sst::SstError;
use crate::table::TableError;

#[derive(Debug, thiserror::Error)]
pub enum DifferError {
    #[error("{0} is not attached")]
    NotAttached(&'static str),

    #[error("diff traversal exceeded {levels} levels; compaction DAG is corrupt")]
    TraversalLimit { levels: usize },

    #[error("invalid SST file name {0:?}")]
    InvalidSstName(String),

    #[error("unable to locate SST file {0}")]
    SstNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("sst error: {0}")]
    Sst(#[from] SstError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DifferError> = std::result::Result<T, E>;
