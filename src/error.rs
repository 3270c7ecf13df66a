use crate::hash::ContentHash;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} is not pending")]
    NotPending(ContentHash),

    #[error("{0} is already pending")]
    AlreadyPending(ContentHash),

    #[error("{0} is already complete")]
    AlreadyComplete(ContentHash),

    #[error("complete-{hash} does not resolve to a valid item directory (found {target:?})")]
    CorruptedLink { hash: ContentHash, target: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
