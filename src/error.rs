use thiserror::Error;

use crate::store::{ErrorKind, StoreError};

#[derive(Debug, Clone, Error)]
pub enum CloudantError {
    #[error("missing cloudant configuration: {0}")]
    Configuration(String),

    #[error("_id and _rev are required to delete a document")]
    MissingReference,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CloudantError {
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudantError::Store(err) => err.kind() == ErrorKind::NotFound,
            _ => false,
        }
    }
}
