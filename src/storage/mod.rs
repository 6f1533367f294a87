//! Local shared-file catalog
//!
//! The catalog tracks which files this peer is sharing. Durable persistence
//! lives behind the [`SharedCatalog`] trait; the core only adds, lists and
//! looks up entries through it.

mod catalog;

pub use catalog::{MemoryCatalog, SharedCatalog, SharedFile};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("file not found in catalog: {0}")]
    NotFound(String),

    #[error("catalog store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
