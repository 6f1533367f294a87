//! Node identity management

mod keys;

pub use keys::{IdentityError, NodeIdentity};
