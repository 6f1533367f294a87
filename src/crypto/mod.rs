//! Content addressing primitives
//!
//! Self-certifying identifiers derived from file bytes.

mod hashing;

pub use hashing::{fingerprint_file, Fingerprint, FingerprintHasher};
