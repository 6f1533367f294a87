//! Persisted node identity
//!
//! The peer identity must be stable across restarts, so the ed25519 keypair
//! is written to disk on first start and reloaded afterwards.

use libp2p::identity::Keypair;
use libp2p::PeerId;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode stored key: {0}")]
    Decode(String),

    #[error("failed to encode key: {0}")]
    Encode(String),
}

/// Node identity backed by an ed25519 keypair.
pub struct NodeIdentity {
    keypair: Keypair,
}

impl NodeIdentity {
    /// Generate a fresh, non-persisted identity.
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::generate_ed25519(),
        }
    }

    /// Load the keypair from `path`, generating and persisting a new one if
    /// the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let keypair = Keypair::from_protobuf_encoding(&bytes)
                    .map_err(|e| IdentityError::Decode(e.to_string()))?;
                tracing::debug!("loaded node identity from {}", path.display());
                Ok(Self { keypair })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Keypair::generate_ed25519();
                let bytes = keypair
                    .to_protobuf_encoding()
                    .map_err(|e| IdentityError::Encode(e.to_string()))?;
                write_private(path, &bytes)?;
                tracing::info!("generated new node identity at {}", path.display());
                Ok(Self { keypair })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The libp2p keypair.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The peer identity derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.keypair.public())
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key");

        let first = NodeIdentity::load_or_generate(&path).unwrap();
        let second = NodeIdentity::load_or_generate(&path).unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn test_fresh_identities_differ() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }
}
