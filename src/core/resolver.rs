//! Purpose: Map logical addresses to substrate routing keys.
//! Exports: `KeyResolver`, `HashedKeyResolver`.
//! Role: Collaborator seam; the engine never inspects key structure.
//! Invariants: Resolution is deterministic; equal addresses yield equal keys.
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::uri::UUri;

pub trait KeyResolver: Send + Sync {
    fn resolve(&self, address: &UUri) -> Result<String, Error>;
}

/// Keys of the form `<prefix>/<sha256 hex of the long-form address>`.
#[derive(Clone, Debug)]
pub struct HashedKeyResolver {
    prefix: String,
}

impl HashedKeyResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for HashedKeyResolver {
    fn default() -> Self {
        Self::new("up")
    }
}

impl KeyResolver for HashedKeyResolver {
    fn resolve(&self, address: &UUri) -> Result<String, Error> {
        if address.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument)
                .with_message("address has no entity"));
        }
        let digest = Sha256::digest(address.to_string().as_bytes());
        let mut key = String::with_capacity(self.prefix.len() + 1 + digest.len() * 2);
        key.push_str(&self.prefix);
        key.push('/');
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(key, "{byte:02x}");
        }
        Ok(key)
    }
}
