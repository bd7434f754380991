//! Static token verification.
//!
//! The config carries `(subject, sha256)` pairs; a presented token is
//! hashed and looked up. Nothing is cached: revocation is a config reload
//! away and failed lookups stay cheap.

use crate::config::{ConfigError, TokenEntry};
use sb_core::collab::{Subject, TokenVerifier};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub struct StaticTokenVerifier {
    subjects: HashMap<Vec<u8>, String>,
}

impl StaticTokenVerifier {
    pub fn from_entries(entries: &[TokenEntry]) -> Result<Self, ConfigError> {
        let mut subjects = HashMap::new();
        for entry in entries {
            let digest = hex::decode(&entry.sha256).map_err(|_| {
                ConfigError::Invalid(format!(
                    "auth token for '{}' is not valid hex",
                    entry.subject
                ))
            })?;
            if digest.len() != 32 {
                return Err(ConfigError::Invalid(format!(
                    "auth token for '{}' must be a sha256 digest (64 hex chars)",
                    entry.subject
                )));
            }
            subjects.insert(digest, entry.subject.clone());
        }
        Ok(Self { subjects })
    }

    /// Build a verifier accepting exactly one raw token. Test convenience.
    pub fn single(subject: &str, raw_token: &str) -> Self {
        let mut subjects = HashMap::new();
        subjects.insert(
            Sha256::digest(raw_token.as_bytes()).to_vec(),
            subject.to_owned(),
        );
        Self { subjects }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Subject, String> {
        let digest = Sha256::digest(token.as_bytes());
        match self.subjects.get(digest.as_slice()) {
            Some(subject) => Ok(Subject {
                id: subject.clone(),
            }),
            None => Err("unknown or revoked token".to_owned()),
        }
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
