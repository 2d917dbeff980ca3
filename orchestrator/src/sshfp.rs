//! SSH host key fingerprints and SSHFP records.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// SSHFP fingerprint type for SHA-256 (RFC 6594).
pub const FP_TYPE_SHA256: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyType {
    Rsa,
    Ecdsa,
    Ed25519,
}

impl KeyType {
    pub const ALL: [KeyType; 3] = [KeyType::Rsa, KeyType::Ecdsa, KeyType::Ed25519];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Rsa => "RSA",
            KeyType::Ecdsa => "ECDSA",
            KeyType::Ed25519 => "ED25519",
        }
    }

    /// Name the key service knows the key type by.
    pub fn registrar_name(&self) -> &'static str {
        match self {
            KeyType::Rsa => "sshrsa",
            KeyType::Ecdsa => "sshecdsa",
            KeyType::Ed25519 => "sshed25519",
        }
    }

    /// SSHFP algorithm number (RFC 4255, 6594, 7479).
    pub fn sshfp_algorithm(&self) -> u8 {
        match self {
            KeyType::Rsa => 1,
            KeyType::Ecdsa => 3,
            KeyType::Ed25519 => 4,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshfpRecord {
    pub algorithm: u8,
    pub fp_type: u8,
    /// Lowercase hex
    pub fingerprint: String,
}

/// An OpenSSH public key line, `<type> <base64 blob> [comment]`.
#[derive(Debug, Clone)]
pub struct PublicKey {
    text: String,
    blob: Vec<u8>,
}

impl PublicKey {
    pub fn parse(text: &str) -> Result<Self> {
        let encoded = text
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| Error::InvalidInput(format!("not an SSH public key: {text:?}")))?;
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidInput(format!("bad SSH public key encoding: {e}")))?;

        Ok(Self {
            text: text.trim().to_string(),
            blob,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn digest(&self) -> Vec<u8> {
        Sha256::digest(&self.blob).to_vec()
    }

    /// `SHA256:<base64>` as printed by `ssh-keygen -l`.
    pub fn sha256_fingerprint(&self) -> String {
        format!("SHA256:{}", STANDARD_NO_PAD.encode(self.digest()))
    }

    pub fn sshfp(&self, key_type: KeyType) -> SshfpRecord {
        SshfpRecord {
            algorithm: key_type.sshfp_algorithm(),
            fp_type: FP_TYPE_SHA256,
            fingerprint: hex::encode(self.digest()),
        }
    }
}
