//! Node identity, signing, and content hashing.

use std::fs;
use std::path::Path;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Address, Hash};

/// Address length in bytes; addresses are hex strings of this many bytes.
pub const ADDRESS_LEN: usize = 20;

/// 32-byte content digest used for every commitment in the system.
pub fn hash_bytes(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

pub fn address_from_public_key(public_key: &PublicKey) -> Address {
    let digest = hash_bytes(public_key.as_bytes());
    hex::encode(&digest[..ADDRESS_LEN])
}

/// Decodes a hex address into the raw byte form used as a storage key.
pub fn address_to_bytes(address: &str) -> ChainResult<Vec<u8>> {
    let bytes = hex::decode(address)
        .map_err(|err| ChainError::Config(format!("invalid address encoding: {err}")))?;
    if bytes.len() != ADDRESS_LEN {
        return Err(ChainError::Config(format!(
            "address must be {ADDRESS_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

pub fn address_from_bytes(bytes: &[u8]) -> Address {
    hex::encode(bytes)
}

fn decode_hex(label: &str, data: &str) -> ChainResult<Vec<u8>> {
    hex::decode(data).map_err(|err| ChainError::Crypto(format!("invalid {label} encoding: {err}")))
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKey> {
    PublicKey::from_bytes(&decode_hex("public key", data)?)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

fn signature_from_bytes(bytes: &[u8]) -> ChainResult<Signature> {
    Signature::from_bytes(bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))
}

/// Verifies a signature in the hex wire form signed transactions carry.
pub fn verify_hex_signature(
    public_key_hex: &str,
    signature_hex: &str,
    message: &[u8],
) -> ChainResult<()> {
    let public_key = public_key_from_hex(public_key_hex)?;
    let signature = signature_from_bytes(&decode_hex("signature", signature_hex)?)?;
    public_key
        .verify(message, &signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

/// Verifies a signature in the raw byte form the second witness carries.
pub fn verify_sig_bytes(public_key: &PublicKey, message: &[u8], sig: &[u8]) -> ChainResult<()> {
    let signature = signature_from_bytes(sig)?;
    public_key
        .verify(message, &signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

/// The node's signing identity: an ed25519 keypair plus the 20-byte address
/// derived from its public key.
///
/// The key file on disk records the derived address next to the key
/// material. A file whose address no longer matches its keys is refused on
/// load, so an edited or mixed-up key file cannot make the node sign blocks
/// under the wrong creator.
pub struct NodeKey {
    keypair: Keypair,
    address: Address,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    address: String,
    public_key: String,
    secret_key: String,
}

impl NodeKey {
    pub fn generate() -> Self {
        let keypair = Keypair::generate(&mut OsRng);
        let address = address_from_public_key(&keypair.public);
        Self { keypair, address }
    }

    pub fn load_or_generate(path: &Path) -> ChainResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let key = Self::generate();
            key.save(path)?;
            Ok(key)
        }
    }

    pub fn load(path: &Path) -> ChainResult<Self> {
        let raw = fs::read_to_string(path)?;
        let stored: KeyFile = toml::from_str(&raw)
            .map_err(|err| ChainError::Crypto(format!("failed to decode key file: {err}")))?;
        let secret = SecretKey::from_bytes(&decode_hex("secret key", &stored.secret_key)?)
            .map_err(|err| ChainError::Crypto(format!("invalid secret key bytes: {err}")))?;
        let public = public_key_from_hex(&stored.public_key)?;
        let keypair = Keypair { secret, public };
        let address = address_from_public_key(&keypair.public);
        if stored.address != address {
            return Err(ChainError::Crypto(format!(
                "key file claims address {} but its keys derive {address}",
                stored.address
            )));
        }
        Ok(Self { keypair, address })
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let stored = KeyFile {
            address: self.address.clone(),
            public_key: hex::encode(self.keypair.public.to_bytes()),
            secret_key: hex::encode(self.keypair.secret.to_bytes()),
        };
        let encoded = toml::to_string_pretty(&stored)
            .map_err(|err| ChainError::Crypto(format!("failed to encode key file: {err}")))?;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Raw keypair handed to the consensus engine seam.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixed_key() -> NodeKey {
        let secret = SecretKey::from_bytes(&[9u8; 32]).expect("secret");
        let public = PublicKey::from(&secret);
        let keypair = Keypair { secret, public };
        let address = address_from_public_key(&keypair.public);
        NodeKey { keypair, address }
    }

    #[test]
    fn address_is_twenty_bytes_of_pubkey_digest() {
        let key = fixed_key();
        assert_eq!(key.address().len(), ADDRESS_LEN * 2);
        assert_eq!(address_to_bytes(key.address()).unwrap().len(), ADDRESS_LEN);
    }

    #[test]
    fn key_file_round_trips_with_its_address() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let key = fixed_key();
        key.save(&path).unwrap();

        let loaded = NodeKey::load(&path).unwrap();
        assert_eq!(loaded.address(), key.address());
        assert_eq!(loaded.public().to_bytes(), key.public().to_bytes());
    }

    #[test]
    fn tampered_key_file_address_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let key = fixed_key();
        key.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let tampered = raw.replace(key.address().as_str(), &"ff".repeat(ADDRESS_LEN));
        std::fs::write(&path, tampered).unwrap();

        assert!(matches!(NodeKey::load(&path), Err(ChainError::Crypto(_))));
    }

    #[test]
    fn load_or_generate_reuses_an_existing_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let first = NodeKey::load_or_generate(&path).unwrap();
        let second = NodeKey::load_or_generate(&path).unwrap();
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn wire_signature_round_trip() {
        let key = fixed_key();
        let message = b"stem block digest";
        let signature = key.sign(message);

        verify_hex_signature(
            &hex::encode(key.public().to_bytes()),
            &hex::encode(signature.to_bytes()),
            message,
        )
        .unwrap();
        verify_sig_bytes(key.public(), message, &signature.to_bytes()).unwrap();

        assert!(verify_sig_bytes(key.public(), b"tampered", &signature.to_bytes()).is_err());
    }
}
