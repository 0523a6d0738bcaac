//! Cryptographic primitives for DEFS
//!
//! Provides:
//! - SHA-256 content hashing and the double-SHA-256 file id
//! - RIPEMD160(SHA256(pub)) public-key hashes
//! - MD5-derived per-file keys for AES-128-CTR shard encryption
//! - ECDSA P-256 signing with DER-encoded signatures
//! - Mnemonic key derivation (PBKDF2 + BIP-32 master key)
//! - Base58Check addresses

use crate::error::{DefsError, Result};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::Read;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Per-file symmetric key size (MD5 output)
pub const FILE_KEY_SIZE: usize = 16;

/// Compressed SEC1 public key size
pub const PUBLIC_KEY_SIZE: usize = 33;

/// RIPEMD-160 output size
pub const PUB_KEY_HASH_SIZE: usize = 20;

/// Base58Check version byte for addresses
pub const ADDRESS_VERSION: u8 = 0x00;

/// Password prefix mixed into mnemonic key derivation
const MNEMONIC_PREFIX: &[u8] = b"BPFS";

/// PBKDF2 rounds for mnemonic key derivation
const MNEMONIC_ROUNDS: u32 = 4096;

/// HMAC key for the BIP-32 master key
const BIP32_SEED_KEY: &[u8] = b"Bitcoin seed";

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; PUB_KEY_HASH_SIZE] {
    Ripemd160::digest(sha256(data)).into()
}

/// Hex file id derived from a content hash: `hex(SHA256(file_hash))`
pub fn file_id_from_hash(file_hash: &[u8; 32]) -> String {
    hex::encode(sha256(file_hash))
}

/// Content hash and file id of a complete file
pub fn file_id(contents: &[u8]) -> ([u8; 32], String) {
    let file_hash = sha256(contents);
    let id = file_id_from_hash(&file_hash);
    (file_hash, id)
}

/// Content hash and file id of everything `reader` yields, read in
/// fixed-size blocks
pub fn file_id_reader<R: Read>(mut reader: R) -> Result<([u8; 32], String)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let file_hash: [u8; 32] = hasher.finalize().into();
    let id = file_id_from_hash(&file_hash);
    Ok((file_hash, id))
}

/// Per-file AES key: `MD5(file_hash)`
pub fn file_key(file_hash: &[u8; 32]) -> [u8; FILE_KEY_SIZE] {
    md5::compute(file_hash).0
}

/// AES-128-CTR with a zero initial counter. Encryption and decryption are the
/// same operation.
pub fn apply_keystream(key: &[u8; FILE_KEY_SIZE], data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    let mut cipher = Aes128Ctr::new(&(*key).into(), &[0u8; 16].into());
    cipher.apply_keystream(&mut buf);
    buf
}

/// ECDSA P-256 private key
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        Self(SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Create from a 32-byte big-endian scalar
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| DefsError::InvalidKey(e.to_string()))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| DefsError::InvalidKey(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Derive the owner key from a mnemonic and password.
    ///
    /// `seed = PBKDF2-HMAC-SHA256("BPFS" || password, mnemonic, 4096, 32)`,
    /// then the BIP-32 master private key of `seed` is used as the scalar.
    pub fn from_mnemonic(mnemonic: &str, password: &str) -> Result<Self> {
        let mut secret = MNEMONIC_PREFIX.to_vec();
        secret.extend_from_slice(password.as_bytes());

        let mut seed = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&secret, mnemonic.as_bytes(), MNEMONIC_ROUNDS, &mut seed);

        let mut mac = Hmac::<Sha512>::new_from_slice(BIP32_SEED_KEY)
            .map_err(|e| DefsError::Internal(e.to_string()))?;
        mac.update(&seed);
        let master = mac.finalize().into_bytes();
        Self::from_slice(&master[..32])
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().clone())
    }

    /// Sign `message` (hashed with SHA-256) and return the DER signature
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.0.sign(message);
        signature.to_der().as_bytes().to_vec()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&"[REDACTED]").finish()
    }
}

/// ECDSA P-256 public key
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse a SEC1 encoded point (compressed or uncompressed)
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        VerifyingKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|e| DefsError::InvalidKey(e.to_string()))
    }

    /// 33-byte compressed encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    /// `RIPEMD160(SHA256(compressed_pubkey))`
    pub fn pub_key_hash(&self) -> [u8; PUB_KEY_HASH_SIZE] {
        hash160(&self.to_bytes())
    }

    pub fn address(&self) -> String {
        pkh_to_address(&self.pub_key_hash())
    }

    /// Verify a DER signature over `message`. Malformed signatures, including
    /// zero `r` or `s`, verify as false.
    pub fn verify(&self, message: &[u8], der_signature: &[u8]) -> bool {
        match Signature::from_der(der_signature) {
            Ok(signature) => self.0.verify(message, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// Verify a DER signature given raw public key bytes
pub fn verify_signature(public_key: &[u8], message: &[u8], der_signature: &[u8]) -> bool {
    PublicKey::from_sec1_bytes(public_key)
        .map(|key| key.verify(message, der_signature))
        .unwrap_or(false)
}

/// Base58Check encode a public-key hash with version `0x00`
pub fn pkh_to_address(pkh: &[u8; PUB_KEY_HASH_SIZE]) -> String {
    let mut payload = Vec::with_capacity(1 + PUB_KEY_HASH_SIZE + 4);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pkh);
    let checksum = sha256d(&payload);
    payload.extend_from_slice(&checksum[..4]);
    bs58::encode(payload).into_string()
}

/// Decode a Base58Check address back to its public-key hash
pub fn address_to_pkh(address: &str) -> Result<[u8; PUB_KEY_HASH_SIZE]> {
    let invalid = |reason: &str| DefsError::InvalidAddress(format!("{}: {}", address, reason));

    let raw = bs58::decode(address)
        .into_vec()
        .map_err(|e| invalid(&e.to_string()))?;
    if raw.len() != 1 + PUB_KEY_HASH_SIZE + 4 {
        return Err(invalid("wrong length"));
    }

    let (payload, checksum) = raw.split_at(1 + PUB_KEY_HASH_SIZE);
    if sha256d(payload)[..4] != *checksum {
        return Err(invalid("bad checksum"));
    }
    if payload[0] != ADDRESS_VERSION {
        return Err(invalid("unknown version"));
    }

    let mut pkh = [0u8; PUB_KEY_HASH_SIZE];
    pkh.copy_from_slice(&payload[1..]);
    Ok(pkh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_file_id_is_double_sha256() {
        let (hash, id) = file_id(b"hello");
        assert_eq!(
            hex::encode(hash),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(id, hex::encode(sha256d(b"hello")));
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn test_file_id_reader_matches_in_memory() {
        let contents: Vec<u8> = (0..200_000).map(|i| (i % 241) as u8).collect();
        let streamed = file_id_reader(std::io::Cursor::new(&contents)).unwrap();
        assert_eq!(streamed, file_id(&contents));
        assert_eq!(file_id_reader(std::io::empty()).unwrap(), file_id(b""));
    }

    #[test]
    fn test_file_key_is_md5_of_hash() {
        let (hash, _) = file_id(b"content");
        assert_eq!(file_key(&hash), md5::compute(hash).0);
    }

    #[test]
    fn test_ctr_roundtrip() {
        let key = [7u8; FILE_KEY_SIZE];
        let plaintext = b"shard payload bytes".to_vec();
        let ciphertext = apply_keystream(&key, &plaintext);
        assert_ne!(ciphertext, plaintext);
        assert_eq!(ciphertext.len(), plaintext.len());
        assert_eq!(apply_keystream(&key, &ciphertext), plaintext);
    }

    #[test]
    fn test_ctr_is_deterministic_per_shard() {
        let key = [1u8; FILE_KEY_SIZE];
        let a = apply_keystream(&key, &[0u8; 64]);
        let b = apply_keystream(&key, &[0u8; 64]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_public_key_encoding() {
        let key = PrivateKey::generate();
        let public = key.public_key();
        let bytes = public.to_bytes();
        assert_eq!(bytes.len(), PUBLIC_KEY_SIZE);
        assert!(bytes[0] == 0x02 || bytes[0] == 0x03);
        assert_eq!(PublicKey::from_sec1_bytes(&bytes).unwrap(), public);
    }

    #[test]
    fn test_private_key_hex_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(restored.public_key(), key.public_key());
        assert!(PrivateKey::from_slice(&[0u8; 32]).is_err());
        assert!(format!("{:?}", key).contains("REDACTED"));
    }

    #[test]
    fn test_signature_is_der() {
        let key = PrivateKey::generate();
        let sig = key.sign(b"message");
        assert_eq!(sig[0], 0x30);
        assert_eq!(sig[1] as usize, sig.len() - 2);
    }

    #[test]
    fn test_zero_scalar_signature_rejected() {
        let key = PrivateKey::generate();
        // SEQUENCE { INTEGER 0, INTEGER 0 }
        let zero = [0x30, 0x06, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00];
        assert!(!key.public_key().verify(b"message", &zero));
    }

    #[test]
    fn test_mnemonic_derivation_is_deterministic() {
        let mnemonic = "abandon ability able about above absent absorb abstract absurd abuse access accident";
        let a = PrivateKey::from_mnemonic(mnemonic, "secret").unwrap();
        let b = PrivateKey::from_mnemonic(mnemonic, "secret").unwrap();
        let c = PrivateKey::from_mnemonic(mnemonic, "other").unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.to_bytes(), c.to_bytes());
    }

    #[test]
    fn test_known_address() {
        // Version 0 over an all-zero hash is the well-known burn address
        assert_eq!(
            pkh_to_address(&[0u8; PUB_KEY_HASH_SIZE]),
            "1111111111111111111114oLvT2"
        );
    }

    #[test]
    fn test_invalid_addresses_rejected() {
        assert!(address_to_pkh("").is_err());
        assert!(address_to_pkh("0OIl").is_err());
        assert!(address_to_pkh("1111111111111111111114oLvT3").is_err());

        let mut payload = vec![0x05];
        payload.extend_from_slice(&[9u8; PUB_KEY_HASH_SIZE]);
        let checksum = sha256d(&payload);
        payload.extend_from_slice(&checksum[..4]);
        let other_version = bs58::encode(payload).into_string();
        assert!(matches!(
            address_to_pkh(&other_version),
            Err(DefsError::InvalidAddress(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sign_verify(
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            flip in any::<proptest::sample::Index>(),
        ) {
            let key = PrivateKey::generate();
            let public = key.public_key();
            let sig = key.sign(&payload);
            prop_assert!(public.verify(&payload, &sig));
            prop_assert!(verify_signature(&public.to_bytes(), &payload, &sig));

            let mut tampered = payload.clone();
            tampered[flip.index(payload.len())] ^= 0x01;
            prop_assert!(!public.verify(&tampered, &sig));
        }

        #[test]
        fn prop_address_roundtrip(pkh in any::<[u8; 20]>()) {
            let address = pkh_to_address(&pkh);
            prop_assert_eq!(address_to_pkh(&address).unwrap(), pkh);
        }
    }
}
