//! Additive-homomorphic encryption of cohort counts.
//!
//! Two providers are available.  [`Encryption::Identity`] passes counts
//! through as decimal strings and is meant for tests and development.
//! [`Encryption::ElGamal`] is exponential ElGamal over secp256k1: a count
//! `m` encrypted under public key `P` becomes the pair `(rG, mG + rP)`.
//! Adding two ciphertexts component-wise yields an encryption of the sum,
//! and the key holder recovers `mG` and solves the small discrete log.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::Field;
use k256::{AffinePoint, EncodedPoint, ProjectivePoint, PublicKey, Scalar, SecretKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

/// Largest plaintext the ElGamal provider will search for when decrypting.
pub const MAX_DECRYPTABLE: u64 = 1 << 20;

const BABY_STEPS: u64 = 1 << 10;

const POINT_SEPARATOR: char = '.';

/// Opaque encrypted count as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ciphertext(String);

impl Ciphertext {
    /// Wraps an already-encoded ciphertext.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encoded ciphertext text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised by the encryption providers.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// Public key material could not be decoded.
    #[error("invalid public key: {0}")]
    PublicKey(String),
    /// Ciphertext text could not be decoded.
    #[error("invalid ciphertext: {0}")]
    Ciphertext(String),
    /// The decrypted value exceeded the searchable range.
    #[error("plaintext exceeds decryptable range of {MAX_DECRYPTABLE}")]
    OutOfRange,
    /// The identity provider overflowed while adding counts.
    #[error("count overflow")]
    Overflow,
    /// Reading or writing the key file failed.
    #[error("key I/O error: {0}")]
    Io(String),
    /// The stored secret key was malformed.
    #[error("key decode error: {0}")]
    KeyDecode(String),
}

/// Exponential ElGamal key pair held by this client.
#[derive(Clone)]
pub struct AggregationKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl fmt::Debug for AggregationKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationKeyPair")
            .field("public", &self.public_key_material())
            .finish_non_exhaustive()
    }
}

impl AggregationKeyPair {
    /// Generates a fresh random key pair.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Rebuilds a key pair from its secret half.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Decodes a hex-encoded secret scalar.
    pub fn from_hex(input: &str) -> Result<Self, EncryptionError> {
        let bytes =
            hex::decode(input.trim()).map_err(|err| EncryptionError::KeyDecode(err.to_string()))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|err| EncryptionError::KeyDecode(err.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    /// Hex encoding of the secret scalar.
    pub fn to_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Loads the key from `path`, generating and persisting one if missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, EncryptionError> {
        if path.exists() {
            let contents =
                fs::read_to_string(path).map_err(|err| EncryptionError::Io(err.to_string()))?;
            return Self::from_hex(&contents);
        }
        let pair = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| EncryptionError::Io(err.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, pair.to_hex()).map_err(|err| EncryptionError::Io(err.to_string()))?;
        fs::rename(&tmp, path).map_err(|err| EncryptionError::Io(err.to_string()))?;
        Ok(pair)
    }

    /// Base64 compressed SEC1 encoding of the public key.
    pub fn public_key_material(&self) -> String {
        BASE64.encode(self.public.to_encoded_point(true).as_bytes())
    }
}

/// Encryption provider selected at construction.
#[derive(Debug, Clone)]
pub enum Encryption {
    /// No-op provider: ciphertexts are decimal counts.
    Identity,
    /// Exponential ElGamal over secp256k1 with this client's key pair.
    ElGamal(AggregationKeyPair),
}

impl Encryption {
    /// Key material other group members encrypt under when this client delegates.
    pub fn public_key(&self) -> String {
        match self {
            Self::Identity => String::new(),
            Self::ElGamal(pair) => pair.public_key_material(),
        }
    }

    /// Encrypts `plaintext` under the group's aggregation public key.
    pub fn encrypt(&self, plaintext: u64, public_key: &str) -> Result<Ciphertext, EncryptionError> {
        match self {
            Self::Identity => Ok(Ciphertext(plaintext.to_string())),
            Self::ElGamal(_) => {
                let target = decode_public_key(public_key)?;
                let r = Scalar::random(&mut OsRng);
                let c1 = ProjectivePoint::GENERATOR * r;
                let c2 = ProjectivePoint::GENERATOR * Scalar::from(plaintext) + target * r;
                Ok(encode_pair(&c1, &c2))
            }
        }
    }

    /// Decrypts a ciphertext addressed to this client's key pair.
    pub fn decrypt(&self, ciphertext: &Ciphertext) -> Result<u64, EncryptionError> {
        match self {
            Self::Identity => parse_identity(ciphertext),
            Self::ElGamal(pair) => {
                let (c1, c2) = decode_pair(ciphertext)?;
                let x = *pair.secret.to_nonzero_scalar();
                let message_point = c2 - c1 * x;
                discrete_log(&message_point)
            }
        }
    }

    /// Homomorphic addition: the result decrypts to the sum of both inputs.
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, EncryptionError> {
        match self {
            Self::Identity => {
                let sum = parse_identity(a)?
                    .checked_add(parse_identity(b)?)
                    .ok_or(EncryptionError::Overflow)?;
                Ok(Ciphertext(sum.to_string()))
            }
            Self::ElGamal(_) => {
                let (a1, a2) = decode_pair(a)?;
                let (b1, b2) = decode_pair(b)?;
                Ok(encode_pair(&(a1 + b1), &(a2 + b2)))
            }
        }
    }
}

fn parse_identity(ciphertext: &Ciphertext) -> Result<u64, EncryptionError> {
    ciphertext
        .0
        .parse()
        .map_err(|_| EncryptionError::Ciphertext(ciphertext.0.clone()))
}

fn decode_public_key(material: &str) -> Result<ProjectivePoint, EncryptionError> {
    let bytes = BASE64
        .decode(material)
        .map_err(|err| EncryptionError::PublicKey(err.to_string()))?;
    let key = PublicKey::from_sec1_bytes(&bytes)
        .map_err(|err| EncryptionError::PublicKey(err.to_string()))?;
    Ok(key.to_projective())
}

fn encode_point(point: &ProjectivePoint) -> String {
    BASE64.encode(AffinePoint::from(*point).to_encoded_point(true).as_bytes())
}

fn decode_point(text: &str) -> Result<ProjectivePoint, EncryptionError> {
    let bytes = BASE64
        .decode(text)
        .map_err(|err| EncryptionError::Ciphertext(err.to_string()))?;
    let encoded = EncodedPoint::from_bytes(&bytes)
        .map_err(|err| EncryptionError::Ciphertext(err.to_string()))?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();
    affine
        .map(ProjectivePoint::from)
        .ok_or_else(|| EncryptionError::Ciphertext("point not on curve".to_string()))
}

fn encode_pair(c1: &ProjectivePoint, c2: &ProjectivePoint) -> Ciphertext {
    Ciphertext(format!(
        "{}{POINT_SEPARATOR}{}",
        encode_point(c1),
        encode_point(c2)
    ))
}

fn decode_pair(ciphertext: &Ciphertext) -> Result<(ProjectivePoint, ProjectivePoint), EncryptionError> {
    let (first, second) = ciphertext
        .0
        .split_once(POINT_SEPARATOR)
        .ok_or_else(|| EncryptionError::Ciphertext("expected two points".to_string()))?;
    Ok((decode_point(first)?, decode_point(second)?))
}

fn point_key(point: &ProjectivePoint) -> Vec<u8> {
    AffinePoint::from(*point)
        .to_encoded_point(true)
        .as_bytes()
        .to_vec()
}

// jG -> j for j in [0, BABY_STEPS), built on first decryption.
fn baby_steps() -> &'static HashMap<Vec<u8>, u64> {
    static TABLE: OnceLock<HashMap<Vec<u8>, u64>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::with_capacity(BABY_STEPS as usize);
        let mut acc = ProjectivePoint::IDENTITY;
        for j in 0..BABY_STEPS {
            table.insert(point_key(&acc), j);
            acc += ProjectivePoint::GENERATOR;
        }
        table
    })
}

/// Baby-step giant-step search for `m` in `[0, MAX_DECRYPTABLE]` with `mG == target`.
fn discrete_log(target: &ProjectivePoint) -> Result<u64, EncryptionError> {
    let table = baby_steps();
    let giant = -(ProjectivePoint::GENERATOR * Scalar::from(BABY_STEPS));
    let mut gamma = *target;
    for i in 0..=MAX_DECRYPTABLE / BABY_STEPS {
        if let Some(j) = table.get(&point_key(&gamma)) {
            let m = i * BABY_STEPS + j;
            if m <= MAX_DECRYPTABLE {
                return Ok(m);
            }
            break;
        }
        gamma += giant;
    }
    Err(EncryptionError::OutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn identity_round_trips_and_adds() {
        let enc = Encryption::Identity;
        let a = enc.encrypt(3, "").unwrap();
        let b = enc.encrypt(4, "ignored").unwrap();
        assert_eq!(a.as_str(), "3");
        assert_eq!(enc.decrypt(&enc.add(&a, &b).unwrap()).unwrap(), 7);
    }

    #[test]
    fn identity_rejects_non_numeric_ciphertext() {
        let enc = Encryption::Identity;
        assert!(matches!(
            enc.decrypt(&Ciphertext::new("abc")),
            Err(EncryptionError::Ciphertext(_))
        ));
        let max = Ciphertext::new(u64::MAX.to_string());
        assert!(matches!(
            enc.add(&max, &Ciphertext::new("1")),
            Err(EncryptionError::Overflow)
        ));
    }

    #[test]
    fn elgamal_decrypts_own_ciphertexts() {
        let enc = Encryption::ElGamal(AggregationKeyPair::generate());
        let pk = enc.public_key();
        for m in [0u64, 1, 2, 17, 250] {
            let ct = enc.encrypt(m, &pk).unwrap();
            assert_eq!(enc.decrypt(&ct).unwrap(), m);
        }
    }

    #[test]
    fn elgamal_ciphertexts_are_randomised() {
        let enc = Encryption::ElGamal(AggregationKeyPair::generate());
        let pk = enc.public_key();
        assert_ne!(enc.encrypt(5, &pk).unwrap(), enc.encrypt(5, &pk).unwrap());
    }

    #[test]
    fn elgamal_addition_is_homomorphic_across_senders() {
        let delegate = Encryption::ElGamal(AggregationKeyPair::generate());
        let member = Encryption::ElGamal(AggregationKeyPair::generate());
        let group_key = delegate.public_key();
        let a = member.encrypt(12, &group_key).unwrap();
        let b = delegate.encrypt(30, &group_key).unwrap();
        let sum = member.add(&a, &b).unwrap();
        assert_eq!(delegate.decrypt(&sum).unwrap(), 42);
        assert_eq!(
            delegate.add(&a, &b).unwrap(),
            delegate.add(&b, &a).unwrap()
        );
    }

    #[test]
    fn discrete_log_covers_range_bounds() {
        for m in [0, 1, BABY_STEPS - 1, BABY_STEPS, 777_777, MAX_DECRYPTABLE] {
            let point = ProjectivePoint::GENERATOR * Scalar::from(m);
            assert_eq!(discrete_log(&point).unwrap(), m);
        }
        let beyond = ProjectivePoint::GENERATOR * Scalar::from(MAX_DECRYPTABLE + 1);
        assert!(matches!(discrete_log(&beyond), Err(EncryptionError::OutOfRange)));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let alice = Encryption::ElGamal(AggregationKeyPair::generate());
        let bob = Encryption::ElGamal(AggregationKeyPair::generate());
        let ct = alice.encrypt(5, &alice.public_key()).unwrap();
        assert!(matches!(bob.decrypt(&ct), Err(EncryptionError::OutOfRange)));
    }

    #[test]
    fn elgamal_rejects_garbage() {
        let enc = Encryption::ElGamal(AggregationKeyPair::generate());
        assert!(matches!(
            enc.encrypt(1, "not-base64!"),
            Err(EncryptionError::PublicKey(_))
        ));
        assert!(matches!(
            enc.decrypt(&Ciphertext::new("7")),
            Err(EncryptionError::Ciphertext(_))
        ));
    }

    #[test]
    fn key_file_is_created_once() {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("aggregation_key_{nanos}"));
        let first = AggregationKeyPair::load_or_generate(&path).unwrap();
        let second = AggregationKeyPair::load_or_generate(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(first.public_key_material(), second.public_key_material());
        assert_eq!(first.to_hex(), second.to_hex());
    }
}
