//! Key entries and the per-request key table.

use std::collections::HashMap;

use serde_json::{json, Map, Value as JsonValue};

use super::ec::{EcPoint, EcSecret};
use super::shared::{CryptoError, HashAlg, NamedCurve};

// ── Usages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
    DeriveKey,
    DeriveBits,
    WrapKey,
    UnwrapKey,
}

const ALL_USAGES: [KeyUsage; 8] = [
    KeyUsage::Encrypt,
    KeyUsage::Decrypt,
    KeyUsage::Sign,
    KeyUsage::Verify,
    KeyUsage::DeriveKey,
    KeyUsage::DeriveBits,
    KeyUsage::WrapKey,
    KeyUsage::UnwrapKey,
];

impl KeyUsage {
    pub fn parse(name: &str) -> Result<Self, CryptoError> {
        ALL_USAGES
            .into_iter()
            .find(|u| u.as_str() == name)
            .ok_or_else(|| CryptoError::type_error(format!("'{name}' is not a valid key usage")))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyUsage::Encrypt => "encrypt",
            KeyUsage::Decrypt => "decrypt",
            KeyUsage::Sign => "sign",
            KeyUsage::Verify => "verify",
            KeyUsage::DeriveKey => "deriveKey",
            KeyUsage::DeriveBits => "deriveBits",
            KeyUsage::WrapKey => "wrapKey",
            KeyUsage::UnwrapKey => "unwrapKey",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A set of key usages. Fixed at key creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usages(u8);

impl Usages {
    pub const NONE: Usages = Usages(0);

    pub fn of(usages: &[KeyUsage]) -> Self {
        Usages(usages.iter().fold(0, |acc, u| acc | u.bit()))
    }

    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, CryptoError> {
        let mut set = Usages::NONE;
        for name in names {
            set.0 |= KeyUsage::parse(name.as_ref())?.bit();
        }
        Ok(set)
    }

    pub fn contains(self, usage: KeyUsage) -> bool {
        self.0 & usage.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_subset(self, other: Usages) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersect(self, other: Usages) -> Usages {
        Usages(self.0 & other.0)
    }

    pub fn union(self, other: Usages) -> Usages {
        Usages(self.0 | other.0)
    }

    /// Usage names in canonical order.
    pub fn names(self) -> Vec<&'static str> {
        ALL_USAGES
            .into_iter()
            .filter(|u| self.contains(*u))
            .map(KeyUsage::as_str)
            .collect()
    }
}

/// Which usages each key role of an algorithm may carry.
#[derive(Debug, Clone, Copy)]
pub struct UsageRules {
    pub secret: Usages,
    pub public: Usages,
    pub private: Usages,
    /// Usages an imported private key may carry (may exceed `private`).
    pub private_import: Usages,
}

impl UsageRules {
    pub fn secret(usages: &[KeyUsage]) -> Self {
        Self {
            secret: Usages::of(usages),
            public: Usages::NONE,
            private: Usages::NONE,
            private_import: Usages::NONE,
        }
    }

    pub fn pair(private: &[KeyUsage], public: &[KeyUsage]) -> Self {
        let private = Usages::of(private);
        Self {
            secret: Usages::NONE,
            public: Usages::of(public),
            private,
            private_import: private,
        }
    }

    pub fn for_import(&self, key_type: KeyType) -> Usages {
        match key_type {
            KeyType::Secret => self.secret,
            KeyType::Public => self.public,
            KeyType::Private => self.private_import,
        }
    }

    pub fn for_generate(&self, key_type: KeyType) -> Usages {
        match key_type {
            KeyType::Secret => self.secret,
            KeyType::Public => self.public,
            KeyType::Private => self.private,
        }
    }

    pub fn all(&self) -> Usages {
        self.secret.union(self.public).union(self.private_import)
    }
}

// ── Key entries ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Secret,
    Public,
    Private,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Secret => "secret",
            KeyType::Public => "public",
            KeyType::Private => "private",
        }
    }
}

/// The `algorithm` dictionary reported on a `CryptoKey`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyAlgorithm {
    pub name: &'static str,
    pub hash: Option<HashAlg>,
    pub named_curve: Option<NamedCurve>,
    /// Key length in bits (AES, HMAC).
    pub length: Option<usize>,
    pub modulus_length: Option<usize>,
    pub public_exponent: Option<Vec<u8>>,
}

impl KeyAlgorithm {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            hash: None,
            named_curve: None,
            length: None,
            modulus_length: None,
            public_exponent: None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert("name".into(), json!(self.name));
        if let Some(hash) = self.hash {
            map.insert("hash".into(), json!({ "name": hash.name() }));
        }
        if let Some(curve) = self.named_curve {
            map.insert("namedCurve".into(), json!(curve.name()));
        }
        if let Some(length) = self.length {
            map.insert("length".into(), json!(length));
        }
        if let Some(bits) = self.modulus_length {
            map.insert("modulusLength".into(), json!(bits));
        }
        if let Some(exp) = &self.public_exponent {
            map.insert("publicExponent".into(), json!(exp));
        }
        JsonValue::Object(map)
    }
}

pub enum KeyMaterial {
    Secret(Vec<u8>),
    RsaPrivate(Box<rsa::RsaPrivateKey>),
    RsaPublic(Box<rsa::RsaPublicKey>),
    EcPrivate(EcSecret),
    EcPublic(EcPoint),
    Ed25519Private(Box<ed25519_dalek::SigningKey>),
    Ed25519Public(ed25519_dalek::VerifyingKey),
    X25519Private(Box<x25519_dalek::StaticSecret>),
    X25519Public(x25519_dalek::PublicKey),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            KeyMaterial::Secret(_) => "Secret",
            KeyMaterial::RsaPrivate(_) => "RsaPrivate",
            KeyMaterial::RsaPublic(_) => "RsaPublic",
            KeyMaterial::EcPrivate(_) => "EcPrivate",
            KeyMaterial::EcPublic(_) => "EcPublic",
            KeyMaterial::Ed25519Private(_) => "Ed25519Private",
            KeyMaterial::Ed25519Public(_) => "Ed25519Public",
            KeyMaterial::X25519Private(_) => "X25519Private",
            KeyMaterial::X25519Public(_) => "X25519Public",
        };
        f.write_str(kind)
    }
}

#[derive(Debug)]
pub struct KeyEntry {
    pub algorithm: KeyAlgorithm,
    pub key_type: KeyType,
    pub extractable: bool,
    pub usages: Usages,
    pub material: KeyMaterial,
}

impl KeyEntry {
    pub fn new(algorithm: KeyAlgorithm, key_type: KeyType, extractable: bool, usages: Usages, material: KeyMaterial) -> Self {
        Self {
            algorithm,
            key_type,
            extractable,
            usages,
            material,
        }
    }

    pub fn secret_bytes(&self) -> Result<&[u8], CryptoError> {
        match &self.material {
            KeyMaterial::Secret(bytes) => Ok(bytes),
            _ => Err(CryptoError::invalid_access("expected a secret key")),
        }
    }

    /// Shape of the JS `CryptoKey` for key id `id`.
    pub fn describe(&self, id: u32) -> JsonValue {
        json!({
            "id": id,
            "type": self.key_type.as_str(),
            "extractable": self.extractable,
            "algorithm": self.algorithm.to_json(),
            "usages": self.usages.names(),
        })
    }
}

// ── Table ────────────────────────────────────────────────────────────────

/// Keys minted during one request. Ids are never reused within a request
/// and the whole table is dropped with the request.
#[derive(Debug, Default)]
pub struct KeyTable {
    keys: HashMap<u32, KeyEntry>,
    next_id: u32,
}

impl KeyTable {
    pub fn insert(&mut self, entry: KeyEntry) -> u32 {
        self.next_id += 1;
        self.keys.insert(self.next_id, entry);
        self.next_id
    }

    pub fn get(&self, id: u32) -> Result<&KeyEntry, CryptoError> {
        self.keys
            .get(&id)
            .ok_or_else(|| CryptoError::type_error(format!("CryptoKey {id} not found in this request")))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
