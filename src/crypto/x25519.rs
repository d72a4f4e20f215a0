use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use super::jwk::{encode, JsonWebKey};
use super::key::{KeyAlgorithm, KeyEntry, KeyMaterial, KeyType, KeyUsage, UsageRules, Usages};
use super::params::AlgorithmParams;
use super::shared::{
    okp_pkcs8_decode, okp_pkcs8_encode, okp_spki_decode, okp_spki_encode, truncate_bits, CryptoError, KeyFormat,
    X25519_OID,
};
use super::{AlgorithmHandler, ExportedKey, GeneratedKey, KeyData};

pub struct X25519Handler;

impl X25519Handler {
    fn private_entry(&self, secret: StaticSecret, extractable: bool, usages: Usages) -> KeyEntry {
        KeyEntry::new(
            KeyAlgorithm::named("X25519"),
            KeyType::Private,
            extractable,
            usages,
            KeyMaterial::X25519Private(Box::new(secret)),
        )
    }

    fn public_entry(&self, public: PublicKey, usages: Usages) -> KeyEntry {
        KeyEntry::new(KeyAlgorithm::named("X25519"), KeyType::Public, true, usages, KeyMaterial::X25519Public(public))
    }
}

fn bytes32(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::data(format!("X25519 {what} must be 32 bytes")))
}

impl AlgorithmHandler for X25519Handler {
    fn name(&self) -> &'static str {
        "X25519"
    }

    fn usage_rules(&self) -> UsageRules {
        UsageRules::pair(&[KeyUsage::DeriveKey, KeyUsage::DeriveBits], &[])
    }

    fn generate_key(&self, _params: &AlgorithmParams, extractable: bool, _usages: Usages) -> Result<GeneratedKey, CryptoError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Ok(GeneratedKey::Pair {
            public: self.public_entry(public, Usages::NONE),
            private: self.private_entry(secret, extractable, Usages::NONE),
        })
    }

    fn import_key(
        &self,
        format: KeyFormat,
        data: &KeyData,
        _params: &AlgorithmParams,
        extractable: bool,
        usages: Usages,
    ) -> Result<KeyEntry, CryptoError> {
        match format {
            KeyFormat::Raw => Ok(self.public_entry(PublicKey::from(bytes32(data.bytes(format)?, "public key")?), usages)),
            KeyFormat::Spki => {
                let public = okp_spki_decode(X25519_OID, data.bytes(format)?)?;
                Ok(self.public_entry(PublicKey::from(public), usages))
            }
            KeyFormat::Pkcs8 => {
                let secret = okp_pkcs8_decode(X25519_OID, data.bytes(format)?)?;
                Ok(self.private_entry(StaticSecret::from(secret), extractable, usages))
            }
            KeyFormat::Jwk => {
                let jwk = data.jwk()?;
                jwk.check_common("OKP", "enc", extractable, usages)?;
                if jwk.crv.as_deref() != Some("X25519") {
                    return Err(CryptoError::data("JWK 'crv' must be 'X25519'"));
                }
                let public = PublicKey::from(bytes32(&jwk.field("x")?, "public key")?);
                if jwk.d.is_none() {
                    return Ok(self.public_entry(public, usages));
                }
                let secret = StaticSecret::from(bytes32(&jwk.field("d")?, "private key")?);
                if PublicKey::from(&secret) != public {
                    return Err(CryptoError::data("JWK 'd' does not match 'x'"));
                }
                Ok(self.private_entry(secret, extractable, usages))
            }
        }
    }

    fn export_key(&self, format: KeyFormat, key: &KeyEntry) -> Result<ExportedKey, CryptoError> {
        match (format, &key.material) {
            (KeyFormat::Raw, KeyMaterial::X25519Public(public)) => Ok(ExportedKey::Bytes(public.as_bytes().to_vec())),
            (KeyFormat::Spki, KeyMaterial::X25519Public(public)) => {
                Ok(ExportedKey::Bytes(okp_spki_encode(X25519_OID, public.as_bytes())?))
            }
            (KeyFormat::Pkcs8, KeyMaterial::X25519Private(secret)) => {
                Ok(ExportedKey::Bytes(okp_pkcs8_encode(X25519_OID, &secret.to_bytes())?))
            }
            (KeyFormat::Jwk, KeyMaterial::X25519Public(public)) => {
                let mut jwk = JsonWebKey::new("OKP");
                jwk.crv = Some("X25519".to_string());
                jwk.x = encode(public.as_bytes());
                Ok(ExportedKey::Jwk(jwk.finish(None, key.extractable, key.usages)))
            }
            (KeyFormat::Jwk, KeyMaterial::X25519Private(secret)) => {
                let mut jwk = JsonWebKey::new("OKP");
                jwk.crv = Some("X25519".to_string());
                jwk.x = encode(PublicKey::from(secret.as_ref()).as_bytes());
                jwk.d = encode(&secret.to_bytes());
                Ok(ExportedKey::Jwk(jwk.finish(None, key.extractable, key.usages)))
            }
            _ => Err(CryptoError::invalid_access(format!(
                "a {} key cannot be exported as '{}'",
                key.key_type.as_str(),
                format.as_str()
            ))),
        }
    }

    fn derive_bits(
        &self,
        _params: &AlgorithmParams,
        key: &KeyEntry,
        peer: Option<&KeyEntry>,
        length: Option<usize>,
    ) -> Result<Vec<u8>, CryptoError> {
        let KeyMaterial::X25519Private(secret) = &key.material else {
            return Err(CryptoError::invalid_access("X25519 derivation requires a private key"));
        };
        let peer = peer.ok_or_else(|| CryptoError::type_error("X25519: public is required"))?;
        let KeyMaterial::X25519Public(public) = &peer.material else {
            return Err(CryptoError::invalid_access("X25519: public must be an X25519 public key"));
        };
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(CryptoError::operation("X25519 shared secret is all zeros"));
        }
        truncate_bits(shared.as_bytes().to_vec(), length)
    }
}
