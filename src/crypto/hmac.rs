use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use super::jwk::{encode, JsonWebKey};
use super::key::{KeyAlgorithm, KeyEntry, KeyMaterial, KeyType, KeyUsage, UsageRules, Usages};
use super::params::AlgorithmParams;
use super::shared::{CryptoError, HashAlg, KeyFormat};
use super::{AlgorithmHandler, ExportedKey, GeneratedKey, KeyData};

const JWK_ALGS: [&str; 4] = ["HS1", "HS256", "HS384", "HS512"];

pub struct HmacHandler;

macro_rules! mac {
    ($hash:expr, $key:expr, $data:expr) => {
        match $hash {
            HashAlg::Sha1 => compute::<Hmac<Sha1>>($key, $data),
            HashAlg::Sha256 => compute::<Hmac<Sha256>>($key, $data),
            HashAlg::Sha384 => compute::<Hmac<Sha384>>($key, $data),
            HashAlg::Sha512 => compute::<Hmac<Sha512>>($key, $data),
        }
    };
}

fn compute<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| CryptoError::data("invalid HMAC key length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Key length in bits; defaults to the digest size.
fn key_length(params: &AlgorithmParams, hash: HashAlg) -> Result<usize, CryptoError> {
    match params.length {
        Some(0) => Err(CryptoError::type_error("HMAC key length must not be zero")),
        Some(bits) => Ok(bits),
        None => Ok(hash.output_len() * 8),
    }
}

fn entry(hash: HashAlg, bits: usize, extractable: bool, usages: Usages, key: Vec<u8>) -> KeyEntry {
    let mut algorithm = KeyAlgorithm::named("HMAC");
    algorithm.hash = Some(hash);
    algorithm.length = Some(bits);
    KeyEntry::new(algorithm, KeyType::Secret, extractable, usages, KeyMaterial::Secret(key))
}

fn key_hash(key: &KeyEntry) -> Result<HashAlg, CryptoError> {
    key.algorithm
        .hash
        .ok_or_else(|| CryptoError::invalid_access("HMAC key has no hash"))
}

impl AlgorithmHandler for HmacHandler {
    fn name(&self) -> &'static str {
        "HMAC"
    }

    fn usage_rules(&self) -> UsageRules {
        UsageRules::secret(&[KeyUsage::Sign, KeyUsage::Verify])
    }

    fn generate_key(&self, params: &AlgorithmParams, extractable: bool, usages: Usages) -> Result<GeneratedKey, CryptoError> {
        let hash = params.hash()?;
        let bits = key_length(params, hash)?;
        let mut key = vec![0u8; bits.div_ceil(8)];
        rand::thread_rng().fill_bytes(&mut key);
        Ok(GeneratedKey::Secret(entry(hash, bits, extractable, usages, key)))
    }

    fn import_key(
        &self,
        format: KeyFormat,
        data: &KeyData,
        params: &AlgorithmParams,
        extractable: bool,
        usages: Usages,
    ) -> Result<KeyEntry, CryptoError> {
        let hash = params.hash()?;
        let key = match format {
            KeyFormat::Raw => data.bytes(format)?.to_vec(),
            KeyFormat::Jwk => {
                let jwk = data.jwk()?;
                jwk.check_common("oct", "sig", extractable, usages)?;
                jwk.check_alg(&format!("HS{}", hash.jwk_suffix()), &JWK_ALGS)?;
                jwk.field("k")?
            }
            _ => return Err(CryptoError::unsupported_format(format, self.name())),
        };
        if key.is_empty() {
            return Err(CryptoError::data("HMAC key data must not be empty"));
        }
        let available = key.len() * 8;
        let bits = match params.length {
            None => available,
            Some(bits) if bits > available || bits + 8 <= available || bits == 0 => {
                return Err(CryptoError::data(format!(
                    "HMAC length {bits} does not match {available} bits of key data"
                )))
            }
            Some(bits) => bits,
        };
        Ok(entry(hash, bits, extractable, usages, key))
    }

    fn export_key(&self, format: KeyFormat, key: &KeyEntry) -> Result<ExportedKey, CryptoError> {
        let bytes = key.secret_bytes()?;
        match format {
            KeyFormat::Raw => Ok(ExportedKey::Bytes(bytes.to_vec())),
            KeyFormat::Jwk => {
                let hash = key_hash(key)?;
                let mut jwk = JsonWebKey::new("oct");
                jwk.k = encode(bytes);
                Ok(ExportedKey::Jwk(jwk.finish(
                    Some(format!("HS{}", hash.jwk_suffix())),
                    key.extractable,
                    key.usages,
                )))
            }
            _ => Err(CryptoError::unsupported_format(format, self.name())),
        }
    }

    fn sign(&self, _params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        mac!(key_hash(key)?, key.secret_bytes()?, data)
    }

    fn verify(&self, _params: &AlgorithmParams, key: &KeyEntry, signature: &[u8], data: &[u8]) -> Result<bool, CryptoError> {
        let expected = mac!(key_hash(key)?, key.secret_bytes()?, data)?;
        Ok(expected.ct_eq(signature).into())
    }

    fn derived_key_length(&self, params: &AlgorithmParams) -> Result<Option<usize>, CryptoError> {
        let hash = params.hash()?;
        key_length(params, hash).map(Some)
    }
}
