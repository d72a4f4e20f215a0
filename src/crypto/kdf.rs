//! HKDF (RFC 5869) and PBKDF2 (RFC 2898) base keys.

use hkdf::Hkdf;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use super::key::{KeyAlgorithm, KeyEntry, KeyMaterial, KeyType, KeyUsage, UsageRules, Usages};
use super::params::AlgorithmParams;
use super::shared::{CryptoError, HashAlg, KeyFormat};
use super::{AlgorithmHandler, KeyData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kdf {
    Hkdf,
    Pbkdf2,
}

pub struct KdfHandler {
    kdf: Kdf,
}

impl KdfHandler {
    pub fn new(kdf: Kdf) -> Self {
        Self { kdf }
    }
}

fn hkdf_expand(hash: HashAlg, salt: Option<&[u8]>, ikm: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
    if len > 255 * hash.output_len() {
        return Err(CryptoError::operation(format!(
            "HKDF output is limited to {} bits for {}",
            255 * hash.output_len() * 8,
            hash.name()
        )));
    }
    let mut out = vec![0u8; len];
    let result = match hash {
        HashAlg::Sha1 => Hkdf::<Sha1>::new(salt, ikm).expand(info, &mut out),
        HashAlg::Sha256 => Hkdf::<Sha256>::new(salt, ikm).expand(info, &mut out),
        HashAlg::Sha384 => Hkdf::<Sha384>::new(salt, ikm).expand(info, &mut out),
        HashAlg::Sha512 => Hkdf::<Sha512>::new(salt, ikm).expand(info, &mut out),
    };
    result.map_err(|_| CryptoError::operation("HKDF output length is invalid"))?;
    Ok(out)
}

fn pbkdf2_derive(hash: HashAlg, password: &[u8], salt: &[u8], rounds: u32, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    match hash {
        HashAlg::Sha1 => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, rounds, &mut out),
        HashAlg::Sha256 => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, rounds, &mut out),
        HashAlg::Sha384 => pbkdf2::pbkdf2_hmac::<Sha384>(password, salt, rounds, &mut out),
        HashAlg::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, rounds, &mut out),
    }
    out
}

impl AlgorithmHandler for KdfHandler {
    fn name(&self) -> &'static str {
        match self.kdf {
            Kdf::Hkdf => "HKDF",
            Kdf::Pbkdf2 => "PBKDF2",
        }
    }

    fn usage_rules(&self) -> UsageRules {
        UsageRules::secret(&[KeyUsage::DeriveKey, KeyUsage::DeriveBits])
    }

    fn import_key(
        &self,
        format: KeyFormat,
        data: &KeyData,
        _params: &AlgorithmParams,
        extractable: bool,
        usages: Usages,
    ) -> Result<KeyEntry, CryptoError> {
        if format != KeyFormat::Raw {
            return Err(CryptoError::unsupported_format(format, self.name()));
        }
        if extractable {
            return Err(CryptoError::Syntax(format!("{} keys cannot be extractable", self.name())));
        }
        Ok(KeyEntry::new(
            KeyAlgorithm::named(self.name()),
            KeyType::Secret,
            false,
            usages,
            KeyMaterial::Secret(data.bytes(format)?.to_vec()),
        ))
    }

    fn derive_bits(
        &self,
        params: &AlgorithmParams,
        key: &KeyEntry,
        _peer: Option<&KeyEntry>,
        length: Option<usize>,
    ) -> Result<Vec<u8>, CryptoError> {
        let length = length.ok_or_else(|| CryptoError::operation(format!("{}: length cannot be null", self.name())))?;
        if length % 8 != 0 {
            return Err(CryptoError::operation("length must be a multiple of 8"));
        }
        let hash = params.hash()?;
        let secret = key.secret_bytes()?;
        match self.kdf {
            Kdf::Hkdf => {
                let salt = params.salt.as_ref().map(|s| s.0.as_slice());
                let info = AlgorithmParams::optional(&params.info);
                hkdf_expand(hash, salt, secret, info, length / 8)
            }
            Kdf::Pbkdf2 => {
                let salt = params.required(&params.salt, "salt")?;
                let rounds = match params.iterations {
                    Some(0) => return Err(CryptoError::operation("PBKDF2 iterations must be at least 1")),
                    Some(n) => n,
                    None => return Err(CryptoError::type_error("PBKDF2: iterations is required")),
                };
                Ok(pbkdf2_derive(hash, secret, salt, rounds, length / 8))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap()).collect()
    }

    fn b64(bytes: &[u8]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn base_key(kdf: Kdf, secret: &[u8]) -> KeyEntry {
        KdfHandler::new(kdf)
            .import_key(
                KeyFormat::Raw,
                &KeyData::Bytes(secret.to_vec()),
                &AlgorithmParams::named("HKDF"),
                false,
                Usages::of(&[KeyUsage::DeriveBits]),
            )
            .unwrap()
    }

    #[test]
    fn hkdf_rfc5869_case_1() {
        let key = base_key(Kdf::Hkdf, &[0x0b; 22]);
        let params = AlgorithmParams::from_json(json!({
            "name": "HKDF",
            "hash": "SHA-256",
            "salt": b64(&hex("000102030405060708090a0b0c")),
            "info": b64(&hex("f0f1f2f3f4f5f6f7f8f9")),
        }))
        .unwrap();
        let okm = KdfHandler::new(Kdf::Hkdf).derive_bits(&params, &key, None, Some(42 * 8)).unwrap();
        assert_eq!(
            okm,
            hex("3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865")
        );
    }

    #[test]
    fn hkdf_output_cap() {
        let key = base_key(Kdf::Hkdf, b"ikm");
        let params = AlgorithmParams::from_json(json!({ "name": "HKDF", "hash": "SHA-256" })).unwrap();
        let handler = KdfHandler::new(Kdf::Hkdf);
        assert!(handler.derive_bits(&params, &key, None, Some(255 * 32 * 8)).is_ok());
        assert!(matches!(
            handler.derive_bits(&params, &key, None, Some(255 * 32 * 8 + 8)),
            Err(CryptoError::Operation(_))
        ));
        assert!(handler.derive_bits(&params, &key, None, Some(12)).is_err());
        assert!(handler.derive_bits(&params, &key, None, None).is_err());
    }

    #[test]
    fn pbkdf2_rfc6070_case_2() {
        let key = base_key(Kdf::Pbkdf2, b"password");
        let params = AlgorithmParams::from_json(json!({
            "name": "PBKDF2",
            "hash": "SHA-1",
            "salt": b64(b"salt"),
            "iterations": 2,
        }))
        .unwrap();
        let dk = KdfHandler::new(Kdf::Pbkdf2).derive_bits(&params, &key, None, Some(160)).unwrap();
        assert_eq!(dk, hex("ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957"));

        let zero = AlgorithmParams::from_json(json!({ "name": "PBKDF2", "hash": "SHA-1", "salt": "", "iterations": 0 })).unwrap();
        assert!(KdfHandler::new(Kdf::Pbkdf2).derive_bits(&zero, &key, None, Some(160)).is_err());
    }

    #[test]
    fn base_keys_are_never_extractable() {
        let err = KdfHandler::new(Kdf::Hkdf)
            .import_key(KeyFormat::Raw, &KeyData::Bytes(vec![1]), &AlgorithmParams::named("HKDF"), true, Usages::NONE)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Syntax(_)));
    }
}
