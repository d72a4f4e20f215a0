//! RSASSA-PKCS1-v1_5, RSA-PSS and RSA-OAEP.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Oaep, Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use super::jwk::{encode, JsonWebKey};
use super::key::{KeyAlgorithm, KeyEntry, KeyMaterial, KeyType, KeyUsage, UsageRules, Usages};
use super::params::AlgorithmParams;
use super::shared::{CryptoError, HashAlg, KeyFormat};
use super::{AlgorithmHandler, ExportedKey, GeneratedKey, KeyData};

const F4: [u8; 3] = [0x01, 0x00, 0x01];

/// Evaluate `$body` with `$d` bound to the digest type for `$hash`.
macro_rules! with_digest {
    ($hash:expr, $d:ident => $body:expr) => {
        match $hash {
            HashAlg::Sha1 => {
                type $d = Sha1;
                $body
            }
            HashAlg::Sha256 => {
                type $d = Sha256;
                $body
            }
            HashAlg::Sha384 => {
                type $d = Sha384;
                $body
            }
            HashAlg::Sha512 => {
                type $d = Sha512;
                $body
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaScheme {
    Pkcs1v15,
    Pss,
    Oaep,
}

impl RsaScheme {
    fn name(self) -> &'static str {
        match self {
            RsaScheme::Pkcs1v15 => "RSASSA-PKCS1-v1_5",
            RsaScheme::Pss => "RSA-PSS",
            RsaScheme::Oaep => "RSA-OAEP",
        }
    }

    fn jwk_use(self) -> &'static str {
        match self {
            RsaScheme::Oaep => "enc",
            _ => "sig",
        }
    }

    fn jwk_alg(self, hash: HashAlg) -> String {
        match (self, hash) {
            (RsaScheme::Pkcs1v15, h) => format!("RS{}", h.jwk_suffix()),
            (RsaScheme::Pss, h) => format!("PS{}", h.jwk_suffix()),
            (RsaScheme::Oaep, HashAlg::Sha1) => "RSA-OAEP".to_string(),
            (RsaScheme::Oaep, h) => format!("RSA-OAEP-{}", h.jwk_suffix()),
        }
    }

    fn known_jwk_algs(self) -> Vec<String> {
        [HashAlg::Sha1, HashAlg::Sha256, HashAlg::Sha384, HashAlg::Sha512]
            .into_iter()
            .map(|h| self.jwk_alg(h))
            .collect()
    }
}

pub struct RsaHandler {
    scheme: RsaScheme,
}

impl RsaHandler {
    pub fn new(scheme: RsaScheme) -> Self {
        Self { scheme }
    }

    fn algorithm(&self, hash: HashAlg, public: &RsaPublicKey) -> KeyAlgorithm {
        let mut algorithm = KeyAlgorithm::named(self.scheme.name());
        algorithm.hash = Some(hash);
        algorithm.modulus_length = Some(public.n().bits());
        algorithm.public_exponent = Some(public.e().to_bytes_be());
        algorithm
    }

    fn private_entry(&self, hash: HashAlg, key: RsaPrivateKey, extractable: bool, usages: Usages) -> KeyEntry {
        let algorithm = self.algorithm(hash, &key.to_public_key());
        KeyEntry::new(
            algorithm,
            KeyType::Private,
            extractable,
            usages,
            KeyMaterial::RsaPrivate(Box::new(key)),
        )
    }

    fn public_entry(&self, hash: HashAlg, key: RsaPublicKey, usages: Usages) -> KeyEntry {
        let algorithm = self.algorithm(hash, &key);
        KeyEntry::new(algorithm, KeyType::Public, true, usages, KeyMaterial::RsaPublic(Box::new(key)))
    }
}

fn key_hash(key: &KeyEntry) -> Result<HashAlg, CryptoError> {
    key.algorithm
        .hash
        .ok_or_else(|| CryptoError::invalid_access("RSA key has no hash"))
}

fn private_key(key: &KeyEntry) -> Result<&RsaPrivateKey, CryptoError> {
    match &key.material {
        KeyMaterial::RsaPrivate(k) => Ok(k),
        _ => Err(CryptoError::invalid_access("expected an RSA private key")),
    }
}

fn public_key(key: &KeyEntry) -> Result<RsaPublicKey, CryptoError> {
    match &key.material {
        KeyMaterial::RsaPublic(k) => Ok((**k).clone()),
        KeyMaterial::RsaPrivate(k) => Ok(k.to_public_key()),
        _ => Err(CryptoError::invalid_access("expected an RSA key")),
    }
}

fn check_exponent(exponent: &[u8]) -> Result<(), CryptoError> {
    let start = exponent.iter().position(|b| *b != 0).unwrap_or(exponent.len());
    if exponent[start..] != F4 {
        return Err(CryptoError::type_error("publicExponent must be 65537"));
    }
    Ok(())
}

fn uint(jwk: &JsonWebKey, name: &'static str) -> Result<BigUint, CryptoError> {
    Ok(BigUint::from_bytes_be(&jwk.field(name)?))
}

impl AlgorithmHandler for RsaHandler {
    fn name(&self) -> &'static str {
        self.scheme.name()
    }

    fn usage_rules(&self) -> UsageRules {
        match self.scheme {
            RsaScheme::Oaep => UsageRules::pair(
                &[KeyUsage::Decrypt, KeyUsage::UnwrapKey],
                &[KeyUsage::Encrypt, KeyUsage::WrapKey],
            ),
            _ => UsageRules::pair(&[KeyUsage::Sign], &[KeyUsage::Verify]),
        }
    }

    fn generate_key(&self, params: &AlgorithmParams, extractable: bool, _usages: Usages) -> Result<GeneratedKey, CryptoError> {
        let hash = params.hash()?;
        let bits = match params.modulus_length {
            Some(bits @ (2048 | 3072 | 4096)) => bits,
            Some(bits) => {
                return Err(CryptoError::operation(format!(
                    "modulusLength must be 2048, 3072 or 4096, got {bits}"
                )))
            }
            None => return Err(CryptoError::type_error(format!("{}: modulusLength is required", self.name()))),
        };
        check_exponent(params.required(&params.public_exponent, "publicExponent")?)?;
        let private = RsaPrivateKey::new_with_exp(&mut OsRng, bits, &BigUint::from_bytes_be(&F4))
            .map_err(|e| CryptoError::operation(format!("RSA key generation failed: {e}")))?;
        let public = private.to_public_key();
        Ok(GeneratedKey::Pair {
            public: self.public_entry(hash, public, Usages::NONE),
            private: self.private_entry(hash, private, extractable, Usages::NONE),
        })
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
        match format {
            KeyFormat::Spki => {
                let key = RsaPublicKey::from_public_key_der(data.bytes(format)?)
                    .map_err(|e| CryptoError::data(format!("invalid RSA SubjectPublicKeyInfo: {e}")))?;
                Ok(self.public_entry(hash, key, usages))
            }
            KeyFormat::Pkcs8 => {
                let key = RsaPrivateKey::from_pkcs8_der(data.bytes(format)?)
                    .map_err(|e| CryptoError::data(format!("invalid RSA PrivateKeyInfo: {e}")))?;
                Ok(self.private_entry(hash, key, extractable, usages))
            }
            KeyFormat::Jwk => {
                let jwk = data.jwk()?;
                jwk.check_common("RSA", self.scheme.jwk_use(), extractable, usages)?;
                let known = self.scheme.known_jwk_algs();
                let known: Vec<&str> = known.iter().map(String::as_str).collect();
                jwk.check_alg(&self.scheme.jwk_alg(hash), &known)?;
                let n = uint(jwk, "n")?;
                let e = uint(jwk, "e")?;
                if jwk.d.is_none() {
                    let key = RsaPublicKey::new(n, e).map_err(|e| CryptoError::data(format!("invalid RSA public key: {e}")))?;
                    return Ok(self.public_entry(hash, key, usages));
                }
                let d = uint(jwk, "d")?;
                let primes = vec![uint(jwk, "p")?, uint(jwk, "q")?];
                let key = RsaPrivateKey::from_components(n, e, d, primes)
                    .map_err(|e| CryptoError::data(format!("invalid RSA private key: {e}")))?;
                key.validate()
                    .map_err(|e| CryptoError::data(format!("invalid RSA private key: {e}")))?;
                Ok(self.private_entry(hash, key, extractable, usages))
            }
            KeyFormat::Raw => Err(CryptoError::unsupported_format(format, self.name())),
        }
    }

    fn export_key(&self, format: KeyFormat, key: &KeyEntry) -> Result<ExportedKey, CryptoError> {
        match (format, &key.material) {
            (KeyFormat::Spki, KeyMaterial::RsaPublic(public)) => {
                let der = public
                    .to_public_key_der()
                    .map_err(|e| CryptoError::operation(format!("SPKI encoding failed: {e}")))?;
                Ok(ExportedKey::Bytes(der.as_bytes().to_vec()))
            }
            (KeyFormat::Pkcs8, KeyMaterial::RsaPrivate(private)) => {
                let der = private
                    .to_pkcs8_der()
                    .map_err(|e| CryptoError::operation(format!("PKCS#8 encoding failed: {e}")))?;
                Ok(ExportedKey::Bytes(der.as_bytes().to_vec()))
            }
            (KeyFormat::Jwk, material) => {
                let hash = key_hash(key)?;
                let public = public_key(key)?;
                let mut jwk = JsonWebKey::new("RSA");
                jwk.n = encode(&public.n().to_bytes_be());
                jwk.e = encode(&public.e().to_bytes_be());
                if let KeyMaterial::RsaPrivate(private) = material {
                    let primes = private.primes();
                    let (p, q) = match primes {
                        [p, q] => (p, q),
                        _ => return Err(CryptoError::not_supported("multi-prime RSA keys cannot be exported")),
                    };
                    let one = BigUint::from(1u32);
                    let d = private.d();
                    jwk.d = encode(&d.to_bytes_be());
                    jwk.p = encode(&p.to_bytes_be());
                    jwk.q = encode(&q.to_bytes_be());
                    jwk.dp = encode(&(d % (p - &one)).to_bytes_be());
                    jwk.dq = encode(&(d % (q - &one)).to_bytes_be());
                    // q^-1 mod p via Fermat, p is prime.
                    jwk.qi = encode(&q.modpow(&(p - &BigUint::from(2u32)), p).to_bytes_be());
                }
                Ok(ExportedKey::Jwk(jwk.finish(Some(self.scheme.jwk_alg(hash)), key.extractable, key.usages)))
            }
            _ => Err(CryptoError::invalid_access(format!(
                "a {} key cannot be exported as '{}'",
                key.key_type.as_str(),
                format.as_str()
            ))),
        }
    }

    fn sign(&self, params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let hash = key_hash(key)?;
        let private = private_key(key)?;
        let hashed = hash.digest(data);
        let signature = match self.scheme {
            RsaScheme::Pkcs1v15 => with_digest!(hash, D => private.sign(Pkcs1v15Sign::new::<D>(), &hashed)),
            RsaScheme::Pss => {
                let salt = params.salt_length.unwrap_or(hash.output_len());
                with_digest!(hash, D => private.sign_with_rng(&mut OsRng, Pss::new_with_salt::<D>(salt), &hashed))
            }
            RsaScheme::Oaep => return Err(self.unsupported("sign")),
        };
        signature.map_err(|e| CryptoError::operation(format!("RSA signing failed: {e}")))
    }

    fn verify(&self, params: &AlgorithmParams, key: &KeyEntry, signature: &[u8], data: &[u8]) -> Result<bool, CryptoError> {
        let hash = key_hash(key)?;
        let public = public_key(key)?;
        let hashed = hash.digest(data);
        let result = match self.scheme {
            RsaScheme::Pkcs1v15 => with_digest!(hash, D => public.verify(Pkcs1v15Sign::new::<D>(), &hashed, signature)),
            RsaScheme::Pss => {
                let salt = params.salt_length.unwrap_or(hash.output_len());
                with_digest!(hash, D => public.verify(Pss::new_with_salt::<D>(salt), &hashed, signature))
            }
            RsaScheme::Oaep => return Err(self.unsupported("verify")),
        };
        Ok(result.is_ok())
    }

    fn encrypt(&self, params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.scheme != RsaScheme::Oaep {
            return Err(self.unsupported("encrypt"));
        }
        let hash = key_hash(key)?;
        let public = public_key(key)?;
        let max = public.size().saturating_sub(2 * hash.output_len() + 2);
        if data.len() > max {
            return Err(CryptoError::operation(format!(
                "RSA-OAEP plaintext is {} bytes, the limit for this key is {max}",
                data.len()
            )));
        }
        let label = oaep_label(params);
        let result = with_digest!(hash, D => match label {
            Some(label) => public.encrypt(&mut OsRng, Oaep::new_with_label::<D, _>(label), data),
            None => public.encrypt(&mut OsRng, Oaep::new::<D>(), data),
        });
        result.map_err(|e| CryptoError::operation(format!("RSA-OAEP encryption failed: {e}")))
    }

    fn decrypt(&self, params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.scheme != RsaScheme::Oaep {
            return Err(self.unsupported("decrypt"));
        }
        let hash = key_hash(key)?;
        let private = private_key(key)?;
        let label = oaep_label(params);
        let result = with_digest!(hash, D => match label {
            Some(label) => private.decrypt(Oaep::new_with_label::<D, _>(label), data),
            None => private.decrypt(Oaep::new::<D>(), data),
        });
        result.map_err(|_| CryptoError::operation("Decryption failed"))
    }
}

/// The underlying OAEP implementation takes the label as a string, so label
/// bytes are converted lossily.
fn oaep_label(params: &AlgorithmParams) -> Option<String> {
    params
        .label
        .as_ref()
        .filter(|label| !label.0.is_empty())
        .map(|label| String::from_utf8_lossy(&label.0).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> AlgorithmParams {
        AlgorithmParams::from_json(value).unwrap()
    }

    fn pair(handler: &RsaHandler, hash: &str) -> (KeyEntry, KeyEntry) {
        let p = params(json!({
            "name": handler.name(),
            "hash": hash,
            "modulusLength": 2048,
            "publicExponent": "AQAB",
        }));
        match handler.generate_key(&p, true, Usages::NONE).unwrap() {
            GeneratedKey::Pair { public, private } => (public, private),
            GeneratedKey::Secret(_) => panic!("expected a key pair"),
        }
    }

    #[test]
    fn rejects_other_exponents() {
        assert!(check_exponent(&[0x01, 0x00, 0x01]).is_ok());
        assert!(check_exponent(&[0x00, 0x01, 0x00, 0x01]).is_ok());
        assert!(check_exponent(&[0x03]).is_err());
    }

    #[test]
    fn pss_sign_verify_and_jwk_reimport() {
        let handler = RsaHandler::new(RsaScheme::Pss);
        let (public, private) = pair(&handler, "SHA-256");
        assert_eq!(public.algorithm.modulus_length, Some(2048));
        let p = params(json!({ "name": "RSA-PSS", "saltLength": 32 }));
        let signature = handler.sign(&p, &private, b"message").unwrap();
        assert_eq!(signature.len(), 256);
        assert!(handler.verify(&p, &public, &signature, b"message").unwrap());
        assert!(!handler.verify(&p, &public, &signature, b"massage").unwrap());

        let ExportedKey::Jwk(jwk) = handler.export_key(KeyFormat::Jwk, &private).unwrap() else {
            panic!("expected a JWK")
        };
        assert_eq!(jwk.alg.as_deref(), Some("PS256"));
        let reimported = handler
            .import_key(
                KeyFormat::Jwk,
                &KeyData::Jwk(jwk),
                &params(json!({ "name": "RSA-PSS", "hash": "SHA-256" })),
                true,
                Usages::of(&[KeyUsage::Sign]),
            )
            .unwrap();
        let signature = handler.sign(&p, &reimported, b"message").unwrap();
        assert!(handler.verify(&p, &public, &signature, b"message").unwrap());
    }

    #[test]
    fn oaep_round_trip_with_label_and_limit() {
        let handler = RsaHandler::new(RsaScheme::Oaep);
        let (public, private) = pair(&handler, "SHA-256");
        let p = params(json!({ "name": "RSA-OAEP", "label": "bGFiZWw=" }));
        let sealed = handler.encrypt(&p, &public, b"secret").unwrap();
        assert_eq!(handler.decrypt(&p, &private, &sealed).unwrap(), b"secret");

        let other = params(json!({ "name": "RSA-OAEP" }));
        assert!(handler.decrypt(&other, &private, &sealed).is_err());

        // 256 - 2 * 32 - 2
        assert!(handler.encrypt(&other, &public, &[0u8; 190]).is_ok());
        assert!(matches!(
            handler.encrypt(&other, &public, &[0u8; 191]),
            Err(CryptoError::Operation(_))
        ));

        let spki = handler.export_key(KeyFormat::Spki, &public).unwrap().into_bytes();
        let imported = handler
            .import_key(
                KeyFormat::Spki,
                &KeyData::Bytes(spki),
                &params(json!({ "name": "RSA-OAEP", "hash": "SHA-256" })),
                true,
                Usages::of(&[KeyUsage::Encrypt]),
            )
            .unwrap();
        let sealed = handler.encrypt(&other, &imported, b"again").unwrap();
        assert_eq!(handler.decrypt(&other, &private, &sealed).unwrap(), b"again");
    }

    #[test]
    fn oaep_accepts_non_utf8_label() {
        let handler = RsaHandler::new(RsaScheme::Oaep);
        let (public, private) = pair(&handler, "SHA-1");
        // 0xff 0xfe
        let p = params(json!({ "name": "RSA-OAEP", "label": "//4=" }));
        let sealed = handler.encrypt(&p, &public, b"bytes").unwrap();
        assert_eq!(handler.decrypt(&p, &private, &sealed).unwrap(), b"bytes");
    }
}
