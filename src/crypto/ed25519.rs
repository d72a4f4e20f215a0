use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use super::jwk::{encode, JsonWebKey};
use super::key::{KeyAlgorithm, KeyEntry, KeyMaterial, KeyType, KeyUsage, UsageRules, Usages};
use super::params::AlgorithmParams;
use super::shared::{
    okp_pkcs8_decode, okp_pkcs8_encode, okp_spki_decode, okp_spki_encode, CryptoError, KeyFormat, ED25519_OID,
};
use super::{AlgorithmHandler, ExportedKey, GeneratedKey, KeyData};

pub struct Ed25519Handler;

impl Ed25519Handler {
    fn private_entry(&self, key: SigningKey, extractable: bool, usages: Usages) -> KeyEntry {
        KeyEntry::new(
            KeyAlgorithm::named("Ed25519"),
            KeyType::Private,
            extractable,
            usages,
            KeyMaterial::Ed25519Private(Box::new(key)),
        )
    }

    fn public_entry(&self, key: VerifyingKey, usages: Usages) -> KeyEntry {
        KeyEntry::new(
            KeyAlgorithm::named("Ed25519"),
            KeyType::Public,
            true,
            usages,
            KeyMaterial::Ed25519Public(key),
        )
    }
}

fn public_from(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::data("Ed25519 public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::data("invalid Ed25519 public key"))
}

/// 64 raw bytes are `seed || public`; the public half must match the seed.
fn private_from_keypair(bytes: &[u8]) -> Result<SigningKey, CryptoError> {
    let (seed, public) = bytes.split_at(32);
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| CryptoError::data("Ed25519 seed must be 32 bytes"))?;
    let key = SigningKey::from_bytes(&seed);
    if key.verifying_key().as_bytes()[..] != public[..] {
        return Err(CryptoError::data("Ed25519 public half does not match the seed"));
    }
    Ok(key)
}

fn verifying_key(key: &KeyEntry) -> Result<VerifyingKey, CryptoError> {
    match &key.material {
        KeyMaterial::Ed25519Public(k) => Ok(*k),
        KeyMaterial::Ed25519Private(k) => Ok(k.verifying_key()),
        _ => Err(CryptoError::invalid_access("expected an Ed25519 key")),
    }
}

impl AlgorithmHandler for Ed25519Handler {
    fn name(&self) -> &'static str {
        "Ed25519"
    }

    fn usage_rules(&self) -> UsageRules {
        let mut rules = UsageRules::pair(&[KeyUsage::Sign], &[KeyUsage::Verify]);
        rules.private_import = Usages::of(&[KeyUsage::Sign, KeyUsage::Verify]);
        rules
    }

    fn generate_key(&self, _params: &AlgorithmParams, extractable: bool, _usages: Usages) -> Result<GeneratedKey, CryptoError> {
        let private = SigningKey::generate(&mut OsRng);
        let public = private.verifying_key();
        Ok(GeneratedKey::Pair {
            public: self.public_entry(public, Usages::NONE),
            private: self.private_entry(private, extractable, Usages::NONE),
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
            KeyFormat::Raw => {
                let bytes = data.bytes(format)?;
                match bytes.len() {
                    32 => Ok(self.public_entry(public_from(bytes)?, usages)),
                    64 => Ok(self.private_entry(private_from_keypair(bytes)?, extractable, usages)),
                    n => Err(CryptoError::data(format!("Ed25519 raw key must be 32 or 64 bytes, got {n}"))),
                }
            }
            KeyFormat::Spki => {
                let public = okp_spki_decode(ED25519_OID, data.bytes(format)?)?;
                Ok(self.public_entry(public_from(&public)?, usages))
            }
            KeyFormat::Pkcs8 => {
                let seed = okp_pkcs8_decode(ED25519_OID, data.bytes(format)?)?;
                Ok(self.private_entry(SigningKey::from_bytes(&seed), extractable, usages))
            }
            KeyFormat::Jwk => {
                let jwk = data.jwk()?;
                jwk.check_common("OKP", "sig", extractable, usages)?;
                if jwk.crv.as_deref() != Some("Ed25519") {
                    return Err(CryptoError::data("JWK 'crv' must be 'Ed25519'"));
                }
                jwk.check_alg("EdDSA", &["EdDSA"])?;
                let public = public_from(&jwk.field("x")?)?;
                if jwk.d.is_none() {
                    return Ok(self.public_entry(public, usages));
                }
                let seed: [u8; 32] = jwk
                    .field("d")?
                    .try_into()
                    .map_err(|_| CryptoError::data("JWK 'd' must be 32 bytes"))?;
                let private = SigningKey::from_bytes(&seed);
                if private.verifying_key() != public {
                    return Err(CryptoError::data("JWK 'd' does not match 'x'"));
                }
                Ok(self.private_entry(private, extractable, usages))
            }
        }
    }

    fn export_key(&self, format: KeyFormat, key: &KeyEntry) -> Result<ExportedKey, CryptoError> {
        match (format, &key.material) {
            (KeyFormat::Raw, KeyMaterial::Ed25519Public(public)) => Ok(ExportedKey::Bytes(public.to_bytes().to_vec())),
            (KeyFormat::Spki, KeyMaterial::Ed25519Public(public)) => {
                Ok(ExportedKey::Bytes(okp_spki_encode(ED25519_OID, public.as_bytes())?))
            }
            (KeyFormat::Pkcs8, KeyMaterial::Ed25519Private(private)) => {
                Ok(ExportedKey::Bytes(okp_pkcs8_encode(ED25519_OID, &private.to_bytes())?))
            }
            (KeyFormat::Jwk, material) => {
                let mut jwk = JsonWebKey::new("OKP");
                jwk.crv = Some("Ed25519".to_string());
                jwk.x = encode(verifying_key(key)?.as_bytes());
                if let KeyMaterial::Ed25519Private(private) = material {
                    jwk.d = encode(&private.to_bytes());
                }
                Ok(ExportedKey::Jwk(jwk.finish(Some("EdDSA".to_string()), key.extractable, key.usages)))
            }
            _ => Err(CryptoError::invalid_access(format!(
                "a {} key cannot be exported as '{}'",
                key.key_type.as_str(),
                format.as_str()
            ))),
        }
    }

    fn sign(&self, _params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &key.material {
            KeyMaterial::Ed25519Private(private) => Ok(private.sign(data).to_bytes().to_vec()),
            _ => Err(CryptoError::invalid_access("Ed25519 signing requires a private key")),
        }
    }

    fn verify(&self, _params: &AlgorithmParams, key: &KeyEntry, signature: &[u8], data: &[u8]) -> Result<bool, CryptoError> {
        let Ok(signature) = Signature::from_slice(signature) else {
            return Ok(false);
        };
        Ok(verifying_key(key)?.verify(data, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap()).collect()
    }

    fn import_raw(bytes: Vec<u8>, usages: &[KeyUsage]) -> Result<KeyEntry, CryptoError> {
        Ed25519Handler.import_key(
            KeyFormat::Raw,
            &KeyData::Bytes(bytes),
            &AlgorithmParams::named("Ed25519"),
            true,
            Usages::of(usages),
        )
    }

    #[test]
    fn rfc8032_test_1() {
        let seed = hex("9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60");
        let public = hex("d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a");
        let mut keypair = seed.clone();
        keypair.extend_from_slice(&public);
        let private = import_raw(keypair, &[KeyUsage::Sign, KeyUsage::Verify]).unwrap();
        assert_eq!(private.key_type, KeyType::Private);

        let params = AlgorithmParams::named("Ed25519");
        let signature = Ed25519Handler.sign(&params, &private, b"").unwrap();
        assert_eq!(
            signature,
            hex("e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e065224901555fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b")
        );
        let public = import_raw(public, &[KeyUsage::Verify]).unwrap();
        assert!(Ed25519Handler.verify(&params, &public, &signature, b"").unwrap());
        assert!(Ed25519Handler.verify(&params, &private, &signature, b"").unwrap());
        assert!(!Ed25519Handler.verify(&params, &public, &signature[..63], b"").unwrap());
    }

    #[test]
    fn keypair_halves_must_agree() {
        let mut bytes = vec![1u8; 32];
        bytes.extend_from_slice(&[2u8; 32]);
        assert!(matches!(import_raw(bytes, &[KeyUsage::Sign]), Err(CryptoError::Data(_))));
        assert!(import_raw(vec![0u8; 31], &[KeyUsage::Verify]).is_err());
    }

    #[test]
    fn pkcs8_and_jwk_round_trip() {
        let GeneratedKey::Pair { public, private } = Ed25519Handler
            .generate_key(&AlgorithmParams::named("Ed25519"), true, Usages::NONE)
            .unwrap()
        else {
            panic!("expected a key pair")
        };
        let pkcs8 = Ed25519Handler.export_key(KeyFormat::Pkcs8, &private).unwrap().into_bytes();
        assert_eq!(pkcs8.len(), 48);
        let reimported = Ed25519Handler
            .import_key(KeyFormat::Pkcs8, &KeyData::Bytes(pkcs8), &AlgorithmParams::named("Ed25519"), true, Usages::of(&[KeyUsage::Sign]))
            .unwrap();
        let signature = Ed25519Handler.sign(&AlgorithmParams::named("Ed25519"), &reimported, b"m").unwrap();
        assert!(Ed25519Handler.verify(&AlgorithmParams::named("Ed25519"), &public, &signature, b"m").unwrap());

        let ExportedKey::Jwk(jwk) = Ed25519Handler.export_key(KeyFormat::Jwk, &private).unwrap() else {
            panic!("expected a JWK")
        };
        assert_eq!(jwk.kty, "OKP");
        assert!(jwk.d.is_some());
    }
}
