//! ECDSA and ECDH over P-256, P-384 and P-521.

use ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use elliptic_curve::sec1::ToEncodedPoint;
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;

use super::jwk::{encode, JsonWebKey};
use super::key::{KeyAlgorithm, KeyEntry, KeyMaterial, KeyType, KeyUsage, UsageRules, Usages};
use super::params::AlgorithmParams;
use super::shared::{left_pad, truncate_bits, CryptoError, KeyFormat, NamedCurve};
use super::{AlgorithmHandler, ExportedKey, GeneratedKey, KeyData};

/// Run `$body` with `$m` aliased to the curve crate for `$curve`.
macro_rules! by_curve {
    ($curve:expr, $m:ident => $body:expr) => {
        match $curve {
            NamedCurve::P256 => {
                use p256 as $m;
                $body
            }
            NamedCurve::P384 => {
                use p384 as $m;
                $body
            }
            NamedCurve::P521 => {
                use p521 as $m;
                $body
            }
        }
    };
}

/// Run `$body` with `$k` bound to the inner key and `$m` to its curve crate.
macro_rules! each_key {
    ($value:expr, $ty:ident, $k:ident, $m:ident => $body:expr) => {
        match $value {
            $ty::P256($k) => {
                use p256 as $m;
                $body
            }
            $ty::P384($k) => {
                use p384 as $m;
                $body
            }
            $ty::P521($k) => {
                use p521 as $m;
                $body
            }
        }
    };
}

pub enum EcSecret {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    P521(p521::SecretKey),
}

#[derive(Clone)]
pub enum EcPoint {
    P256(p256::PublicKey),
    P384(p384::PublicKey),
    P521(p521::PublicKey),
}

impl From<p256::SecretKey> for EcSecret {
    fn from(k: p256::SecretKey) -> Self {
        EcSecret::P256(k)
    }
}

impl From<p384::SecretKey> for EcSecret {
    fn from(k: p384::SecretKey) -> Self {
        EcSecret::P384(k)
    }
}

impl From<p521::SecretKey> for EcSecret {
    fn from(k: p521::SecretKey) -> Self {
        EcSecret::P521(k)
    }
}

impl From<p256::PublicKey> for EcPoint {
    fn from(k: p256::PublicKey) -> Self {
        EcPoint::P256(k)
    }
}

impl From<p384::PublicKey> for EcPoint {
    fn from(k: p384::PublicKey) -> Self {
        EcPoint::P384(k)
    }
}

impl From<p521::PublicKey> for EcPoint {
    fn from(k: p521::PublicKey) -> Self {
        EcPoint::P521(k)
    }
}

impl EcSecret {
    pub fn random(curve: NamedCurve) -> Self {
        by_curve!(curve, c => EcSecret::from(c::SecretKey::random(&mut OsRng)))
    }

    pub fn curve(&self) -> NamedCurve {
        match self {
            EcSecret::P256(_) => NamedCurve::P256,
            EcSecret::P384(_) => NamedCurve::P384,
            EcSecret::P521(_) => NamedCurve::P521,
        }
    }

    pub fn from_pkcs8(curve: NamedCurve, der: &[u8]) -> Result<Self, CryptoError> {
        by_curve!(curve, c => c::SecretKey::from_pkcs8_der(der)
            .map(EcSecret::from)
            .map_err(|e| CryptoError::data(format!("invalid {} PrivateKeyInfo: {e}", curve.name()))))
    }

    pub fn from_scalar(curve: NamedCurve, d: &[u8]) -> Result<Self, CryptoError> {
        if d.len() != curve.coordinate_len() {
            return Err(CryptoError::data(format!("{} private scalar must be {} bytes", curve.name(), curve.coordinate_len())));
        }
        by_curve!(curve, c => c::SecretKey::from_slice(d)
            .map(EcSecret::from)
            .map_err(|_| CryptoError::data(format!("invalid {} private scalar", curve.name()))))
    }

    pub fn to_pkcs8(&self) -> Result<Vec<u8>, CryptoError> {
        each_key!(self, EcSecret, k, _c => k
            .to_pkcs8_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::operation(format!("PKCS#8 encoding failed: {e}"))))
    }

    pub fn scalar(&self) -> Vec<u8> {
        each_key!(self, EcSecret, k, _c => k.to_bytes().to_vec())
    }

    pub fn public(&self) -> EcPoint {
        each_key!(self, EcSecret, k, _c => EcPoint::from(k.public_key()))
    }

    fn sign_prehash(&self, prehash: &[u8]) -> Result<Vec<u8>, CryptoError> {
        each_key!(self, EcSecret, k, c => {
            let signer = c::ecdsa::SigningKey::from_bytes(&k.to_bytes())
                .map_err(|_| CryptoError::operation("invalid ECDSA signing key"))?;
            let signature: c::ecdsa::Signature = signer
                .sign_prehash(prehash)
                .map_err(|e| CryptoError::operation(format!("ECDSA signing failed: {e}")))?;
            Ok(signature.to_bytes().to_vec())
        })
    }

    fn diffie_hellman(&self, peer: &EcPoint) -> Result<Vec<u8>, CryptoError> {
        let shared = match (self, peer) {
            (EcSecret::P256(k), EcPoint::P256(p)) => {
                p256::ecdh::diffie_hellman(k.to_nonzero_scalar(), p.as_affine()).raw_secret_bytes().to_vec()
            }
            (EcSecret::P384(k), EcPoint::P384(p)) => {
                p384::ecdh::diffie_hellman(k.to_nonzero_scalar(), p.as_affine()).raw_secret_bytes().to_vec()
            }
            (EcSecret::P521(k), EcPoint::P521(p)) => {
                p521::ecdh::diffie_hellman(k.to_nonzero_scalar(), p.as_affine()).raw_secret_bytes().to_vec()
            }
            _ => return Err(CryptoError::invalid_access("ECDH keys must use the same named curve")),
        };
        Ok(shared)
    }
}

impl EcPoint {
    pub fn curve(&self) -> NamedCurve {
        match self {
            EcPoint::P256(_) => NamedCurve::P256,
            EcPoint::P384(_) => NamedCurve::P384,
            EcPoint::P521(_) => NamedCurve::P521,
        }
    }

    /// Uncompressed SEC1 point `0x04 || X || Y` of exactly the curve's size.
    pub fn from_uncompressed(curve: NamedCurve, bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 1 + 2 * curve.coordinate_len() || bytes.first() != Some(&0x04) {
            return Err(CryptoError::data(format!("invalid {} raw public key", curve.name())));
        }
        by_curve!(curve, c => c::PublicKey::from_sec1_bytes(bytes)
            .map(EcPoint::from)
            .map_err(|_| CryptoError::data(format!("{} public key is not on the curve", curve.name()))))
    }

    pub fn from_spki(curve: NamedCurve, der: &[u8]) -> Result<Self, CryptoError> {
        by_curve!(curve, c => c::PublicKey::from_public_key_der(der)
            .map(EcPoint::from)
            .map_err(|e| CryptoError::data(format!("invalid {} SubjectPublicKeyInfo: {e}", curve.name()))))
    }

    pub fn to_spki(&self) -> Result<Vec<u8>, CryptoError> {
        each_key!(self, EcPoint, k, _c => k
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| CryptoError::operation(format!("SPKI encoding failed: {e}"))))
    }

    pub fn to_uncompressed(&self) -> Vec<u8> {
        each_key!(self, EcPoint, k, _c => k.to_encoded_point(false).as_bytes().to_vec())
    }

    /// Affine coordinates, each padded to the coordinate length.
    pub fn coordinates(&self) -> (Vec<u8>, Vec<u8>) {
        let len = self.curve().coordinate_len();
        let point = self.to_uncompressed();
        (point[1..1 + len].to_vec(), point[1 + len..].to_vec())
    }

    fn verify_prehash(&self, prehash: &[u8], signature: &[u8]) -> bool {
        if signature.len() != 2 * self.curve().coordinate_len() {
            return false;
        }
        let point = self.to_uncompressed();
        each_key!(self, EcPoint, _k, c => {
            let Ok(verifier) = c::ecdsa::VerifyingKey::from_sec1_bytes(&point) else {
                return false;
            };
            let Ok(signature) = c::ecdsa::Signature::from_slice(signature) else {
                return false;
            };
            verifier.verify_prehash(prehash, &signature).is_ok()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcKind {
    Ecdsa,
    Ecdh,
}

pub struct EcHandler {
    kind: EcKind,
}

impl EcHandler {
    pub fn new(kind: EcKind) -> Self {
        Self { kind }
    }

    fn algorithm(&self, curve: NamedCurve) -> KeyAlgorithm {
        let mut algorithm = KeyAlgorithm::named(self.name());
        algorithm.named_curve = Some(curve);
        algorithm
    }

    fn private_entry(&self, secret: EcSecret, extractable: bool, usages: Usages) -> KeyEntry {
        KeyEntry::new(
            self.algorithm(secret.curve()),
            KeyType::Private,
            extractable,
            usages,
            KeyMaterial::EcPrivate(secret),
        )
    }

    fn public_entry(&self, point: EcPoint, usages: Usages) -> KeyEntry {
        KeyEntry::new(self.algorithm(point.curve()), KeyType::Public, true, usages, KeyMaterial::EcPublic(point))
    }

    fn jwk_alg(&self, curve: NamedCurve) -> Option<&'static str> {
        match (self.kind, curve) {
            (EcKind::Ecdsa, NamedCurve::P256) => Some("ES256"),
            (EcKind::Ecdsa, NamedCurve::P384) => Some("ES384"),
            (EcKind::Ecdsa, NamedCurve::P521) => Some("ES512"),
            (EcKind::Ecdh, _) => None,
        }
    }

    fn import_jwk(&self, jwk: &JsonWebKey, curve: NamedCurve, extractable: bool, usages: Usages) -> Result<KeyEntry, CryptoError> {
        let use_ = if self.kind == EcKind::Ecdsa { "sig" } else { "enc" };
        jwk.check_common("EC", use_, extractable, usages)?;
        if jwk.crv.as_deref() != Some(curve.name()) {
            return Err(CryptoError::data(format!("JWK 'crv' does not match {}", curve.name())));
        }
        if let Some(alg) = self.jwk_alg(curve) {
            jwk.check_alg(alg, &["ES256", "ES384", "ES512"])?;
        }
        let len = curve.coordinate_len();
        let x = jwk.field("x")?;
        let y = jwk.field("y")?;
        if x.len() != len || y.len() != len {
            return Err(CryptoError::data(format!("JWK coordinates must be {len} bytes")));
        }
        let mut sec1 = Vec::with_capacity(1 + 2 * len);
        sec1.push(0x04);
        sec1.extend_from_slice(&x);
        sec1.extend_from_slice(&y);
        let point = EcPoint::from_uncompressed(curve, &sec1)?;
        if jwk.d.is_none() {
            return Ok(self.public_entry(point, usages));
        }
        let secret = EcSecret::from_scalar(curve, &jwk.field("d")?)?;
        if secret.public().to_uncompressed() != sec1 {
            return Err(CryptoError::data("JWK private key does not match its public coordinates"));
        }
        Ok(self.private_entry(secret, extractable, usages))
    }
}

fn ec_secret(key: &KeyEntry) -> Result<&EcSecret, CryptoError> {
    match &key.material {
        KeyMaterial::EcPrivate(secret) => Ok(secret),
        _ => Err(CryptoError::invalid_access("expected an EC private key")),
    }
}

fn ec_point(key: &KeyEntry) -> Result<EcPoint, CryptoError> {
    match &key.material {
        KeyMaterial::EcPublic(point) => Ok(point.clone()),
        KeyMaterial::EcPrivate(secret) => Ok(secret.public()),
        _ => Err(CryptoError::invalid_access("expected an EC key")),
    }
}

impl AlgorithmHandler for EcHandler {
    fn name(&self) -> &'static str {
        match self.kind {
            EcKind::Ecdsa => "ECDSA",
            EcKind::Ecdh => "ECDH",
        }
    }

    fn usage_rules(&self) -> UsageRules {
        match self.kind {
            EcKind::Ecdsa => UsageRules::pair(&[KeyUsage::Sign], &[KeyUsage::Verify]),
            EcKind::Ecdh => UsageRules::pair(&[KeyUsage::DeriveKey, KeyUsage::DeriveBits], &[]),
        }
    }

    fn generate_key(&self, params: &AlgorithmParams, extractable: bool, _usages: Usages) -> Result<GeneratedKey, CryptoError> {
        let secret = EcSecret::random(params.named_curve()?);
        let public = secret.public();
        Ok(GeneratedKey::Pair {
            public: self.public_entry(public, Usages::NONE),
            private: self.private_entry(secret, extractable, Usages::NONE),
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
        let curve = params.named_curve()?;
        match format {
            KeyFormat::Raw => Ok(self.public_entry(EcPoint::from_uncompressed(curve, data.bytes(format)?)?, usages)),
            KeyFormat::Spki => Ok(self.public_entry(EcPoint::from_spki(curve, data.bytes(format)?)?, usages)),
            KeyFormat::Pkcs8 => Ok(self.private_entry(EcSecret::from_pkcs8(curve, data.bytes(format)?)?, extractable, usages)),
            KeyFormat::Jwk => self.import_jwk(data.jwk()?, curve, extractable, usages),
        }
    }

    fn export_key(&self, format: KeyFormat, key: &KeyEntry) -> Result<ExportedKey, CryptoError> {
        match (format, &key.material) {
            (KeyFormat::Raw, KeyMaterial::EcPublic(point)) => Ok(ExportedKey::Bytes(point.to_uncompressed())),
            (KeyFormat::Spki, KeyMaterial::EcPublic(point)) => Ok(ExportedKey::Bytes(point.to_spki()?)),
            (KeyFormat::Pkcs8, KeyMaterial::EcPrivate(secret)) => Ok(ExportedKey::Bytes(secret.to_pkcs8()?)),
            (KeyFormat::Jwk, material) => {
                let point = ec_point(key)?;
                let curve = point.curve();
                let (x, y) = point.coordinates();
                let mut jwk = JsonWebKey::new("EC");
                jwk.crv = Some(curve.name().to_string());
                jwk.x = encode(&x);
                jwk.y = encode(&y);
                if let KeyMaterial::EcPrivate(secret) = material {
                    jwk.d = encode(&left_pad(&secret.scalar(), curve.coordinate_len()));
                }
                let alg = self.jwk_alg(curve).map(str::to_string);
                Ok(ExportedKey::Jwk(jwk.finish(alg, key.extractable, key.usages)))
            }
            _ => Err(CryptoError::invalid_access(format!(
                "a {} key cannot be exported as '{}'",
                key.key_type.as_str(),
                format.as_str()
            ))),
        }
    }

    fn sign(&self, params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.kind != EcKind::Ecdsa {
            return Err(self.unsupported("sign"));
        }
        let hash = params.hash()?;
        ec_secret(key)?.sign_prehash(&hash.digest(data))
    }

    fn verify(&self, params: &AlgorithmParams, key: &KeyEntry, signature: &[u8], data: &[u8]) -> Result<bool, CryptoError> {
        if self.kind != EcKind::Ecdsa {
            return Err(self.unsupported("verify"));
        }
        let hash = params.hash()?;
        Ok(ec_point(key)?.verify_prehash(&hash.digest(data), signature))
    }

    fn derive_bits(
        &self,
        _params: &AlgorithmParams,
        key: &KeyEntry,
        peer: Option<&KeyEntry>,
        length: Option<usize>,
    ) -> Result<Vec<u8>, CryptoError> {
        if self.kind != EcKind::Ecdh {
            return Err(self.unsupported("deriveBits"));
        }
        let peer = peer.ok_or_else(|| CryptoError::type_error("ECDH: public is required"))?;
        let KeyMaterial::EcPublic(point) = &peer.material else {
            return Err(CryptoError::invalid_access("ECDH: public must be an EC public key"));
        };
        let shared = ec_secret(key)?.diffie_hellman(point)?;
        truncate_bits(shared, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ecdsa_pair(curve: &str) -> (KeyEntry, KeyEntry) {
        let params = AlgorithmParams::from_json(json!({ "name": "ECDSA", "namedCurve": curve })).unwrap();
        match EcHandler::new(EcKind::Ecdsa).generate_key(&params, true, Usages::NONE).unwrap() {
            GeneratedKey::Pair { public, private } => (public, private),
            GeneratedKey::Secret(_) => panic!("expected a key pair"),
        }
    }

    #[test]
    fn ecdsa_sign_verify_each_curve() {
        let handler = EcHandler::new(EcKind::Ecdsa);
        for (curve, sig_len) in [("P-256", 64), ("P-384", 96), ("P-521", 132)] {
            let (public, private) = ecdsa_pair(curve);
            let params = AlgorithmParams::from_json(json!({ "name": "ECDSA", "hash": "SHA-256" })).unwrap();
            let signature = handler.sign(&params, &private, b"payload").unwrap();
            assert_eq!(signature.len(), sig_len, "{curve}");
            assert!(handler.verify(&params, &public, &signature, b"payload").unwrap());
            assert!(!handler.verify(&params, &public, &signature, b"tampered").unwrap());
            assert!(!handler.verify(&params, &public, &signature[1..], b"payload").unwrap());
        }
    }

    #[test]
    fn raw_public_key_must_be_uncompressed_and_exact() {
        let (public, _) = ecdsa_pair("P-256");
        let KeyMaterial::EcPublic(point) = &public.material else { panic!("expected a public key") };
        let raw = point.to_uncompressed();
        assert_eq!(raw.len(), 65);
        assert!(EcPoint::from_uncompressed(NamedCurve::P256, &raw).is_ok());
        assert!(EcPoint::from_uncompressed(NamedCurve::P256, &raw[..64]).is_err());
        assert!(EcPoint::from_uncompressed(NamedCurve::P384, &raw).is_err());
    }

    #[test]
    fn jwk_private_round_trip() {
        let handler = EcHandler::new(EcKind::Ecdsa);
        let (_, private) = ecdsa_pair("P-384");
        let ExportedKey::Jwk(jwk) = handler.export_key(KeyFormat::Jwk, &private).unwrap() else {
            panic!("expected a JWK")
        };
        assert_eq!(jwk.crv.as_deref(), Some("P-384"));
        assert_eq!(jwk.alg.as_deref(), Some("ES384"));
        let params = AlgorithmParams::from_json(json!({ "name": "ECDSA", "namedCurve": "P-384" })).unwrap();
        let imported = handler
            .import_key(KeyFormat::Jwk, &KeyData::Jwk(jwk.clone()), &params, true, Usages::of(&[KeyUsage::Sign]))
            .unwrap();
        assert_eq!(imported.key_type, KeyType::Private);

        let mut wrong = jwk;
        wrong.crv = Some("P-256".into());
        assert!(handler
            .import_key(KeyFormat::Jwk, &KeyData::Jwk(wrong), &params, true, Usages::of(&[KeyUsage::Sign]))
            .is_err());
    }

    #[test]
    fn pkcs8_and_spki_round_trip() {
        let handler = EcHandler::new(EcKind::Ecdh);
        let params = AlgorithmParams::from_json(json!({ "name": "ECDH", "namedCurve": "P-521" })).unwrap();
        let GeneratedKey::Pair { public, private } = handler.generate_key(&params, true, Usages::NONE).unwrap() else {
            panic!("expected a key pair")
        };
        let pkcs8 = handler.export_key(KeyFormat::Pkcs8, &private).unwrap().into_bytes();
        let spki = handler.export_key(KeyFormat::Spki, &public).unwrap().into_bytes();
        let private2 = handler
            .import_key(KeyFormat::Pkcs8, &KeyData::Bytes(pkcs8), &params, false, Usages::of(&[KeyUsage::DeriveBits]))
            .unwrap();
        let public2 = handler
            .import_key(KeyFormat::Spki, &KeyData::Bytes(spki), &params, true, Usages::NONE)
            .unwrap();
        let a = handler.derive_bits(&params, &private, Some(&public2), None).unwrap();
        let b = handler.derive_bits(&params, &private2, Some(&public), None).unwrap();
        assert_eq!(a.len(), 66);
        assert_eq!(a, b);
    }

    #[test]
    fn ecdh_rejects_mixed_curves() {
        let handler = EcHandler::new(EcKind::Ecdh);
        let p256 = AlgorithmParams::from_json(json!({ "name": "ECDH", "namedCurve": "P-256" })).unwrap();
        let p384 = AlgorithmParams::from_json(json!({ "name": "ECDH", "namedCurve": "P-384" })).unwrap();
        let GeneratedKey::Pair { private, .. } = handler.generate_key(&p256, true, Usages::NONE).unwrap() else {
            panic!("expected a key pair")
        };
        let GeneratedKey::Pair { public, .. } = handler.generate_key(&p384, true, Usages::NONE).unwrap() else {
            panic!("expected a key pair")
        };
        assert!(matches!(
            handler.derive_bits(&p256, &private, Some(&public), None),
            Err(CryptoError::InvalidAccess(_))
        ));
    }
}
