use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use spki::der::asn1::BitStringRef;
use spki::der::{Decode, Encode};

use crate::error::OpError;

pub const ED25519_OID: const_oid::ObjectIdentifier = const_oid::ObjectIdentifier::new_unwrap("1.3.101.112");
pub const X25519_OID: const_oid::ObjectIdentifier = const_oid::ObjectIdentifier::new_unwrap("1.3.101.110");

/// Failure of a WebCrypto operation, tagged with the JS class it is thrown as.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CryptoError {
    #[error("TypeError: {0}")]
    Type(String),
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("DataError: {0}")]
    Data(String),
    #[error("InvalidAccessError: {0}")]
    InvalidAccess(String),
    #[error("OperationError: {0}")]
    Operation(String),
    #[error("NotSupportedError: {0}")]
    NotSupported(String),
}

impl CryptoError {
    pub fn type_error(msg: impl Into<String>) -> Self {
        CryptoError::Type(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        CryptoError::Data(msg.into())
    }

    pub fn invalid_access(msg: impl Into<String>) -> Self {
        CryptoError::InvalidAccess(msg.into())
    }

    pub fn operation(msg: impl Into<String>) -> Self {
        CryptoError::Operation(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        CryptoError::NotSupported(msg.into())
    }

    pub fn unsupported_format(format: KeyFormat, algorithm: &str) -> Self {
        CryptoError::NotSupported(format!("{} keys cannot be handled in '{}' format", algorithm, format.as_str()))
    }
}

impl From<CryptoError> for OpError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Type(m) => OpError::Type(m),
            CryptoError::Syntax(m) => OpError::Syntax(m),
            CryptoError::Data(m) => OpError::dom("DataError", m),
            CryptoError::InvalidAccess(m) => OpError::dom("InvalidAccessError", m),
            CryptoError::Operation(m) => OpError::dom("OperationError", m),
            CryptoError::NotSupported(m) => OpError::dom("NotSupportedError", m),
        }
    }
}

// ── Key formats ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    Raw,
    Jwk,
    Spki,
    Pkcs8,
}

impl KeyFormat {
    pub fn parse(format: &str) -> Result<Self, CryptoError> {
        match format {
            "raw" => Ok(KeyFormat::Raw),
            "jwk" => Ok(KeyFormat::Jwk),
            "spki" => Ok(KeyFormat::Spki),
            "pkcs8" => Ok(KeyFormat::Pkcs8),
            other => Err(CryptoError::type_error(format!("Unsupported key format '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyFormat::Raw => "raw",
            KeyFormat::Jwk => "jwk",
            KeyFormat::Spki => "spki",
            KeyFormat::Pkcs8 => "pkcs8",
        }
    }
}

// ── Hashes ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn parse(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_uppercase().as_str() {
            "SHA-1" => Ok(HashAlg::Sha1),
            "SHA-256" => Ok(HashAlg::Sha256),
            "SHA-384" => Ok(HashAlg::Sha384),
            "SHA-512" => Ok(HashAlg::Sha512),
            _ => Err(CryptoError::type_error(format!("Unrecognized hash algorithm '{name}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlg::Sha1 => "SHA-1",
            HashAlg::Sha256 => "SHA-256",
            HashAlg::Sha384 => "SHA-384",
            HashAlg::Sha512 => "SHA-512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlg::Sha1 => Sha1::digest(data).to_vec(),
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => Sha384::digest(data).to_vec(),
            HashAlg::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest suffix used by JWK `alg` names (`HS256`, `RS1`, ...).
    pub fn jwk_suffix(self) -> &'static str {
        match self {
            HashAlg::Sha1 => "1",
            HashAlg::Sha256 => "256",
            HashAlg::Sha384 => "384",
            HashAlg::Sha512 => "512",
        }
    }
}

// ── Curves ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedCurve {
    P256,
    P384,
    P521,
}

impl NamedCurve {
    pub fn parse(name: &str) -> Result<Self, CryptoError> {
        match name {
            "P-256" => Ok(NamedCurve::P256),
            "P-384" => Ok(NamedCurve::P384),
            "P-521" => Ok(NamedCurve::P521),
            _ => Err(CryptoError::not_supported(format!("Unsupported named curve '{name}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NamedCurve::P256 => "P-256",
            NamedCurve::P384 => "P-384",
            NamedCurve::P521 => "P-521",
        }
    }

    /// Length of one affine coordinate (and of the private scalar) in bytes.
    pub fn coordinate_len(self) -> usize {
        match self {
            NamedCurve::P256 => 32,
            NamedCurve::P384 => 48,
            NamedCurve::P521 => 66,
        }
    }
}

// ── Encodings ────────────────────────────────────────────────────────────

pub fn b64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(field: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|_| CryptoError::type_error(format!("JWK member '{field}' is not valid base64url")))
}

pub fn b64_decode(value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value)
        .map_err(|_| CryptoError::type_error("invalid base64 in algorithm parameters"))
}

/// Left-pad `bytes` with zeros to `len`.
pub fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

/// Truncate derived bits to `length` bits (a multiple of 8).
pub fn truncate_bits(mut bits: Vec<u8>, length: Option<usize>) -> Result<Vec<u8>, CryptoError> {
    let Some(length) = length else {
        return Ok(bits);
    };
    if length % 8 != 0 {
        return Err(CryptoError::operation("length must be a multiple of 8"));
    }
    if length / 8 > bits.len() {
        return Err(CryptoError::operation(format!(
            "length {length} exceeds the {} bits available",
            bits.len() * 8
        )));
    }
    bits.truncate(length / 8);
    Ok(bits)
}

// ── OKP containers (Ed25519, X25519) ─────────────────────────────────────

pub fn okp_spki_encode(oid: const_oid::ObjectIdentifier, public: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let info = spki::SubjectPublicKeyInfoRef {
        algorithm: spki::AlgorithmIdentifierRef { oid, parameters: None },
        subject_public_key: BitStringRef::from_bytes(public)
            .map_err(|e| CryptoError::operation(format!("SPKI encoding failed: {e}")))?,
    };
    info.to_der()
        .map_err(|e| CryptoError::operation(format!("SPKI encoding failed: {e}")))
}

pub fn okp_spki_decode(oid: const_oid::ObjectIdentifier, der: &[u8]) -> Result<[u8; 32], CryptoError> {
    let info = spki::SubjectPublicKeyInfoRef::from_der(der)
        .map_err(|e| CryptoError::data(format!("invalid SubjectPublicKeyInfo: {e}")))?;
    if info.algorithm.oid != oid || info.algorithm.parameters.is_some() {
        return Err(CryptoError::data("SubjectPublicKeyInfo algorithm does not match"));
    }
    info.subject_public_key
        .as_bytes()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or_else(|| CryptoError::data("public key must be 32 bytes"))
}

/// PKCS#8 with `CurvePrivateKey ::= OCTET STRING` (RFC 8410).
pub fn okp_pkcs8_encode(oid: const_oid::ObjectIdentifier, private: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let mut curve_key = vec![0x04, 0x20];
    curve_key.extend_from_slice(private);
    let info = pkcs8::PrivateKeyInfo::new(spki::AlgorithmIdentifierRef { oid, parameters: None }, &curve_key);
    info.to_der()
        .map_err(|e| CryptoError::operation(format!("PKCS#8 encoding failed: {e}")))
}

pub fn okp_pkcs8_decode(oid: const_oid::ObjectIdentifier, der: &[u8]) -> Result<[u8; 32], CryptoError> {
    let info = pkcs8::PrivateKeyInfo::from_der(der)
        .map_err(|e| CryptoError::data(format!("invalid PrivateKeyInfo: {e}")))?;
    if info.algorithm.oid != oid || info.algorithm.parameters.is_some() {
        return Err(CryptoError::data("PrivateKeyInfo algorithm does not match"));
    }
    match info.private_key {
        [0x04, 0x20, rest @ ..] if rest.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(rest);
            Ok(out)
        }
        _ => Err(CryptoError::data("private key must be a 32-byte OCTET STRING")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_answer() {
        let digest = HashAlg::Sha256.digest(b"hello");
        assert_eq!(digest.len(), 32);
        assert_eq!(
            digest.iter().map(|b| format!("{b:02x}")).collect::<String>(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hash_names_are_case_insensitive() {
        assert_eq!(HashAlg::parse("sha-384").unwrap(), HashAlg::Sha384);
        assert!(matches!(HashAlg::parse("MD5"), Err(CryptoError::Type(_))));
    }

    #[test]
    fn truncation_rules() {
        assert_eq!(truncate_bits(vec![1, 2, 3], Some(16)).unwrap(), vec![1, 2]);
        assert!(truncate_bits(vec![1], Some(12)).is_err());
        assert!(truncate_bits(vec![1], Some(16)).is_err());
        assert_eq!(truncate_bits(vec![1, 2], None).unwrap(), vec![1, 2]);
    }

    #[test]
    fn crypto_errors_map_to_js_classes() {
        let err: OpError = CryptoError::operation("bad tag").into();
        assert_eq!(err.js_name(), "OperationError");
        let err: OpError = CryptoError::type_error("nope").into();
        assert_eq!(err.js_name(), "TypeError");
    }

    #[test]
    fn okp_containers_round_trip() {
        let public = [9u8; 32];
        let der = okp_spki_encode(ED25519_OID, &public).unwrap();
        assert_eq!(okp_spki_decode(ED25519_OID, &der).unwrap(), public);
        assert!(okp_spki_decode(X25519_OID, &der).is_err());

        let der = okp_pkcs8_encode(X25519_OID, &[5u8; 32]).unwrap();
        assert_eq!(okp_pkcs8_decode(X25519_OID, &der).unwrap(), [5u8; 32]);
        assert!(okp_pkcs8_decode(ED25519_OID, &der).is_err());
    }
}
