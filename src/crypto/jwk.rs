//! JSON Web Key (RFC 7517/7518/8037) structure and shared checks.

use serde::{Deserialize, Serialize};

use super::key::Usages;
use super::shared::{b64url_decode, b64url_encode, CryptoError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
}

impl JsonWebKey {
    pub fn from_json(value: serde_json::Value) -> Result<Self, CryptoError> {
        serde_json::from_value(value).map_err(|e| CryptoError::data(format!("invalid JWK: {e}")))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes).map_err(|e| CryptoError::data(format!("invalid JWK: {e}")))
    }

    pub fn new(kty: &str) -> Self {
        Self {
            kty: kty.to_string(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Checks shared by every key type: `kty`, `use`, `ext` and `key_ops`.
    pub fn check_common(&self, kty: &str, use_: &str, extractable: bool, usages: Usages) -> Result<(), CryptoError> {
        if self.kty != kty {
            return Err(CryptoError::data(format!("JWK 'kty' must be '{kty}', got '{}'", self.kty)));
        }
        if let Some(u) = &self.use_ {
            if !usages.is_empty() && u != use_ {
                return Err(CryptoError::data(format!("JWK 'use' must be '{use_}'")));
            }
        }
        if self.ext == Some(false) && extractable {
            return Err(CryptoError::data("JWK 'ext' is false but the key was requested as extractable"));
        }
        if let Some(ops) = &self.key_ops {
            let allowed = Usages::parse(ops).map_err(|e| CryptoError::data(format!("JWK 'key_ops': {e}")))?;
            if !usages.is_subset(allowed) {
                return Err(CryptoError::data("requested usages are not permitted by JWK 'key_ops'"));
            }
        }
        Ok(())
    }

    /// `alg` must equal `expected` when present and recognised; algorithm
    /// names outside `known` are tolerated.
    pub fn check_alg(&self, expected: &str, known: &[&str]) -> Result<(), CryptoError> {
        match &self.alg {
            Some(alg) if alg != expected && known.contains(&alg.as_str()) => Err(CryptoError::data(format!(
                "JWK 'alg' is '{alg}' but '{expected}' was expected"
            ))),
            _ => Ok(()),
        }
    }

    pub fn field(&self, name: &'static str) -> Result<Vec<u8>, CryptoError> {
        let value = match name {
            "k" => &self.k,
            "x" => &self.x,
            "y" => &self.y,
            "d" => &self.d,
            "n" => &self.n,
            "e" => &self.e,
            "p" => &self.p,
            "q" => &self.q,
            "dp" => &self.dp,
            "dq" => &self.dq,
            "qi" => &self.qi,
            _ => &None,
        };
        let value = value
            .as_deref()
            .ok_or_else(|| CryptoError::data(format!("JWK member '{name}' is missing")))?;
        b64url_decode(name, value)
    }

    /// Fill `ext` and `key_ops` for an exported key.
    pub fn finish(mut self, alg: Option<String>, extractable: bool, usages: Usages) -> Self {
        self.alg = alg;
        self.ext = Some(extractable);
        self.key_ops = Some(usages.names().into_iter().map(str::to_string).collect());
        self
    }
}

pub fn encode(bytes: &[u8]) -> Option<String> {
    Some(b64url_encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key::KeyUsage;
    use serde_json::json;

    #[test]
    fn rejects_non_string_alg() {
        let err = JsonWebKey::from_json(json!({ "kty": "oct", "k": "AAAA", "alg": 12 })).unwrap_err();
        assert!(matches!(err, CryptoError::Data(_)));
    }

    #[test]
    fn tolerates_unknown_alg() {
        let jwk = JsonWebKey::from_json(json!({ "kty": "oct", "k": "AAAA", "alg": "X-CUSTOM" })).unwrap();
        assert!(jwk.check_alg("HS256", &["HS1", "HS256", "HS384", "HS512"]).is_ok());
        let jwk = JsonWebKey::from_json(json!({ "kty": "oct", "k": "AAAA", "alg": "HS512" })).unwrap();
        assert!(jwk.check_alg("HS256", &["HS1", "HS256", "HS384", "HS512"]).is_err());
    }

    #[test]
    fn key_ops_limit_usages() {
        let jwk = JsonWebKey::from_json(json!({ "kty": "oct", "k": "AAAA", "key_ops": ["sign"] })).unwrap();
        let sign = Usages::of(&[KeyUsage::Sign]);
        let both = Usages::of(&[KeyUsage::Sign, KeyUsage::Verify]);
        assert!(jwk.check_common("oct", "sig", false, sign).is_ok());
        assert!(jwk.check_common("oct", "sig", false, both).is_err());
        assert!(jwk.check_common("RSA", "sig", false, sign).is_err());
    }

    #[test]
    fn export_shape_skips_empty_members() {
        let mut jwk = JsonWebKey::new("oct");
        jwk.k = encode(&[0xff, 0xee]);
        let json = jwk.finish(Some("HS256".into()), true, Usages::of(&[KeyUsage::Sign])).to_json();
        assert_eq!(json, json!({ "kty": "oct", "k": "_-4", "alg": "HS256", "ext": true, "key_ops": ["sign"] }));
    }
}
