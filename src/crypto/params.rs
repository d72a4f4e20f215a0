//! Normalized algorithm parameters as sent by the JS `crypto.subtle` shim.
//!
//! The shim resolves `hash` to a name, turns every BufferSource into a
//! standard base64 string and replaces `CryptoKey` members by their id.

use serde::{Deserialize, Deserializer};

use super::shared::{b64_decode, CryptoError, HashAlg, NamedCurve};

/// Bytes carried as standard base64 in the params JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Base64Bytes(pub Vec<u8>);

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        b64_decode(&s).map(Base64Bytes).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlgorithmParams {
    pub name: String,
    pub hash: Option<String>,
    pub length: Option<usize>,
    pub named_curve: Option<String>,
    pub modulus_length: Option<usize>,
    pub public_exponent: Option<Base64Bytes>,
    pub iv: Option<Base64Bytes>,
    pub additional_data: Option<Base64Bytes>,
    pub tag_length: Option<usize>,
    pub counter: Option<Base64Bytes>,
    pub label: Option<Base64Bytes>,
    pub salt_length: Option<usize>,
    pub salt: Option<Base64Bytes>,
    pub info: Option<Base64Bytes>,
    pub iterations: Option<u32>,
    /// Key id of the peer public key (ECDH, X25519).
    pub public: Option<u32>,
}

impl AlgorithmParams {
    pub fn from_json(value: serde_json::Value) -> Result<Self, CryptoError> {
        let params: AlgorithmParams = serde_json::from_value(value)
            .map_err(|e| CryptoError::type_error(format!("invalid algorithm parameters: {e}")))?;
        if params.name.is_empty() {
            return Err(CryptoError::type_error("algorithm name is required"));
        }
        Ok(params)
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn hash(&self) -> Result<HashAlg, CryptoError> {
        let name = self
            .hash
            .as_deref()
            .ok_or_else(|| CryptoError::type_error(format!("{}: hash is required", self.name)))?;
        HashAlg::parse(name)
    }

    pub fn named_curve(&self) -> Result<NamedCurve, CryptoError> {
        let name = self
            .named_curve
            .as_deref()
            .ok_or_else(|| CryptoError::type_error(format!("{}: namedCurve is required", self.name)))?;
        NamedCurve::parse(name)
    }

    pub fn required<'a>(&self, field: &'a Option<Base64Bytes>, member: &str) -> Result<&'a [u8], CryptoError> {
        field
            .as_ref()
            .map(|b| b.0.as_slice())
            .ok_or_else(|| CryptoError::type_error(format!("{}: {member} is required", self.name)))
    }

    pub fn optional<'a>(field: &'a Option<Base64Bytes>) -> &'a [u8] {
        field.as_ref().map(|b| b.0.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_buffers_and_names() {
        let params = AlgorithmParams::from_json(json!({
            "name": "AES-GCM",
            "iv": "AAECAwQFBgcICQoL",
            "tagLength": 128,
        }))
        .unwrap();
        assert_eq!(params.required(&params.iv, "iv").unwrap(), &(0u8..12).collect::<Vec<_>>()[..]);
        assert_eq!(params.tag_length, Some(128));
        assert!(params.required(&params.counter, "counter").is_err());
    }

    #[test]
    fn rejects_bad_base64() {
        let err = AlgorithmParams::from_json(json!({ "name": "HKDF", "salt": "***" })).unwrap_err();
        assert!(matches!(err, CryptoError::Type(_)));
    }

    #[test]
    fn hash_is_required_when_asked() {
        let params = AlgorithmParams::named("HMAC");
        assert!(params.hash().is_err());
    }
}
