//! WebCrypto (`crypto.subtle`) core.
//!
//! Algorithm families implement [`AlgorithmHandler`] and are registered in
//! an [`AlgorithmRegistry`] keyed by canonical name; registering a handler
//! under an existing name replaces the previous one. The registry methods
//! are the dispatcher: they resolve key ids against the request's
//! [`KeyTable`], enforce usages, key roles and extractability before any
//! cryptographic work, and delegate to the handler.

pub mod aes;
pub mod ec;
pub mod ed25519;
pub mod hmac;
pub mod jwk;
pub mod kdf;
pub mod key;
pub mod params;
pub mod rsa;
pub mod shared;
pub mod x25519;

use std::collections::HashMap;

use serde_json::{json, Value as JsonValue};

use self::jwk::JsonWebKey;
use self::key::{KeyEntry, KeyTable, KeyType, KeyUsage, UsageRules, Usages};
use self::params::AlgorithmParams;
pub use self::shared::{CryptoError, HashAlg, KeyFormat};

/// Key data handed to `importKey`.
pub enum KeyData {
    Bytes(Vec<u8>),
    Jwk(JsonWebKey),
}

impl KeyData {
    pub fn bytes(&self, format: KeyFormat) -> Result<&[u8], CryptoError> {
        match self {
            KeyData::Bytes(b) => Ok(b),
            KeyData::Jwk(_) => Err(CryptoError::type_error(format!(
                "'{}' key data must be a BufferSource",
                format.as_str()
            ))),
        }
    }

    pub fn jwk(&self) -> Result<&JsonWebKey, CryptoError> {
        match self {
            KeyData::Jwk(jwk) => Ok(jwk),
            KeyData::Bytes(_) => Err(CryptoError::type_error("'jwk' key data must be a JSON Web Key object")),
        }
    }
}

/// Result of `exportKey`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportedKey {
    Bytes(Vec<u8>),
    Jwk(JsonWebKey),
}

impl ExportedKey {
    /// Serialized form used by `wrapKey`.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ExportedKey::Bytes(b) => b,
            ExportedKey::Jwk(jwk) => jwk.to_json().to_string().into_bytes(),
        }
    }
}

pub enum GeneratedKey {
    Secret(KeyEntry),
    Pair { public: KeyEntry, private: KeyEntry },
}

/// One algorithm family. Operations an algorithm does not support keep the
/// default `NotSupportedError` implementation.
pub trait AlgorithmHandler: Send + Sync {
    /// Canonical name, as reported in `CryptoKey.algorithm.name`.
    fn name(&self) -> &'static str;

    fn usage_rules(&self) -> UsageRules;

    fn generate_key(&self, _params: &AlgorithmParams, _extractable: bool, _usages: Usages) -> Result<GeneratedKey, CryptoError> {
        Err(self.unsupported("generateKey"))
    }

    fn import_key(
        &self,
        format: KeyFormat,
        data: &KeyData,
        params: &AlgorithmParams,
        extractable: bool,
        usages: Usages,
    ) -> Result<KeyEntry, CryptoError>;

    fn export_key(&self, format: KeyFormat, _key: &KeyEntry) -> Result<ExportedKey, CryptoError> {
        Err(CryptoError::unsupported_format(format, self.name()))
    }

    fn sign(&self, _params: &AlgorithmParams, _key: &KeyEntry, _data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(self.unsupported("sign"))
    }

    fn verify(&self, _params: &AlgorithmParams, _key: &KeyEntry, _signature: &[u8], _data: &[u8]) -> Result<bool, CryptoError> {
        Err(self.unsupported("verify"))
    }

    fn encrypt(&self, _params: &AlgorithmParams, _key: &KeyEntry, _data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(self.unsupported("encrypt"))
    }

    fn decrypt(&self, _params: &AlgorithmParams, _key: &KeyEntry, _data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(self.unsupported("decrypt"))
    }

    fn derive_bits(
        &self,
        _params: &AlgorithmParams,
        _key: &KeyEntry,
        _peer: Option<&KeyEntry>,
        _length: Option<usize>,
    ) -> Result<Vec<u8>, CryptoError> {
        Err(self.unsupported("deriveBits"))
    }

    /// Length in bits of a key of this algorithm produced by `deriveKey`.
    fn derived_key_length(&self, _params: &AlgorithmParams) -> Result<Option<usize>, CryptoError> {
        Err(self.unsupported("deriveKey"))
    }

    fn wrap(&self, params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(params, key, data)
    }

    fn unwrap(&self, params: &AlgorithmParams, key: &KeyEntry, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt(params, key, data)
    }

    fn unsupported(&self, op: &str) -> CryptoError {
        CryptoError::not_supported(format!("{} does not support {op}", self.name()))
    }
}

/// Handles returned to JS for a generated or imported key.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyHandle {
    Single(JsonValue),
    Pair { public: JsonValue, private: JsonValue },
}

impl KeyHandle {
    pub fn to_json(&self) -> JsonValue {
        match self {
            KeyHandle::Single(key) => key.clone(),
            KeyHandle::Pair { public, private } => json!({ "publicKey": public, "privateKey": private }),
        }
    }
}

pub struct AlgorithmRegistry {
    handlers: HashMap<String, Box<dyn AlgorithmHandler>>,
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AlgorithmRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in algorithm family.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(hmac::HmacHandler));
        for mode in [aes::AesMode::Gcm, aes::AesMode::Cbc, aes::AesMode::Ctr, aes::AesMode::Kw] {
            registry.register(Box::new(aes::AesHandler::new(mode)));
        }
        for scheme in [rsa::RsaScheme::Pkcs1v15, rsa::RsaScheme::Pss, rsa::RsaScheme::Oaep] {
            registry.register(Box::new(rsa::RsaHandler::new(scheme)));
        }
        registry.register(Box::new(ec::EcHandler::new(ec::EcKind::Ecdsa)));
        registry.register(Box::new(ec::EcHandler::new(ec::EcKind::Ecdh)));
        registry.register(Box::new(ed25519::Ed25519Handler));
        registry.register(Box::new(x25519::X25519Handler));
        registry.register(Box::new(kdf::KdfHandler::new(kdf::Kdf::Hkdf)));
        registry.register(Box::new(kdf::KdfHandler::new(kdf::Kdf::Pbkdf2)));
        registry
    }

    /// Install `handler`, replacing any handler with the same name.
    pub fn register(&mut self, handler: Box<dyn AlgorithmHandler>) {
        self.handlers.insert(handler.name().to_ascii_uppercase(), handler);
    }

    pub fn get(&self, name: &str) -> Result<&dyn AlgorithmHandler, CryptoError> {
        self.handlers
            .get(&name.to_ascii_uppercase())
            .map(|h| h.as_ref())
            .ok_or_else(|| CryptoError::type_error(format!("Unrecognized algorithm name '{name}'")))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.values().map(|h| h.name()).collect();
        names.sort_unstable();
        names
    }

    // ── Operations ───────────────────────────────────────────────────────

    pub fn digest(&self, algorithm: &str, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(HashAlg::parse(algorithm)?.digest(data))
    }

    pub fn generate_key(
        &self,
        keys: &mut KeyTable,
        params: &AlgorithmParams,
        extractable: bool,
        usages: &[String],
    ) -> Result<KeyHandle, CryptoError> {
        let handler = self.get(&params.name)?;
        let requested = Usages::parse(usages)?;
        let rules = handler.usage_rules();
        if !requested.is_subset(rules.all()) {
            return Err(CryptoError::type_error(format!(
                "unsupported key usage for {}: {}",
                handler.name(),
                usages.join(", ")
            )));
        }
        match handler.generate_key(params, extractable, requested)? {
            GeneratedKey::Secret(mut entry) => {
                entry.usages = requested.intersect(rules.for_generate(KeyType::Secret));
                ensure_usable(&entry)?;
                let id = keys.insert(entry);
                Ok(KeyHandle::Single(keys.get(id)?.describe(id)))
            }
            GeneratedKey::Pair {
                mut public,
                mut private,
            } => {
                public.usages = requested.intersect(rules.for_generate(KeyType::Public));
                public.extractable = true;
                private.usages = requested.intersect(rules.for_generate(KeyType::Private));
                ensure_usable(&private)?;
                let public_id = keys.insert(public);
                let private_id = keys.insert(private);
                Ok(KeyHandle::Pair {
                    public: keys.get(public_id)?.describe(public_id),
                    private: keys.get(private_id)?.describe(private_id),
                })
            }
        }
    }

    pub fn import_key(
        &self,
        keys: &mut KeyTable,
        format: KeyFormat,
        data: &KeyData,
        params: &AlgorithmParams,
        extractable: bool,
        usages: &[String],
    ) -> Result<JsonValue, CryptoError> {
        let handler = self.get(&params.name)?;
        let requested = Usages::parse(usages)?;
        let entry = self.import_entry(handler, format, data, params, extractable, requested)?;
        let id = keys.insert(entry);
        Ok(keys.get(id)?.describe(id))
    }

    fn import_entry(
        &self,
        handler: &dyn AlgorithmHandler,
        format: KeyFormat,
        data: &KeyData,
        params: &AlgorithmParams,
        extractable: bool,
        usages: Usages,
    ) -> Result<KeyEntry, CryptoError> {
        let mut entry = handler.import_key(format, data, params, extractable, usages)?;
        let allowed = handler.usage_rules().for_import(entry.key_type);
        if !usages.is_subset(allowed) {
            return Err(CryptoError::type_error(format!(
                "unsupported key usage for a {} {} key",
                handler.name(),
                entry.key_type.as_str()
            )));
        }
        entry.usages = usages;
        if entry.key_type == KeyType::Public {
            entry.extractable = true;
        }
        ensure_usable(&entry)?;
        Ok(entry)
    }

    pub fn export_key(&self, keys: &KeyTable, format: KeyFormat, key_id: u32) -> Result<ExportedKey, CryptoError> {
        let key = keys.get(key_id)?;
        self.export_entry(format, key)
    }

    fn export_entry(&self, format: KeyFormat, key: &KeyEntry) -> Result<ExportedKey, CryptoError> {
        if !key.extractable {
            return Err(CryptoError::invalid_access("key is not extractable"));
        }
        self.get(key.algorithm.name)?.export_key(format, key)
    }

    pub fn sign(&self, keys: &KeyTable, params: &AlgorithmParams, key_id: u32, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (handler, key) = self.resolve(keys, params, key_id, KeyUsage::Sign)?;
        if key.key_type == KeyType::Public {
            return Err(CryptoError::type_error("sign requires a private or secret key"));
        }
        handler.sign(params, key, data)
    }

    pub fn verify(
        &self,
        keys: &KeyTable,
        params: &AlgorithmParams,
        key_id: u32,
        signature: &[u8],
        data: &[u8],
    ) -> Result<bool, CryptoError> {
        let (handler, key) = self.resolve(keys, params, key_id, KeyUsage::Verify)?;
        handler.verify(params, key, signature, data)
    }

    pub fn encrypt(&self, keys: &KeyTable, params: &AlgorithmParams, key_id: u32, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (handler, key) = self.resolve(keys, params, key_id, KeyUsage::Encrypt)?;
        handler.encrypt(params, key, data)
    }

    pub fn decrypt(&self, keys: &KeyTable, params: &AlgorithmParams, key_id: u32, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (handler, key) = self.resolve(keys, params, key_id, KeyUsage::Decrypt)?;
        if key.key_type == KeyType::Public {
            return Err(CryptoError::type_error("decrypt requires a private or secret key"));
        }
        handler.decrypt(params, key, data)
    }

    pub fn derive_bits(
        &self,
        keys: &KeyTable,
        params: &AlgorithmParams,
        key_id: u32,
        length: Option<usize>,
    ) -> Result<Vec<u8>, CryptoError> {
        let (handler, key) = self.resolve(keys, params, key_id, KeyUsage::DeriveBits)?;
        self.derive_with(handler, keys, params, key, length)
    }

    fn derive_with(
        &self,
        handler: &dyn AlgorithmHandler,
        keys: &KeyTable,
        params: &AlgorithmParams,
        key: &KeyEntry,
        length: Option<usize>,
    ) -> Result<Vec<u8>, CryptoError> {
        if key.key_type == KeyType::Public {
            return Err(CryptoError::type_error("key derivation requires a private or secret key"));
        }
        let peer = match params.public {
            Some(id) => {
                let peer = keys.get(id)?;
                if peer.key_type != KeyType::Public {
                    return Err(CryptoError::invalid_access("'public' must be a public key"));
                }
                if peer.algorithm.name != key.algorithm.name {
                    return Err(CryptoError::invalid_access("'public' key algorithm does not match the base key"));
                }
                Some(peer)
            }
            None => None,
        };
        handler.derive_bits(params, key, peer, length)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn derive_key(
        &self,
        keys: &mut KeyTable,
        params: &AlgorithmParams,
        base_key_id: u32,
        derived: &AlgorithmParams,
        extractable: bool,
        usages: &[String],
    ) -> Result<JsonValue, CryptoError> {
        let target = self.get(&derived.name)?;
        let requested = Usages::parse(usages)?;
        let bits = {
            let (handler, base) = self.resolve(keys, params, base_key_id, KeyUsage::DeriveKey)?;
            let length = target.derived_key_length(derived)?;
            self.derive_with(handler, keys, params, base, length)?
        };
        let entry = self.import_entry(target, KeyFormat::Raw, &KeyData::Bytes(bits), derived, extractable, requested)?;
        let id = keys.insert(entry);
        Ok(keys.get(id)?.describe(id))
    }

    pub fn wrap_key(
        &self,
        keys: &KeyTable,
        format: KeyFormat,
        key_id: u32,
        wrapping_key_id: u32,
        params: &AlgorithmParams,
    ) -> Result<Vec<u8>, CryptoError> {
        let (handler, wrapping_key) = self.resolve(keys, params, wrapping_key_id, KeyUsage::WrapKey)?;
        let exported = self.export_entry(format, keys.get(key_id)?)?;
        handler.wrap(params, wrapping_key, &exported.into_bytes())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn unwrap_key(
        &self,
        keys: &mut KeyTable,
        format: KeyFormat,
        wrapped: &[u8],
        unwrapping_key_id: u32,
        params: &AlgorithmParams,
        unwrapped: &AlgorithmParams,
        extractable: bool,
        usages: &[String],
    ) -> Result<JsonValue, CryptoError> {
        let bytes = {
            let (handler, unwrapping_key) = self.resolve(keys, params, unwrapping_key_id, KeyUsage::UnwrapKey)?;
            if unwrapping_key.key_type == KeyType::Public {
                return Err(CryptoError::type_error("unwrapKey requires a private or secret key"));
            }
            handler.unwrap(params, unwrapping_key, wrapped)?
        };
        let data = match format {
            KeyFormat::Jwk => KeyData::Jwk(JsonWebKey::from_slice(&bytes)?),
            _ => KeyData::Bytes(bytes),
        };
        self.import_key(keys, format, &data, unwrapped, extractable, usages)
    }

    /// Look up the handler and key for an operation and check that the key
    /// belongs to the algorithm and carries `usage`.
    fn resolve<'k>(
        &self,
        keys: &'k KeyTable,
        params: &AlgorithmParams,
        key_id: u32,
        usage: KeyUsage,
    ) -> Result<(&dyn AlgorithmHandler, &'k KeyEntry), CryptoError> {
        let handler = self.get(&params.name)?;
        let key = keys.get(key_id)?;
        if !key.usages.contains(usage) {
            return Err(CryptoError::type_error(format!(
                "key does not support the '{}' operation",
                usage.as_str()
            )));
        }
        if key.algorithm.name != handler.name() {
            return Err(CryptoError::invalid_access(format!(
                "key algorithm {} does not match {}",
                key.algorithm.name,
                handler.name()
            )));
        }
        Ok((handler, key))
    }
}

fn ensure_usable(entry: &KeyEntry) -> Result<(), CryptoError> {
    if entry.usages.is_empty() && entry.key_type != KeyType::Public {
        return Err(CryptoError::type_error(format!(
            "usages cannot be empty for a {} key",
            entry.key_type.as_str()
        )));
    }
    Ok(())
}
