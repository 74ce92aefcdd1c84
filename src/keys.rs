//! Credential discovery and persistence.
//!
//! Keys live in a flat JSON object mapping service names to secrets:
//!
//! ```json
//! {
//!   "_comment": "entries starting with an underscore are ignored",
//!   "openai": "sk-...",
//!   "anthropic": "sk-ant-..."
//! }
//! ```
//!
//! Resolution order is explicit key, then the key file, then the environment, then an
//! optional caller default.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::provider::{BackendSettings, ServiceBackend, build_backend};
use crate::types::SupplierKind;

/// Timeout for the models-list probe used by validation.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Explicit,
    File,
    Environment,
    Default,
}

/// A credential together with its origin.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub service: String,
    pub key: String,
    pub source: KeySource,
}

impl fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("service", &self.service)
            .field("key", &mask(&self.key))
            .field("source", &self.source)
            .finish()
    }
}

fn mask(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    format!("{visible}***")
}

/// Per-call knobs for [`KeyStore::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Wins over every other source when non-empty.
    pub explicit_key: Option<String>,
    /// Overrides the store-level environment setting.
    pub use_env: Option<bool>,
    /// Returned when no source provides a key.
    pub default_key: Option<String>,
}

impl ResolveOptions {
    pub fn explicit(mut self, key: impl Into<String>) -> Self {
        self.explicit_key = Some(key.into());
        self
    }

    pub fn use_env(mut self, use_env: bool) -> Self {
        self.use_env = Some(use_env);
        self
    }

    pub fn default_key(mut self, key: impl Into<String>) -> Self {
        self.default_key = Some(key.into());
        self
    }
}

/// Outcome of probing a provider with a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValidation {
    /// `None` when the supplier has no probe endpoint.
    pub valid: Option<bool>,
    /// Models listed by the probe, empty when unknown.
    pub models: Vec<String>,
}

/// How [`KeyStore::save`] treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Keep unrelated entries already in the file.
    Merge,
    /// Overwrite the file with exactly the given mapping.
    Replace,
}

/// In-memory view of a credential file plus the environment fallback.
#[derive(Clone)]
pub struct KeyStore {
    path: Option<PathBuf>,
    keys: BTreeMap<String, String>,
    use_env: bool,
    env_lookup: EnvLookup,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("path", &self.path)
            .field("services", &self.keys.keys().collect::<Vec<_>>())
            .field("use_env", &self.use_env)
            .finish()
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    /// Empty store without a backing file that consults the process environment.
    pub fn new() -> Self {
        Self {
            path: None,
            keys: BTreeMap::new(),
            use_env: true,
            env_lookup: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Store seeded from an in-memory mapping.
    pub fn from_keys<I, K, V>(keys: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut store = Self::new();
        store.keys = keys
            .into_iter()
            .map(|(service, key)| (service.into(), key.into()))
            .collect();
        store
    }

    /// Reads the credential file at `path`.
    ///
    /// A missing file yields an empty store that still remembers `path` as its backing
    /// file.
    ///
    /// # Errors
    ///
    /// [`LLMError::CorruptState`] when the file is not a JSON object, [`LLMError::Io`]
    /// when it exists but cannot be read.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, use_env: bool) -> Result<Self, LLMError> {
        let path = path.as_ref();
        let mut store = Self::new();
        store.use_env = use_env;
        store.path = Some(path.to_path_buf());

        if let Some(entries) = read_key_file(path)? {
            for (service, value) in entries {
                if service.starts_with('_') || service == "comment" {
                    continue;
                }
                match value {
                    Value::String(key) if !key.is_empty() => {
                        store.keys.insert(service, key);
                    }
                    _ => tracing::debug!(%service, "skipping non-string credential entry"),
                }
            }
        }
        tracing::debug!(services = store.keys.len(), "loaded credential file");
        Ok(store)
    }

    /// Replaces the environment lookup, mainly for tests.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env_lookup = Arc::new(lookup);
        self
    }

    pub fn with_use_env(mut self, use_env: bool) -> Self {
        self.use_env = use_env;
        self
    }

    /// Sets the file that `add` and `update` persist to.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn use_env(&self) -> bool {
        self.use_env
    }

    /// Credentials held in memory (file-backed or added), keyed by service.
    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }

    /// Environment variable consulted for `service`.
    ///
    /// ```
    /// use kagi_llm::keys::KeyStore;
    ///
    /// assert_eq!(KeyStore::env_var_name("huggingface"), "HF_API_KEY");
    /// assert_eq!(KeyStore::env_var_name("my-service"), "MY_SERVICE_API_KEY");
    /// ```
    pub fn env_var_name(service: &str) -> String {
        match service.to_ascii_lowercase().as_str() {
            "openai" => "OPENAI_API_KEY".to_string(),
            "anthropic" => "ANTHROPIC_API_KEY".to_string(),
            "huggingface" => "HF_API_KEY".to_string(),
            _ => {
                let upper: String = service
                    .chars()
                    .map(|ch| {
                        if ch.is_ascii_alphanumeric() {
                            ch.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                format!("{upper}_API_KEY")
            }
        }
    }

    /// Looks a service up in the file entries, accepting the common spellings
    /// `service`, `service_api_key`, `SERVICE` and `SERVICE_API_KEY`.
    pub fn file_key(&self, service: &str) -> Option<&str> {
        self.entry_name(service)
            .and_then(|name| self.keys.get(name))
            .map(String::as_str)
    }

    /// Spelling under which `service` is stored, in lookup order.
    fn entry_name(&self, service: &str) -> Option<&str> {
        let upper = service.to_ascii_uppercase();
        [
            service.to_string(),
            format!("{service}_api_key"),
            upper.clone(),
            format!("{upper}_API_KEY"),
        ]
        .into_iter()
        .find_map(|candidate| self.keys.get_key_value(&candidate).map(|(name, _)| name.as_str()))
    }

    fn env_key(&self, service: &str) -> Option<String> {
        (self.env_lookup)(&Self::env_var_name(service)).filter(|key| !key.trim().is_empty())
    }

    /// Resolves the credential for `service`.
    ///
    /// # Errors
    ///
    /// [`LLMError::NotFound`] when no source provides a key and no default was given.
    pub fn resolve(&self, service: &str, options: &ResolveOptions) -> Result<ResolvedKey, LLMError> {
        let found = |key: String, source: KeySource| ResolvedKey {
            service: service.to_string(),
            key,
            source,
        };

        if let Some(key) = options.explicit_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(found(key.clone(), KeySource::Explicit));
        }
        if let Some(key) = self.file_key(service) {
            return Ok(found(key.to_string(), KeySource::File));
        }
        if options.use_env.unwrap_or(self.use_env) {
            if let Some(key) = self.env_key(service) {
                return Ok(found(key, KeySource::Environment));
            }
        }
        if let Some(key) = options.default_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(found(key.clone(), KeySource::Default));
        }

        tracing::debug!(%service, env_var = %Self::env_var_name(service), "no credential found");
        Err(LLMError::NotFound {
            service: service.to_string(),
        })
    }

    /// Probes the provider behind `service` with `key` by listing models.
    ///
    /// Rejections (401, 403, any other non-2xx) are reported as `valid: Some(false)`.
    ///
    /// # Errors
    ///
    /// Only transport failures propagate: [`LLMError::ServiceUnreachable`] or
    /// [`LLMError::Timeout`].
    pub async fn validate(
        service: &str,
        key: &str,
        transport: DynHttpTransport,
    ) -> Result<KeyValidation, LLMError> {
        let supplier = SupplierKind::for_service(service);
        if supplier == SupplierKind::Generic {
            return Ok(KeyValidation::default());
        }
        let settings = BackendSettings {
            base_url: None,
            timeout: Some(VALIDATION_TIMEOUT),
        };
        let backend = build_backend(supplier, transport, key, &settings);
        validate_backend(backend.as_ref()).await
    }

    /// [`KeyStore::resolve`] followed by [`KeyStore::validate`].
    pub async fn resolve_validated(
        &self,
        service: &str,
        options: &ResolveOptions,
        transport: DynHttpTransport,
    ) -> Result<(ResolvedKey, KeyValidation), LLMError> {
        let resolved = self.resolve(service, options)?;
        let validation = Self::validate(service, &resolved.key, transport).await?;
        Ok((resolved, validation))
    }

    /// Writes `keys` to `path` as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// [`LLMError::CorruptState`] when merging into a file that is not a JSON object,
    /// [`LLMError::Io`] on write failures.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn save(
        keys: &BTreeMap<String, String>,
        path: impl AsRef<Path>,
        mode: SaveMode,
    ) -> Result<(), LLMError> {
        let path = path.as_ref();
        let mut entries = match mode {
            SaveMode::Merge => read_key_file(path)?.unwrap_or_default(),
            SaveMode::Replace => Map::new(),
        };
        for (service, key) in keys {
            entries.insert(service.clone(), Value::String(key.clone()));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| LLMError::io(parent, err))?;
        }
        let mut text = serde_json::to_string_pretty(&Value::Object(entries))
            .map_err(|err| LLMError::corrupt(path.display().to_string(), err.to_string()))?;
        text.push('\n');
        fs::write(path, text).map_err(|err| LLMError::io(path, err))?;
        tracing::debug!(entries = keys.len(), ?mode, "saved credential file");
        Ok(())
    }

    /// Adds a credential for a service that has none yet.
    ///
    /// # Errors
    ///
    /// [`LLMError::AlreadyExists`] when the store already holds a key for `service`
    /// under any spelling [`KeyStore::file_key`] accepts.
    pub fn add(&mut self, service: &str, key: &str) -> Result<(), LLMError> {
        if self.entry_name(service).is_some() {
            return Err(LLMError::AlreadyExists {
                service: service.to_string(),
            });
        }
        self.store(service, key)
    }

    /// Replaces an existing credential under the spelling it is already stored as.
    ///
    /// # Errors
    ///
    /// [`LLMError::NotFound`] when the store holds no key for `service`.
    pub fn update(&mut self, service: &str, key: &str) -> Result<(), LLMError> {
        let Some(name) = self.entry_name(service).map(str::to_string) else {
            return Err(LLMError::NotFound {
                service: service.to_string(),
            });
        };
        self.store(&name, key)
    }

    fn store(&mut self, service: &str, key: &str) -> Result<(), LLMError> {
        if key.trim().is_empty() {
            return Err(LLMError::Validation {
                message: format!("empty credential for {service}"),
            });
        }
        if let Some(path) = &self.path {
            let single = BTreeMap::from([(service.to_string(), key.to_string())]);
            Self::save(&single, path, SaveMode::Merge)?;
        }
        self.keys.insert(service.to_string(), key.to_string());
        tracing::info!(%service, "stored credential");
        Ok(())
    }

    /// Services with a resolvable key and where that key comes from.
    ///
    /// Environment-provided services are only listed for the well-known names.
    pub fn services(&self) -> Vec<(String, KeySource)> {
        let mut services: Vec<(String, KeySource)> = self
            .keys
            .keys()
            .map(|service| (service.clone(), KeySource::File))
            .collect();
        if self.use_env {
            for known in ["openai", "anthropic", "huggingface"] {
                if self.file_key(known).is_none() && self.env_key(known).is_some() {
                    services.push((known.to_string(), KeySource::Environment));
                }
            }
        }
        services
    }
}

/// Lists models through `backend` and classifies the outcome.
pub async fn validate_backend(backend: &dyn ServiceBackend) -> Result<KeyValidation, LLMError> {
    match backend.list_models().await {
        Ok(models) => Ok(KeyValidation {
            valid: Some(true),
            models,
        }),
        Err(err @ (LLMError::ServiceUnreachable { .. } | LLMError::Timeout { .. })) => Err(err),
        Err(LLMError::UnsupportedFeature { .. }) => Ok(KeyValidation::default()),
        Err(err) => {
            tracing::warn!(provider = backend.name(), error = %err, "credential rejected");
            Ok(KeyValidation {
                valid: Some(false),
                models: Vec::new(),
            })
        }
    }
}

fn read_key_file(path: &Path) -> Result<Option<Map<String, Value>>, LLMError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|err| LLMError::io(path, err))?;
    if text.trim().is_empty() {
        return Ok(Some(Map::new()));
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(entries)) => Ok(Some(entries)),
        Ok(_) => Err(LLMError::corrupt(
            path.display().to_string(),
            "credential file must contain a JSON object",
        )),
        Err(err) => Err(LLMError::corrupt(path.display().to_string(), err.to_string())),
    }
}
