use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ServiceClient;
use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::keys::KeyStore;
use crate::types::SupplierKind;

/// Declarative description of one service handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Handle name; defaults to `service`.
    #[serde(default)]
    pub name: Option<String>,
    /// Service name used for credential lookup, such as `openai`.
    pub service: String,
    pub model: String,
    /// Inferred from `service` when absent.
    #[serde(default)]
    pub supplier: Option<SupplierKind>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token_budget: Option<i64>,
    /// Key that takes precedence over the key store.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub use_env: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ServiceConfig {
    pub fn new(service: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: None,
            service: service.into(),
            model: model.into(),
            supplier: None,
            base_url: None,
            token_budget: None,
            api_key: None,
            use_env: None,
            timeout_secs: None,
        }
    }

    /// Handle name: `name` or, when unset, `service`.
    pub fn handle(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.service)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    List(Vec<ServiceConfig>),
    Wrapped { services: Vec<ServiceConfig> },
}

/// Reads service configs from a JSON file holding either a list or
/// `{"services": [...]}`.
#[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
pub fn load_service_configs(path: impl AsRef<Path>) -> Result<Vec<ServiceConfig>, LLMError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|err| LLMError::io(path, err))?;
    let file: ConfigFile = serde_json::from_str(&text)
        .map_err(|err| LLMError::corrupt(path.display().to_string(), err.to_string()))?;
    let configs = match file {
        ConfigFile::List(configs) | ConfigFile::Wrapped { services: configs } => configs,
    };
    tracing::debug!(services = configs.len(), "loaded service configs");
    Ok(configs)
}

/// Builds one handle. A missing credential yields an uninitialized handle, not an
/// error.
pub fn build_service_from_config(
    config: &ServiceConfig,
    keys: &KeyStore,
    transport: Option<DynHttpTransport>,
) -> Result<ServiceClient, LLMError> {
    if config.service.trim().is_empty() {
        return Err(LLMError::Validation {
            message: "service config requires a service name".to_string(),
        });
    }
    if config.model.trim().is_empty() {
        return Err(LLMError::Validation {
            message: format!("service config {} requires a model", config.handle()),
        });
    }

    let mut builder = ServiceClient::builder(config.service.clone(), config.model.clone());
    if let Some(budget) = config.token_budget {
        builder = builder.token_budget(budget);
    }
    if let Some(key) = &config.api_key {
        builder = builder.explicit_key(key.clone());
    }
    if let Some(use_env) = config.use_env {
        builder = builder.use_env(use_env);
    }
    if let Some(supplier) = config.supplier {
        builder = builder.supplier(supplier);
    }
    if let Some(base_url) = &config.base_url {
        builder = builder.base_url(base_url.clone());
    }
    if let Some(secs) = config.timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if let Some(transport) = transport {
        builder = builder.transport(transport);
    }
    Ok(builder.build(keys))
}

/// Builds every configured handle, keyed by handle name.
///
/// # Errors
///
/// [`LLMError::Validation`] for duplicate handle names or incomplete entries.
pub fn build_services_from_configs(
    configs: &[ServiceConfig],
    keys: &KeyStore,
    transport: Option<DynHttpTransport>,
) -> Result<BTreeMap<String, ServiceClient>, LLMError> {
    let mut services = BTreeMap::new();
    for config in configs {
        let handle = config.handle().to_string();
        if services.contains_key(&handle) {
            return Err(LLMError::Validation {
                message: format!("duplicate service handle: {handle}"),
            });
        }
        let client = build_service_from_config(config, keys, transport.clone())?;
        services.insert(handle, client);
    }
    Ok(services)
}
