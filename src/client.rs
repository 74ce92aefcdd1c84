use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::LLMError;
use crate::extract::{extract_answer, lookup};
use crate::http::DynHttpTransport;
use crate::http::reqwest::default_dyn_transport;
use crate::keys::{KeyStore, ResolveOptions, validate_backend};
use crate::provider::{BackendSettings, DynBackend, build_backend};
use crate::stream::relay;
use crate::types::{
    CapabilityDescriptor, ChatOptions, ImageOptions, Message, ServiceStatus, SupplierKind,
    TokenUsage,
};

/// Token budget assigned when the builder is not given one.
pub const DEFAULT_TOKEN_BUDGET: i64 = 1_000_000;

/// Rough token count used when a provider does not report usage: one token per four
/// characters, rounded up.
///
/// ```
/// use kagi_llm::client::estimate_tokens;
///
/// assert_eq!(estimate_tokens(""), 0);
/// assert_eq!(estimate_tokens("abcde"), 2);
/// ```
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Handle bound to one service and model.
///
/// The handle owns its token accounting. Every operation that reaches the provider first
/// checks that a credential was bound (`NotInitialized`) and that the budget is not on
/// hold (`BudgetExhausted`), and on success charges the tokens it consumed. Responses are
/// returned as raw JSON; use [`crate::extract`] to read them.
pub struct ServiceClient {
    service: String,
    model: String,
    supplier: SupplierKind,
    backend: Option<DynBackend>,
    token_budget: AtomicI64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    on_hold: AtomicBool,
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("status", &self.status())
            .finish()
    }
}

impl ServiceClient {
    /// Starts building a handle for `service` talking to `model`.
    pub fn builder(service: impl Into<String>, model: impl Into<String>) -> ServiceClientBuilder {
        ServiceClientBuilder {
            service: service.into(),
            model: model.into(),
            token_budget: DEFAULT_TOKEN_BUDGET,
            explicit_key: None,
            use_env: None,
            supplier: None,
            base_url: None,
            timeout: None,
            transport: None,
            backend: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn supplier(&self) -> SupplierKind {
        self.supplier
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    /// Initialized and not on hold.
    pub fn is_available(&self) -> bool {
        self.is_initialized() && !self.on_hold.load(Ordering::SeqCst)
    }

    /// Snapshot of the handle's accounting state.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            service: self.service.clone(),
            model: self.model.clone(),
            supplier: self.supplier,
            initialized: self.is_initialized(),
            token_budget: self.token_budget.load(Ordering::SeqCst),
            tokens_in: self.tokens_in.load(Ordering::SeqCst),
            tokens_out: self.tokens_out.load(Ordering::SeqCst),
            on_hold: self.on_hold.load(Ordering::SeqCst),
        }
    }

    /// Operations offered by the bound backend.
    pub fn capabilities(&self) -> Result<CapabilityDescriptor, LLMError> {
        Ok(self.backend()?.capabilities())
    }

    /// Raises the budget by `amount` and returns the new budget.
    ///
    /// The hold is lifted when the result is positive. There is no upper bound.
    pub fn bump_budget(&self, amount: i64) -> i64 {
        let previous = self
            .token_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
                Some(budget.saturating_add(amount))
            })
            .unwrap_or_else(|budget| budget);
        let budget = previous.saturating_add(amount);
        let was_on_hold = self.on_hold.swap(budget <= 0, Ordering::SeqCst);
        if was_on_hold && budget > 0 {
            tracing::info!(service = %self.service, budget, "token budget restored, hold lifted");
        }
        budget
    }

    /// Chat completion over `messages`; `options.model` overrides the bound model.
    #[tracing::instrument(level = "debug", skip_all, fields(service = %self.service))]
    pub async fn chat_complete(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<Value, LLMError> {
        let backend = self.admit()?;
        let response = backend
            .chat_complete(self.model_for(options), messages, options)
            .await?;

        let usage = backend.usage_from_response(&response).unwrap_or_else(|| {
            let input: String = messages.iter().map(|m| m.content.as_str()).collect();
            estimated(&input, &response_text(self.supplier, &response))
        });
        self.charge(usage);
        Ok(response)
    }

    /// Single-prompt text completion.
    #[tracing::instrument(level = "debug", skip_all, fields(service = %self.service))]
    pub async fn text_complete(
        &self,
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<Value, LLMError> {
        let backend = self.admit()?;
        let response = backend
            .text_complete(self.model_for(options), prompt, options)
            .await?;

        let usage = backend
            .usage_from_response(&response)
            .unwrap_or_else(|| estimated(prompt, &response_text(self.supplier, &response)));
        self.charge(usage);
        Ok(response)
    }

    /// Image generation. Only the prompt is charged.
    #[tracing::instrument(level = "debug", skip_all, fields(service = %self.service))]
    pub async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> Result<Value, LLMError> {
        let backend = self.admit()?;
        let response = backend.generate_image(prompt, options).await?;
        let usage = backend
            .usage_from_response(&response)
            .unwrap_or_else(|| estimated(prompt, ""));
        self.charge(usage);
        Ok(response)
    }

    /// Classification or raw inference; `inputs` is sent as-is.
    #[tracing::instrument(level = "debug", skip_all, fields(service = %self.service))]
    pub async fn classify(
        &self,
        inputs: &Value,
        extra: &Map<String, Value>,
    ) -> Result<Value, LLMError> {
        let backend = self.admit()?;
        let response = backend.classify(&self.model, inputs, extra).await?;
        let usage = backend.usage_from_response(&response).unwrap_or_else(|| {
            let input = match inputs {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            estimated(&input, "")
        });
        self.charge(usage);
        Ok(response)
    }

    /// Models visible to the credential. Not charged and allowed while on hold.
    pub async fn list_models(&self) -> Result<Vec<String>, LLMError> {
        self.backend()?.list_models().await
    }

    /// Streams a chat completion, handing each text delta to `handler`, and returns the
    /// full text. Usage is always estimated.
    #[tracing::instrument(level = "debug", skip_all, fields(service = %self.service))]
    pub async fn stream_chat<F>(
        &self,
        messages: &[Message],
        options: &ChatOptions,
        handler: F,
    ) -> Result<String, LLMError>
    where
        F: FnMut(&str),
    {
        let backend = self.admit()?;
        let body = backend
            .stream_chat(self.model_for(options), messages, options)
            .await?;
        let text = relay(body, self.supplier, handler).await?;

        let input: String = messages.iter().map(|m| m.content.as_str()).collect();
        self.charge(estimated(&input, &text));
        Ok(text)
    }

    fn model_for<'a>(&'a self, options: &'a ChatOptions) -> &'a str {
        options.model.as_deref().unwrap_or(&self.model)
    }

    fn backend(&self) -> Result<&DynBackend, LLMError> {
        self.backend.as_ref().ok_or_else(|| LLMError::NotInitialized {
            service: self.service.clone(),
        })
    }

    fn admit(&self) -> Result<&DynBackend, LLMError> {
        let backend = self.backend()?;
        if self.on_hold.load(Ordering::SeqCst) {
            return Err(LLMError::BudgetExhausted {
                service: self.service.clone(),
                budget: self.token_budget.load(Ordering::SeqCst),
            });
        }
        Ok(backend)
    }

    fn charge(&self, usage: TokenUsage) {
        self.tokens_in
            .fetch_add(usage.input_tokens, Ordering::SeqCst);
        self.tokens_out
            .fetch_add(usage.output_tokens, Ordering::SeqCst);

        let spent = i64::try_from(usage.total()).unwrap_or(i64::MAX);
        let previous = self
            .token_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
                Some(budget.saturating_sub(spent))
            })
            .unwrap_or_else(|budget| budget);
        let budget = previous.saturating_sub(spent);
        tracing::debug!(
            input = usage.input_tokens,
            output = usage.output_tokens,
            estimated = usage.estimated,
            budget,
            "charged tokens"
        );

        if budget <= 0 && !self.on_hold.swap(true, Ordering::SeqCst) {
            tracing::warn!(service = %self.service, budget, "token budget exhausted, handle on hold");
        }
    }
}

fn estimated(input: &str, output: &str) -> TokenUsage {
    TokenUsage {
        input_tokens: estimate_tokens(input),
        output_tokens: estimate_tokens(output),
        estimated: true,
    }
}

/// Best-effort answer text for the output estimate.
fn response_text(supplier: SupplierKind, response: &Value) -> String {
    if let Ok(text) = extract_answer(response, supplier) {
        return text;
    }
    ["choices.0.text", "completion"]
        .iter()
        .find_map(|path| lookup(response, path).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

/// Configures and binds a [`ServiceClient`].
pub struct ServiceClientBuilder {
    service: String,
    model: String,
    token_budget: i64,
    explicit_key: Option<String>,
    use_env: Option<bool>,
    supplier: Option<SupplierKind>,
    base_url: Option<String>,
    timeout: Option<Duration>,
    transport: Option<DynHttpTransport>,
    backend: Option<DynBackend>,
}

impl ServiceClientBuilder {
    pub fn token_budget(mut self, budget: i64) -> Self {
        self.token_budget = budget;
        self
    }

    /// Key used instead of the store's lookup.
    pub fn explicit_key(mut self, key: impl Into<String>) -> Self {
        self.explicit_key = Some(key.into());
        self
    }

    pub fn use_env(mut self, use_env: bool) -> Self {
        self.use_env = Some(use_env);
        self
    }

    /// Overrides the supplier inferred from the service name, for compatible servers.
    pub fn supplier(mut self, supplier: SupplierKind) -> Self {
        self.supplier = Some(supplier);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn transport(mut self, transport: DynHttpTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses a ready-made backend and skips credential resolution.
    pub fn backend(mut self, backend: DynBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Resolves the credential through `keys` and binds the backend.
    ///
    /// Never fails: when no credential or transport is available the handle is returned
    /// uninitialized and every operation on it reports [`LLMError::NotInitialized`].
    pub fn build(self, keys: &KeyStore) -> ServiceClient {
        let supplier = self
            .supplier
            .or_else(|| self.backend.as_ref().map(|backend| backend.supplier()))
            .unwrap_or_else(|| SupplierKind::for_service(&self.service));
        let backend = match self.backend.clone() {
            Some(backend) => Some(backend),
            None => self.bind(keys, supplier),
        };

        let client = ServiceClient {
            service: self.service,
            model: self.model,
            supplier,
            backend,
            token_budget: AtomicI64::new(self.token_budget),
            tokens_in: AtomicU64::new(0),
            tokens_out: AtomicU64::new(0),
            on_hold: AtomicBool::new(self.token_budget <= 0),
        };
        tracing::debug!(
            service = %client.service,
            model = %client.model,
            initialized = client.is_initialized(),
            "built service client"
        );
        client
    }

    /// Like [`ServiceClientBuilder::build`], then probes the credential by listing
    /// models. A rejected credential leaves the handle uninitialized.
    ///
    /// # Errors
    ///
    /// Transport failures of the probe ([`LLMError::ServiceUnreachable`],
    /// [`LLMError::Timeout`]).
    pub async fn build_validated(self, keys: &KeyStore) -> Result<ServiceClient, LLMError> {
        let mut client = self.build(keys);
        let Some(backend) = client.backend.clone() else {
            return Ok(client);
        };

        let validation = validate_backend(backend.as_ref()).await?;
        match validation.valid {
            Some(false) => {
                tracing::warn!(service = %client.service, "credential rejected by provider");
                client.backend = None;
            }
            Some(true) if !validation.models.iter().any(|m| m == &client.model) => {
                tracing::warn!(
                    service = %client.service,
                    model = %client.model,
                    "model not listed by provider"
                );
            }
            _ => {}
        }
        Ok(client)
    }

    fn bind(&self, keys: &KeyStore, supplier: SupplierKind) -> Option<DynBackend> {
        let options = ResolveOptions {
            explicit_key: self.explicit_key.clone(),
            use_env: self.use_env,
            default_key: None,
        };
        let resolved = match keys.resolve(&self.service, &options) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(service = %self.service, error = %err, "service left uninitialized");
                return None;
            }
        };
        tracing::debug!(service = %self.service, source = ?resolved.source, "credential resolved");

        let transport = match &self.transport {
            Some(transport) => Arc::clone(transport),
            None => match default_dyn_transport() {
                Ok(transport) => transport,
                Err(err) => {
                    tracing::warn!(service = %self.service, error = %err, "no http transport");
                    return None;
                }
            },
        };
        let settings = BackendSettings {
            base_url: self.base_url.clone(),
            timeout: self.timeout,
        };
        Some(build_backend(supplier, transport, resolved.key, &settings))
    }
}
