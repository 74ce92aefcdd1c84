//! Conversation history bound to a service handle.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::client::ServiceClient;
use crate::error::LLMError;
use crate::extract::extract_answer;
use crate::types::{ChatOptions, Message, Role};

/// `max_tokens` sent by [`ConversationStore::ask`] when the caller sets none.
pub const DEFAULT_ASK_MAX_TOKENS: u32 = 150;
/// `max_tokens` sent by [`ConversationStore::stream_ask`] when the caller sets none.
pub const DEFAULT_STREAM_MAX_TOKENS: u32 = 1000;

/// On-disk shape of a saved conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationFile {
    service: String,
    model: String,
    messages: Vec<Message>,
}

/// Service and model recorded in a loaded conversation file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredService {
    pub service: String,
    pub model: String,
}

/// Ordered message log that sends its whole history on every turn.
#[derive(Debug)]
pub struct ConversationStore {
    client: ServiceClient,
    history: Vec<Message>,
    stored: Option<StoredService>,
}

impl ConversationStore {
    /// Starts a conversation, optionally seeded with a system message.
    pub fn new(client: ServiceClient, system_message: Option<&str>) -> Self {
        let history = system_message
            .map(|text| vec![Message::system(text)])
            .unwrap_or_default();
        Self {
            client,
            history,
            stored: None,
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Appends a message without contacting the service.
    pub fn append(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Sends `text` capped at [`DEFAULT_ASK_MAX_TOKENS`]. See [`ConversationStore::ask_with`].
    pub async fn ask(&mut self, text: &str) -> Result<String, LLMError> {
        self.ask_with(text, &ChatOptions::default()).await
    }

    /// Starts over from the leading system message, then asks `text`.
    pub async fn ask_fresh(&mut self, text: &str) -> Result<String, LLMError> {
        self.clear_history(true);
        self.ask(text).await
    }

    /// Appends `text` as a user turn, sends the full history and records the answer.
    ///
    /// `options.max_tokens` falls back to [`DEFAULT_ASK_MAX_TOKENS`]. On failure the user
    /// turn stays in the history and no assistant turn is added.
    pub async fn ask_with(&mut self, text: &str, options: &ChatOptions) -> Result<String, LLMError> {
        let options = with_default_max_tokens(options, DEFAULT_ASK_MAX_TOKENS);
        self.history.push(Message::user(text));
        let response = self.client.chat_complete(&self.history, &options).await?;
        let answer = extract_answer(&response, self.client.supplier())?;
        self.history.push(Message::assistant(answer.clone()));
        Ok(answer)
    }

    /// Streaming variant of [`ConversationStore::ask`]; `handler` sees each delta.
    ///
    /// Capped at [`DEFAULT_STREAM_MAX_TOKENS`].
    pub async fn stream_ask<F>(&mut self, text: &str, handler: F) -> Result<String, LLMError>
    where
        F: FnMut(&str),
    {
        self.stream_ask_with(text, &ChatOptions::default(), handler)
            .await
    }

    /// Streaming variant of [`ConversationStore::ask_with`]. `options.max_tokens` falls
    /// back to [`DEFAULT_STREAM_MAX_TOKENS`].
    pub async fn stream_ask_with<F>(
        &mut self,
        text: &str,
        options: &ChatOptions,
        handler: F,
    ) -> Result<String, LLMError>
    where
        F: FnMut(&str),
    {
        let options = with_default_max_tokens(options, DEFAULT_STREAM_MAX_TOKENS);
        self.history.push(Message::user(text));
        let answer = self
            .client
            .stream_chat(&self.history, &options, handler)
            .await?;
        self.history.push(Message::assistant(answer.clone()));
        Ok(answer)
    }

    /// Empties the history. With `keep_system`, a system message at the head of the
    /// history survives; system messages appended later do not.
    pub fn clear_history(&mut self, keep_system: bool) {
        let keep = usize::from(
            keep_system
                && self
                    .history
                    .first()
                    .is_some_and(|message| message.role == Role::System),
        );
        self.history.truncate(keep);
    }

    /// Collapses the history into a single `summary` message.
    ///
    /// # Errors
    ///
    /// [`LLMError::Validation`] for [`Role::Assistant`]: a conversation cannot open with
    /// an assistant turn.
    pub fn replace_history(&mut self, summary: &str, role: Role) -> Result<(), LLMError> {
        if role == Role::Assistant {
            return Err(LLMError::Validation {
                message: "summary must be a system or user message".to_string(),
            });
        }
        self.history = vec![Message::new(role, summary)];
        Ok(())
    }

    /// Continues the conversation on another handle and returns the previous one.
    pub fn replace_service(&mut self, client: ServiceClient) -> ServiceClient {
        tracing::info!(
            from = %self.client.service(),
            to = %client.service(),
            "switching conversation service"
        );
        std::mem::replace(&mut self.client, client)
    }

    /// Service and model recorded in the file this conversation was loaded from.
    pub fn stored_service(&self) -> Option<&StoredService> {
        self.stored.as_ref()
    }

    /// Writes `{service, model, messages}` as pretty JSON, creating parent directories.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), LLMError> {
        let path = path.as_ref();
        let file = ConversationFile {
            service: self.client.service().to_string(),
            model: self.client.model().to_string(),
            messages: self.history.clone(),
        };
        let text = serde_json::to_string_pretty(&file)
            .map_err(|err| LLMError::corrupt(path.display().to_string(), err.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| LLMError::io(parent, err))?;
        }
        fs::write(path, text).map_err(|err| LLMError::io(path, err))?;
        tracing::debug!(messages = self.history.len(), "saved conversation");
        Ok(())
    }

    /// Restores a saved history and binds it to `client`.
    ///
    /// # Errors
    ///
    /// [`LLMError::Io`] when the file cannot be read and [`LLMError::CorruptState`]
    /// when it does not hold a conversation.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, client: ServiceClient) -> Result<Self, LLMError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| LLMError::io(path, err))?;
        let file: ConversationFile = serde_json::from_str(&text)
            .map_err(|err| LLMError::corrupt(path.display().to_string(), err.to_string()))?;

        if file.service != client.service() || file.model != client.model() {
            tracing::debug!(
                stored_service = %file.service,
                stored_model = %file.model,
                "conversation was saved from another service"
            );
        }
        Ok(Self {
            client,
            history: file.messages,
            stored: Some(StoredService {
                service: file.service,
                model: file.model,
            }),
        })
    }
}

fn with_default_max_tokens(options: &ChatOptions, max_tokens: u32) -> ChatOptions {
    let mut options = options.clone();
    options.max_tokens.get_or_insert(max_tokens);
    options
}
