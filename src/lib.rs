//! One handle over several hosted AI APIs: credential discovery, token budgets,
//! conversation history and streamed replies.
//!
//! ```no_run
//! use kagi_llm::{ConversationStore, KeyStore, ServiceClient};
//!
//! # async fn demo() -> Result<(), kagi_llm::LLMError> {
//! let keys = KeyStore::load("api_keys.json", true)?;
//! let client = ServiceClient::builder("openai", "gpt-4o-mini").build(&keys);
//! let mut conversation = ConversationStore::new(client, Some("You are concise."));
//! let answer = conversation.ask("Name one prime number.").await?;
//! println!("{answer}");
//! # Ok(()) }
//! ```

pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod extract;
pub mod http;
pub mod keys;
pub mod provider;
pub mod retry;
pub mod stream;
pub mod types;

pub use client::{ServiceClient, ServiceClientBuilder};
pub use config::ServiceConfig;
pub use conversation::ConversationStore;
pub use error::LLMError;
pub use keys::{KeySource, KeyStore, ResolveOptions, SaveMode};
pub use provider::ServiceBackend;
pub use retry::RetryPolicy;
pub use types::*;
