//! LLM provider implementations for termagent.
//!
//! All providers implement the `termagent_core::Provider` trait.
//! The router selects the provider a configuration snapshot names.

pub mod openai_compat;
pub mod retry;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use retry::RetryPolicy;
pub use router::ProviderRouter;
