use std::future::Future;

pub mod client;

pub use self::client::{ModelClient, ModelClientError};

/// Opaque text-in, text-out language model call.
pub trait TextGenerator {
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> impl Future<Output = Result<String, ModelClientError>> + Send;
}
