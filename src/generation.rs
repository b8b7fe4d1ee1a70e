//! Structured generation: one prompt in, one schema-validated value out.
//!
//! The split mirrors how the stages use it:
//! - [`GenerationService`] is the pluggable transport. It performs exactly one request and
//!   hands back whatever JSON the service produced.
//! - [`StructuredClient`] owns the contract. It refuses to call out without a credential,
//!   validates the payload against the closed [`Schema`], and only then decodes it.
//!
//! Neither layer retries. Retry policy lives in the pipeline.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, GenerationFailure, Result};
use crate::schema::Schema;

/// A single prompt sent to a generation service.
#[derive(Debug, Clone, Copy)]
pub struct Prompt<'a> {
    pub system_instruction: &'a str,
    pub user_prompt: &'a str,
    pub schema: &'a Schema,
}

/// Pluggable generative-text backend used by [`StructuredClient`].
///
/// Implementations must issue at most one request per call and must not retry. A returned
/// `Ok` value is still untrusted: the client validates it.
pub trait GenerationService: Send + Sync {
    fn request(
        &self,
        credential: &str,
        prompt: Prompt<'_>,
    ) -> std::result::Result<Value, GenerationFailure>;
}

impl<S: GenerationService + ?Sized> GenerationService for std::sync::Arc<S> {
    fn request(
        &self,
        credential: &str,
        prompt: Prompt<'_>,
    ) -> std::result::Result<Value, GenerationFailure> {
        (**self).request(credential, prompt)
    }
}

impl<S: GenerationService + ?Sized> GenerationService for Box<S> {
    fn request(
        &self,
        credential: &str,
        prompt: Prompt<'_>,
    ) -> std::result::Result<Value, GenerationFailure> {
        (**self).request(credential, prompt)
    }
}

/// Shape-agnostic structured generation client, reused by both stages.
#[derive(Debug, Clone)]
pub struct StructuredClient<S> {
    service: S,
}

impl<S: GenerationService> StructuredClient<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// Submit a prompt and decode the schema-validated reply into `T`.
    ///
    /// Fails with [`Error::MissingCredential`] before touching the service when `credential`
    /// is blank.
    pub fn invoke<T: DeserializeOwned>(
        &self,
        credential: &str,
        system_instruction: &str,
        user_prompt: &str,
        schema: &Schema,
    ) -> Result<T> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(Error::MissingCredential);
        }

        debug!(
            system_len = system_instruction.len(),
            prompt_len = user_prompt.len(),
            "requesting structured generation"
        );

        let prompt = Prompt {
            system_instruction,
            user_prompt,
            schema,
        };
        let value = self
            .service
            .request(credential, prompt)
            .inspect_err(|err| warn!(error = %err, "generation request failed"))?;

        decode(schema, value).map_err(|err| {
            warn!(error = %err, "generation payload rejected");
            Error::Generation(err)
        })
    }

    pub fn service(&self) -> &S {
        &self.service
    }
}

/// Validate `value` against `schema`, then decode it.
pub fn decode<T: DeserializeOwned>(
    schema: &Schema,
    value: Value,
) -> std::result::Result<T, GenerationFailure> {
    schema.validate(&value)?;
    serde_json::from_value(value).map_err(GenerationFailure::Decode)
}

/// Parse the raw text payload returned by a service into JSON.
///
/// Empty or whitespace-only text counts as "no usable payload".
pub fn parse_payload(text: &str) -> std::result::Result<Value, GenerationFailure> {
    let text = text.trim();
    if text.is_empty() {
        return Err(GenerationFailure::EmptyPayload);
    }
    serde_json::from_str(text).map_err(GenerationFailure::Malformed)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    struct Canned {
        reply: Mutex<Option<std::result::Result<Value, GenerationFailure>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(reply: std::result::Result<Value, GenerationFailure>) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl GenerationService for Canned {
        fn request(
            &self,
            credential: &str,
            _prompt: Prompt<'_>,
        ) -> std::result::Result<Value, GenerationFailure> {
            self.seen.lock().unwrap().push(credential.to_string());
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(GenerationFailure::EmptyPayload))
        }
    }

    #[derive(Debug, Deserialize)]
    struct Greeting {
        text: String,
    }

    fn greeting_schema() -> Schema {
        Schema::object([("text", Schema::string())])
    }

    #[test]
    fn blank_credential_never_reaches_the_service() {
        let client = StructuredClient::new(Canned::new(Ok(json!({ "text": "hi" }))));
        let res: Result<Greeting> = client.invoke("  ", "sys", "user", &greeting_schema());
        assert!(matches!(res, Err(Error::MissingCredential)));
        assert_eq!(client.service().calls(), 0);
    }

    #[test]
    fn decodes_valid_payload() -> anyhow::Result<()> {
        let client = StructuredClient::new(Canned::new(Ok(json!({ "text": "hi" }))));
        let greeting: Greeting = client.invoke(" key ", "sys", "user", &greeting_schema())?;
        assert_eq!(greeting.text, "hi");
        assert_eq!(*client.service().seen.lock().unwrap(), vec!["key"]);
        Ok(())
    }

    #[test]
    fn schema_mismatch_is_a_generation_failure() {
        let client = StructuredClient::new(Canned::new(Ok(json!({ "txt": "hi" }))));
        let res: Result<Greeting> = client.invoke("key", "sys", "user", &greeting_schema());
        assert!(matches!(
            res,
            Err(Error::Generation(GenerationFailure::Schema(_)))
        ));
        assert_eq!(client.service().calls(), 1);
    }

    #[test]
    fn parse_payload_distinguishes_empty_and_malformed() {
        assert!(matches!(
            parse_payload("  \n"),
            Err(GenerationFailure::EmptyPayload)
        ));
        assert!(matches!(
            parse_payload("{not json"),
            Err(GenerationFailure::Malformed(_))
        ));
        assert!(parse_payload(r#"{"a":1}"#).is_ok());
    }
}
