use std::future::Future;
use std::time::Duration;

use log::debug;

use crate::error::StructuringError;
use crate::llm::client::GeminiClient;
use crate::llm::prompts::SYSTEM_PROMPT_STATEMENT;
use crate::llm::types::Content;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::schema::StructuredStatement;
use crate::utils::truncate_diagnostic;

/// The structuring service seam: one prompt in, raw model text out.
/// Implementations map their transport failures onto `StructuringError`.
pub trait StructuringProvider: Send + Sync {
    fn structure(
        &self,
        system_prompt: &str,
        user_message: &str,
        response_schema: Option<serde_json::Value>,
    ) -> impl Future<Output = Result<String, StructuringError>> + Send;
}

impl StructuringProvider for GeminiClient {
    fn structure(
        &self,
        system_prompt: &str,
        user_message: &str,
        response_schema: Option<serde_json::Value>,
    ) -> impl Future<Output = Result<String, StructuringError>> + Send {
        let messages = vec![Content::user(user_message)];
        self.generate_content(self.model(), system_prompt, messages, response_schema)
    }
}

/// Turns OCR text into a `StructuredStatement` via the structuring provider:
/// prompt assembly, schema enforcement, retry with backoff on transient
/// failures, per-attempt timeout, and tolerant JSON cleanup of the output.
pub struct StatementExtractor<P> {
    provider: P,
    system_prompt: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<P: StructuringProvider> StatementExtractor<P> {
    pub fn new(provider: P, retry: RetryPolicy, timeout: Duration) -> Self {
        StatementExtractor {
            provider,
            system_prompt: SYSTEM_PROMPT_STATEMENT.to_string(),
            retry,
            timeout,
        }
    }

    /// Swap in a different prompt (e.g. tuned for a specific bank's layout).
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub async fn extract(
        &self,
        import_id: &str,
        ocr_text: &str,
    ) -> Result<StructuredStatement, StructuringError> {
        let schema = StructuredStatement::response_schema().map_err(|err| {
            StructuringError::Unknown(format!("response schema generation failed: {}", err))
        })?;

        let user_message = format!(
            "Extract the statement data from the following OCR output.\n\
             Remember: return ONLY the JSON object.\n\n\
             ### OCR OUTPUT\n{}",
            ocr_text
        );

        let timeout = self.timeout;
        let raw = run_with_retry(
            &self.retry,
            "structuring request",
            |err: &StructuringError| err.is_retryable(),
            |attempt| {
                debug!("structuring attempt {} for import {}", attempt, import_id);
                let call = self
                    .provider
                    .structure(&self.system_prompt, &user_message, Some(schema.clone()));
                async move {
                    match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(StructuringError::Timeout),
                    }
                }
            },
        )
        .await?;

        let cleaned = clean_json_output(&raw);
        let statement: StructuredStatement = serde_json::from_str(&cleaned).map_err(|err| {
            StructuringError::MalformedResponse(format!(
                "{} in model output: {}",
                err,
                truncate_diagnostic(&cleaned)
            ))
        })?;

        debug!(
            "structuring returned {} transaction(s) for import {}",
            statement.transactions.len(),
            import_id
        );
        Ok(statement)
    }
}

/// Trims the model's text to the outermost JSON value, dropping markdown
/// fences and prose. The statement is an object, so '{' wins over '['.
fn clean_json_output(raw: &str) -> String {
    if let Some(start) = raw.find('{') {
        if let Some(end) = raw.rfind('}') {
            if end >= start {
                return raw[start..=end].to_string();
            }
        }
    }
    if let Some(start) = raw.find('[') {
        if let Some(end) = raw.rfind(']') {
            if end >= start {
                return raw[start..=end].to_string();
            }
        }
    }
    raw.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedStructuring {
        calls: AtomicU32,
        failures_before_success: u32,
        response: String,
        last_schema: Mutex<Option<serde_json::Value>>,
    }

    impl ScriptedStructuring {
        fn returning(response: &str) -> Self {
            ScriptedStructuring {
                calls: AtomicU32::new(0),
                failures_before_success: 0,
                response: response.to_string(),
                last_schema: Mutex::new(None),
            }
        }

        fn flaky(failures: u32, response: &str) -> Self {
            ScriptedStructuring {
                failures_before_success: failures,
                ..Self::returning(response)
            }
        }
    }

    impl StructuringProvider for ScriptedStructuring {
        fn structure(
            &self,
            _system_prompt: &str,
            _user_message: &str,
            response_schema: Option<serde_json::Value>,
        ) -> impl Future<Output = Result<String, StructuringError>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_schema.lock().unwrap() = response_schema;
            let result = if call <= self.failures_before_success {
                Err(StructuringError::RateLimited)
            } else {
                Ok(self.response.clone())
            };
            async move { result }
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        }
    }

    const FENCED_RESPONSE: &str = "```json\n{\n  \"period\": { \"start_date\": \"2025-01-01\", \"end_date\": \"2025-01-31\" },\n  \"transactions\": [\n    { \"date\": \"2025-01-15\", \"description\": \"SALARY\", \"amount\": 2500.0, \"transaction_type\": \"credit\" }\n  ]\n}\n```";

    #[tokio::test]
    async fn test_extract_parses_fenced_output_and_sends_schema() {
        let provider = ScriptedStructuring::returning(FENCED_RESPONSE);
        let extractor = StatementExtractor::new(provider, fast_retry(), Duration::from_secs(1));

        let statement = extractor.extract("imp-1", "SALARY 2500.00").await.unwrap();
        assert_eq!(statement.transactions.len(), 1);
        assert_eq!(statement.period.end_date.as_deref(), Some("2025-01-31"));

        let schema = extractor.provider.last_schema.lock().unwrap();
        let schema = schema.as_ref().expect("schema should be sent");
        assert!(!schema.to_string().contains("$ref"));
    }

    #[tokio::test]
    async fn test_extract_retries_transient_failures() {
        let provider = ScriptedStructuring::flaky(2, FENCED_RESPONSE);
        let extractor = StatementExtractor::new(provider, fast_retry(), Duration::from_secs(1));

        let statement = extractor.extract("imp-1", "text").await.unwrap();
        assert_eq!(statement.transactions.len(), 1);
        assert_eq!(extractor.provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_extract_rejects_unparseable_output() {
        let provider = ScriptedStructuring::returning("I could not find any transactions, sorry!");
        let extractor = StatementExtractor::new(provider, fast_retry(), Duration::from_secs(1));

        let err = extractor.extract("imp-1", "text").await.unwrap_err();
        assert!(matches!(err, StructuringError::MalformedResponse(_)));
        // Malformed output is not retryable.
        assert_eq!(extractor.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clean_json_output() {
        assert_eq!(clean_json_output("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(
            clean_json_output("Here is the data:\n```json\n{\"a\":[1,2]}\n```"),
            "{\"a\":[1,2]}"
        );
        assert_eq!(clean_json_output("  [1,2]  "), "[1,2]");
        assert_eq!(clean_json_output("no json here"), "no json here");
    }
}
