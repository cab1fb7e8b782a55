use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{OcrError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::models::OcrCacheEntry;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::OcrCacheStore;
use crate::utils::truncate_diagnostic;

const DEFAULT_OCR_BASE_URL: &str = "https://api.mistral.ai/v1";
const DEFAULT_OCR_MODEL: &str = "mistral-ocr-latest";

/// A document submitted for text recognition.
#[derive(Debug, Clone, Copy)]
pub struct OcrRequest<'a> {
    pub bytes: &'a [u8],
    pub mime_type: &'a str,
    pub filename: &'a str,
}

/// Recognized text plus how many pages the service processed.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutcome {
    pub text: String,
    pub page_count: u32,
}

/// The OCR service seam. Implementations map their transport failures onto
/// `OcrError` so retry classification stays uniform.
pub trait OcrProvider: Send + Sync {
    fn recognize(
        &self,
        request: OcrRequest<'_>,
    ) -> impl Future<Output = std::result::Result<OcrOutcome, OcrError>> + Send;
}

/// Cache-consulting OCR client: looks up the content hash before any network
/// call, and runs provider calls under the injected retry policy with a
/// per-attempt timeout.
pub struct OcrClient<P> {
    provider: P,
    cache: Arc<dyn OcrCacheStore>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<P: OcrProvider> OcrClient<P> {
    pub fn new(
        provider: P,
        cache: Arc<dyn OcrCacheStore>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        OcrClient {
            provider,
            cache,
            retry,
            timeout,
        }
    }

    /// Returns the cache entry for this content plus whether it came from
    /// the cache. On a miss the recognized text is written back before
    /// returning, so a crash after this point never re-bills OCR.
    pub async fn fetch(
        &self,
        import_id: &str,
        content_hash: &str,
        request: OcrRequest<'_>,
        events: &EventSink,
    ) -> Result<(OcrCacheEntry, bool)> {
        if let Some(entry) = self.cache.get(content_hash)? {
            info!(
                "OCR cache hit for import {} (hash {})",
                import_id, content_hash
            );
            events
                .emit(PipelineEvent::OcrCacheHit {
                    import_id: import_id.to_string(),
                    content_hash: content_hash.to_string(),
                })
                .await;
            return Ok((entry, true));
        }

        let timeout = self.timeout;
        let outcome = run_with_retry(
            &self.retry,
            "OCR request",
            |err: &OcrError| err.is_retryable(),
            |attempt| {
                debug!("OCR attempt {} for import {}", attempt, import_id);
                let call = self.provider.recognize(request);
                async move {
                    match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(OcrError::Timeout),
                    }
                }
            },
        )
        .await?;

        info!(
            "OCR recognized {} page(s) for import {}",
            outcome.page_count, import_id
        );
        let entry = OcrCacheEntry::new(content_hash.to_string(), outcome.text, outcome.page_count);
        self.cache.put(entry.clone())?;
        Ok((entry, false))
    }
}

/// HTTP implementation speaking the document-OCR API: the file goes up as a
/// base64 data URL, the response comes back as per-page markdown.
#[derive(Clone)]
pub struct HttpOcrClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl HttpOcrClient {
    pub fn new(api_key: String) -> Self {
        HttpOcrClient {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_OCR_BASE_URL.to_string(),
            model: DEFAULT_OCR_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn call(&self, request: OcrRequest<'_>) -> std::result::Result<OcrOutcome, OcrError> {
        let url = format!("{}/ocr", self.base_url);
        let payload = OcrApiRequest {
            model: &self.model,
            document: DocumentSource {
                source_type: "document_url",
                document_url: data_url(request.mime_type, request.bytes),
            },
            include_image_base64: false,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let body: OcrApiResponse = response
            .json()
            .await
            .map_err(|err| OcrError::Unknown(format!("unreadable OCR response: {}", err)))?;

        let text = body
            .pages
            .iter()
            .map(|page| page.markdown.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(OcrOutcome {
            text,
            page_count: body.pages.len() as u32,
        })
    }
}

impl OcrProvider for HttpOcrClient {
    fn recognize(
        &self,
        request: OcrRequest<'_>,
    ) -> impl Future<Output = std::result::Result<OcrOutcome, OcrError>> + Send {
        self.call(request)
    }
}

fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

fn map_transport_error(err: reqwest::Error) -> OcrError {
    if err.is_timeout() {
        OcrError::Timeout
    } else {
        OcrError::Unknown(err.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> OcrError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => OcrError::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OcrError::Unauthorized,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => OcrError::Timeout,
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY => {
            OcrError::UnsupportedFormat(truncate_diagnostic(body))
        }
        _ => OcrError::Unknown(format!(
            "OCR API error (status {}): {}",
            status,
            truncate_diagnostic(body)
        )),
    }
}

#[derive(Serialize)]
struct OcrApiRequest<'a> {
    model: &'a str,
    document: DocumentSource,
    include_image_base64: bool,
}

#[derive(Serialize)]
struct DocumentSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    document_url: String,
}

#[derive(Deserialize)]
struct OcrApiResponse {
    pages: Vec<OcrPage>,
}

#[derive(Deserialize)]
struct OcrPage {
    markdown: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        calls: AtomicU32,
        failures_before_success: u32,
    }

    impl ScriptedProvider {
        fn reliable() -> Self {
            ScriptedProvider {
                calls: AtomicU32::new(0),
                failures_before_success: 0,
            }
        }

        fn flaky(failures: u32) -> Self {
            ScriptedProvider {
                calls: AtomicU32::new(0),
                failures_before_success: failures,
            }
        }
    }

    impl OcrProvider for ScriptedProvider {
        fn recognize(
            &self,
            _request: OcrRequest<'_>,
        ) -> impl Future<Output = std::result::Result<OcrOutcome, OcrError>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = call <= self.failures_before_success;
            async move {
                if fail {
                    Err(OcrError::RateLimited)
                } else {
                    Ok(OcrOutcome {
                        text: "# Statement\nSALARY 2,500.00".to_string(),
                        page_count: 2,
                    })
                }
            }
        }
    }

    struct SlowProvider;

    impl OcrProvider for SlowProvider {
        fn recognize(
            &self,
            _request: OcrRequest<'_>,
        ) -> impl Future<Output = std::result::Result<OcrOutcome, OcrError>> + Send {
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(OcrOutcome {
                    text: "late".to_string(),
                    page_count: 1,
                })
            }
        }
    }

    fn request<'a>() -> OcrRequest<'a> {
        OcrRequest {
            bytes: b"pdf bytes",
            mime_type: "application/pdf",
            filename: "jan.pdf",
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

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let store = Arc::new(MemoryStore::new());
        let provider = ScriptedProvider::reliable();
        let client = OcrClient::new(
            provider,
            store.clone(),
            fast_retry(),
            Duration::from_secs(1),
        );
        let events = EventSink::disabled();

        let (first, cached) = client
            .fetch("imp-1", "hash-1", request(), &events)
            .await
            .unwrap();
        assert!(!cached);
        assert_eq!(first.page_count, 2);

        let (second, cached) = client
            .fetch("imp-2", "hash-1", request(), &events)
            .await
            .unwrap();
        assert!(cached);
        assert_eq!(second.text, first.text);
        assert_eq!(client.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let client = OcrClient::new(
            ScriptedProvider::flaky(2),
            store,
            fast_retry(),
            Duration::from_secs(1),
        );
        let events = EventSink::disabled();

        let (entry, cached) = client
            .fetch("imp-1", "hash-1", request(), &events)
            .await
            .unwrap();
        assert!(!cached);
        assert_eq!(entry.page_count, 2);
        assert_eq!(client.provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let store = Arc::new(MemoryStore::new());
        let client = OcrClient::new(
            SlowProvider,
            store,
            RetryPolicy::none(),
            Duration::from_millis(5),
        );
        let events = EventSink::disabled();

        let err = client
            .fetch("imp-1", "hash-1", request(), &events)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ImportError::Ocr(OcrError::Timeout)
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            OcrError::RateLimited
        );
        assert_eq!(
            map_status(StatusCode::UNAUTHORIZED, ""),
            OcrError::Unauthorized
        );
        assert_eq!(map_status(StatusCode::FORBIDDEN, ""), OcrError::Unauthorized);
        assert!(matches!(
            map_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "no pdf"),
            OcrError::UnsupportedFormat(_)
        ));
        assert!(matches!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            OcrError::Unknown(ref msg) if msg.contains("500")
        ));
    }

    #[test]
    fn test_data_url_shape() {
        let url = data_url("application/pdf", b"abc");
        assert!(url.starts_with("data:application/pdf;base64,"));
    }
}
