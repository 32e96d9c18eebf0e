//! External service contracts and their thin HTTP providers.
//!
//! The pipeline only ever talks to the three services through the traits
//! here, so tests and offline runs swap in in-process fakes. The blocking
//! HTTP providers map transport and status failures onto the error
//! taxonomy: network errors, 429 and 5xx are transient (retried with
//! backoff); other 4xx are permanent.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::{Credentials, RecognizeSettings};
use crate::error::{DubError, DubResult};
use crate::runner::CancellationToken;

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Asynchronous recognition: submit an audio URL, then poll for the raw
/// provider JSON.
pub trait RecognitionService: Send + Sync {
    fn submit(&self, audio_url: &str, preset: &str) -> DubResult<String>;
    fn poll(&self, job_id: &str) -> DubResult<PollOutcome>;
}

#[derive(Debug, Clone)]
pub enum PollOutcome {
    Pending,
    Complete(Value),
}

/// Single-string translation. Calls with identical inputs may produce
/// different outputs; nothing here depends on determinism.
pub trait TranslationService: Send + Sync {
    fn translate(&self, prompt: &str) -> DubResult<String>;
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    pub emotion: Option<String>,
}

/// Text-to-speech returning WAV bytes (16 kHz mono PCM).
pub trait SynthesisService: Send + Sync {
    fn synthesize(&self, request: &SynthesisRequest) -> DubResult<Vec<u8>>;
}

/// Uploads a local file so the recognition provider can fetch it.
pub trait ObjectStore: Send + Sync {
    fn upload(&self, file: &Path, key: &str) -> DubResult<String>;
}

// ---------------------------------------------------------------------------
// Retry and polling machinery
// ---------------------------------------------------------------------------

/// Run an operation with bounded exponential backoff on transient errors.
/// Permanent errors and cancellation propagate immediately.
pub fn retry_transient<T>(
    service: &str,
    max_attempts: u32,
    token: &CancellationToken,
    mut op: impl FnMut() -> DubResult<T>,
) -> DubResult<T> {
    let mut delay = Duration::from_millis(500);
    let mut attempt = 0u32;
    loop {
        token.checkpoint()?;
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts.max(1) => {
                tracing::warn!(service, attempt, error = %err, "transient failure, retrying");
                std::thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(8));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Poll a recognition job with bounded exponential backoff and a total
/// deadline. Transient poll failures count as "still pending"; permanent
/// failures abort.
pub fn poll_until_complete(
    service: &dyn RecognitionService,
    job_id: &str,
    settings: &RecognizeSettings,
    token: &CancellationToken,
) -> DubResult<Value> {
    let deadline = Instant::now() + Duration::from_millis(settings.poll_deadline_ms);
    let mut delay = Duration::from_millis(settings.poll_initial_ms.max(1));

    loop {
        token.checkpoint()?;
        match service.poll(job_id) {
            Ok(PollOutcome::Complete(value)) => return Ok(value),
            Ok(PollOutcome::Pending) => {}
            Err(err) if err.is_retryable() => {
                tracing::warn!(job_id, error = %err, "transient poll failure");
            }
            Err(err) => return Err(err),
        }

        if Instant::now() + delay >= deadline {
            return Err(DubError::PollTimeout {
                service: "recognition".to_owned(),
                deadline_ms: settings.poll_deadline_ms,
            });
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(settings.poll_max_ms.max(1)));
    }
}

// ---------------------------------------------------------------------------
// Blocking HTTP providers
// ---------------------------------------------------------------------------

fn classify_http_error(service: &str, status: u16, body: String) -> DubError {
    if status == 429 || status >= 500 {
        DubError::Transient {
            service: service.to_owned(),
            message: format!("http {status}: {body}"),
        }
    } else {
        DubError::Permanent {
            service: service.to_owned(),
            status,
            message: body,
        }
    }
}

fn transport_error(service: &str, err: &reqwest::Error) -> DubError {
    DubError::Transient {
        service: service.to_owned(),
        message: err.to_string(),
    }
}

pub struct HttpRecognitionService {
    client: reqwest::blocking::Client,
    endpoint: String,
    app_id: String,
    token: String,
}

impl HttpRecognitionService {
    pub fn new(endpoint: String, credentials: &Credentials) -> DubResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DubError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            app_id: credentials.asr_app_id.clone(),
            token: credentials.asr_token.clone(),
        })
    }
}

impl RecognitionService for HttpRecognitionService {
    fn submit(&self, audio_url: &str, preset: &str) -> DubResult<String> {
        let response = self
            .client
            .post(format!("{}/submit", self.endpoint))
            .header("X-App-Id", &self.app_id)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "audio_url": audio_url, "preset": preset }))
            .send()
            .map_err(|e| transport_error("recognition", &e))?;

        let status = response.status().as_u16();
        let body: Value = match response.json() {
            Ok(value) => value,
            Err(e) => return Err(transport_error("recognition", &e)),
        };
        if !(200..300).contains(&status) {
            return Err(classify_http_error("recognition", status, body.to_string()));
        }
        body.get("job_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| DubError::Permanent {
                service: "recognition".to_owned(),
                status,
                message: "submit response carries no job_id".to_owned(),
            })
    }

    fn poll(&self, job_id: &str) -> DubResult<PollOutcome> {
        let response = self
            .client
            .get(format!("{}/query/{job_id}", self.endpoint))
            .header("X-App-Id", &self.app_id)
            .bearer_auth(&self.token)
            .send()
            .map_err(|e| transport_error("recognition", &e))?;

        let status = response.status().as_u16();
        let body: Value = match response.json() {
            Ok(value) => value,
            Err(e) => return Err(transport_error("recognition", &e)),
        };
        if !(200..300).contains(&status) {
            return Err(classify_http_error("recognition", status, body.to_string()));
        }
        match body.get("status").and_then(Value::as_str) {
            Some("done") => Ok(PollOutcome::Complete(
                body.get("result").cloned().unwrap_or(Value::Null),
            )),
            _ => Ok(PollOutcome::Pending),
        }
    }
}

pub struct HttpTranslationService {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTranslationService {
    pub fn new(endpoint: String, credentials: &Credentials) -> DubResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DubError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key: credentials.mt_api_key.clone(),
        })
    }
}

impl TranslationService for HttpTranslationService {
    fn translate(&self, prompt: &str) -> DubResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .map_err(|e| transport_error("translation", &e))?;

        let status = response.status().as_u16();
        let body: Value = match response.json() {
            Ok(value) => value,
            Err(e) => return Err(transport_error("translation", &e)),
        };
        if !(200..300).contains(&status) {
            return Err(classify_http_error("translation", status, body.to_string()));
        }
        body.get("text")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_owned())
            .ok_or_else(|| DubError::Permanent {
                service: "translation".to_owned(),
                status,
                message: "response carries no text".to_owned(),
            })
    }
}

pub struct HttpSynthesisService {
    client: reqwest::blocking::Client,
    endpoint: String,
    app_id: String,
    token: String,
}

impl HttpSynthesisService {
    pub fn new(endpoint: String, credentials: &Credentials) -> DubResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DubError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            app_id: credentials.tts_app_id.clone(),
            token: credentials.tts_token.clone(),
        })
    }
}

impl SynthesisService for HttpSynthesisService {
    fn synthesize(&self, request: &SynthesisRequest) -> DubResult<Vec<u8>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-App-Id", &self.app_id)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "text": request.text,
                "voice_id": request.voice_id,
                "emotion": request.emotion,
            }))
            .send()
            .map_err(|e| transport_error("synthesis", &e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().unwrap_or_default();
            return Err(classify_http_error("synthesis", status, body));
        }
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| transport_error("synthesis", &e))
    }
}

pub struct HttpObjectStore {
    client: reqwest::blocking::Client,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl HttpObjectStore {
    pub fn new(endpoint: String, credentials: &Credentials) -> DubResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| DubError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            access_key: credentials.store_access_key.clone(),
            secret_key: credentials.store_secret_key.clone(),
        })
    }
}

impl ObjectStore for HttpObjectStore {
    fn upload(&self, file: &Path, key: &str) -> DubResult<String> {
        let bytes = std::fs::read(file)?;
        let url = format!("{}/{key}", self.endpoint);
        let response = self
            .client
            .put(&url)
            .header("X-Access-Key", &self.access_key)
            .header("X-Secret-Key", &self.secret_key)
            .body(bytes)
            .send()
            .map_err(|e| transport_error("object-store", &e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().unwrap_or_default();
            return Err(classify_http_error("object-store", status, body));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn http_error_classification_matches_the_taxonomy() {
        assert!(classify_http_error("x", 429, String::new()).is_retryable());
        assert!(classify_http_error("x", 503, String::new()).is_retryable());
        assert!(!classify_http_error("x", 401, String::new()).is_retryable());
        assert!(!classify_http_error("x", 404, String::new()).is_retryable());
    }

    struct FlakyOp {
        failures: AtomicUsize,
    }

    #[test]
    fn retry_transient_recovers_after_transient_failures() {
        let op = FlakyOp {
            failures: AtomicUsize::new(2),
        };
        let token = CancellationToken::new();
        let result = retry_transient("test", 5, &token, || {
            if op.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(DubError::Transient {
                    service: "test".to_owned(),
                    message: "503".to_owned(),
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retry_transient_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: DubResult<()> = retry_transient("test", 3, &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DubError::Transient {
                service: "test".to_owned(),
                message: "down".to_owned(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_transient_does_not_retry_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let token = CancellationToken::new();
        let result: DubResult<()> = retry_transient("test", 5, &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DubError::Permanent {
                service: "test".to_owned(),
                status: 400,
                message: "bad request".to_owned(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct ScriptedRecognition {
        outcomes: Mutex<Vec<DubResult<PollOutcome>>>,
    }

    impl RecognitionService for ScriptedRecognition {
        fn submit(&self, _audio_url: &str, _preset: &str) -> DubResult<String> {
            Ok("job-1".to_owned())
        }
        fn poll(&self, _job_id: &str) -> DubResult<PollOutcome> {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(PollOutcome::Pending))
        }
    }

    fn fast_settings(deadline_ms: u64) -> RecognizeSettings {
        RecognizeSettings {
            poll_initial_ms: 1,
            poll_max_ms: 2,
            poll_deadline_ms: deadline_ms,
            ..RecognizeSettings::default()
        }
    }

    #[test]
    fn polling_returns_the_completed_result() {
        // Outcomes pop from the back: pending, pending, complete.
        let service = ScriptedRecognition {
            outcomes: Mutex::new(vec![
                Ok(PollOutcome::Complete(json!({"ok": true}))),
                Ok(PollOutcome::Pending),
                Ok(PollOutcome::Pending),
            ]),
        };
        let token = CancellationToken::new();
        let result =
            poll_until_complete(&service, "job-1", &fast_settings(5_000), &token).unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[test]
    fn polling_times_out_against_the_deadline() {
        let service = ScriptedRecognition {
            outcomes: Mutex::new(Vec::new()),
        };
        let token = CancellationToken::new();
        let err = poll_until_complete(&service, "job-1", &fast_settings(10), &token).unwrap_err();
        assert!(matches!(err, DubError::PollTimeout { .. }));
    }

    #[test]
    fn polling_treats_transient_errors_as_pending() {
        let service = ScriptedRecognition {
            outcomes: Mutex::new(vec![
                Ok(PollOutcome::Complete(json!({}))),
                Err(DubError::Transient {
                    service: "recognition".to_owned(),
                    message: "502".to_owned(),
                }),
            ]),
        };
        let token = CancellationToken::new();
        poll_until_complete(&service, "job-1", &fast_settings(5_000), &token)
            .expect("transient poll error should not abort");
    }

    #[test]
    fn polling_aborts_on_permanent_errors() {
        let service = ScriptedRecognition {
            outcomes: Mutex::new(vec![Err(DubError::Permanent {
                service: "recognition".to_owned(),
                status: 404,
                message: "unknown job".to_owned(),
            })]),
        };
        let token = CancellationToken::new();
        let err =
            poll_until_complete(&service, "job-1", &fast_settings(5_000), &token).unwrap_err();
        assert!(matches!(err, DubError::Permanent { .. }));
    }

    #[test]
    fn cancellation_interrupts_polling() {
        let service = ScriptedRecognition {
            outcomes: Mutex::new(Vec::new()),
        };
        let token = CancellationToken::new();
        token.cancel("shutdown");
        let err =
            poll_until_complete(&service, "job-1", &fast_settings(60_000), &token).unwrap_err();
        assert!(matches!(err, DubError::Cancelled(_)));
    }
}
