//! OpenAI-compatible Batch API transport.
//!
//! Submission is two calls: upload the chunk as a JSONL file with purpose
//! `batch`, then create a batch over that file against
//! `/v1/chat/completions` with a 24h completion window. Status comes from
//! `GET /batches/{id}`; the result blob is `GET /files/{output_file_id}/content`.
//!
//! Every call goes through the same retry loop: 429 and 5xx back off
//! exponentially (at least as long as `retry-after`) and count against the
//! circuit breaker, 401/403 trip it at once, other 4xx fail without retry.
//! Creating a batch is not idempotent, so a timed-out or 5xx create is
//! reported to the caller instead of being sent again.

use super::circuit_breaker::CircuitBreaker;
use super::{map_provider_status, BatchTransport, ProviderStatus, TransportError};
use crate::config::PipelineConfig;
use cbspeech_core::chunker::ChunkRequest;
use cbspeech_core::domain::SubmissionId;
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";

/// Connection and model settings for [`OpenAiBatchTransport`].
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl OpenAiSettings {
    /// Build settings from the pipeline config, reading the key from the configured env var.
    pub fn from_config(cfg: &PipelineConfig) -> Result<Self, TransportError> {
        let api_key = std::env::var(&cfg.transport.api_key_env).map_err(|_| {
            TransportError::Authentication(format!(
                "environment variable {} is not set",
                cfg.transport.api_key_env
            ))
        })?;
        Ok(Self {
            base_url: cfg.transport.base_url.clone(),
            api_key,
            model: cfg.model.name.clone(),
            temperature: cfg.model.temperature,
            timeout: Duration::from_secs(cfg.transport.timeout_secs),
            max_retries: cfg.transport.max_retries,
        })
    }
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct BatchInputLine<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'static str,
    body: ChatBody<'a>,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    temperature: f64,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Serialize)]
struct CreateBatch<'a> {
    input_file_id: &'a str,
    endpoint: &'static str,
    completion_window: &'static str,
    metadata: BatchMetadata,
}

#[derive(Serialize)]
struct BatchMetadata {
    chunk_index: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
}

/// Encode a chunk as Batch API input: one chat-completions request per line,
/// `custom_id` set to the speech id.
pub fn encode_batch_input(
    chunk: &ChunkRequest,
    model: &str,
    temperature: f64,
) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::new();
    for item in &chunk.items {
        let line = BatchInputLine {
            custom_id: &item.speech_id,
            method: "POST",
            url: CHAT_COMPLETIONS,
            body: ChatBody {
                model,
                temperature,
                messages: [
                    ChatMessage {
                        role: "system",
                        content: &item.prompt.system,
                    },
                    ChatMessage {
                        role: "user",
                        content: &item.prompt.user,
                    },
                ],
                response_format: ResponseFormat {
                    kind: "json_object",
                },
            },
        };
        serde_json::to_writer(&mut out, &line)
            .map_err(|e| TransportError::Response(format!("encode request line: {e}")))?;
        out.push(b'\n');
    }
    Ok(out)
}

// ── Transport ────────────────────────────────────────────────────────

/// Whether a call may be sent again after its outcome is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Reads and file uploads.
    Safe,
    /// Batch creation: a second send can start a second batch.
    Never,
}

pub struct OpenAiBatchTransport {
    client: Client,
    base_url: String,
    model: String,
    temperature: f64,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl OpenAiBatchTransport {
    pub fn new(
        settings: OpenAiSettings,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, TransportError> {
        if settings.api_key.trim().is_empty() {
            return Err(TransportError::Authentication("empty API key".into()));
        }
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", settings.api_key.trim()))
            .map_err(|_| TransportError::Authentication("API key is not a valid header".into()))?;
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model,
            temperature: settings.temperature,
            circuit_breaker,
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(500),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.saturating_sub(1).min(5))
    }

    /// Delay before `attempt`: exponential backoff, stretched to the
    /// provider's `retry-after` when that is longer.
    fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.retry_backoff(attempt);
        retry_after.map_or(backoff, |wait| backoff.max(wait))
    }

    /// Send a request with retry, backoff and circuit-breaker bookkeeping.
    ///
    /// `build` is called once per attempt because multipart bodies are consumed on send.
    /// [`Replay::Never`] calls are only repeated after a 429 or a refused
    /// connection; a timeout or 5xx leaves their outcome unknown and is returned as is.
    fn send_with_retry<F>(
        &self,
        what: &str,
        replay: Replay,
        build: F,
    ) -> Result<Response, TransportError>
    where
        F: Fn() -> Result<RequestBuilder, TransportError>,
    {
        let mut last_error = None;
        let mut retry_after = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry_delay(attempt, retry_after.take());
                tracing::debug!(what, attempt, ?delay, "retrying batch API call");
                std::thread::sleep(delay);
            }
            if !self.circuit_breaker.is_allowed() {
                return Err(TransportError::CircuitBreakerTripped);
            }

            match build()?.send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.circuit_breaker.record_success();
                        return Ok(resp);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        self.circuit_breaker.trip();
                        return Err(TransportError::Authentication(format!(
                            "HTTP {status} on {what}"
                        )));
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        self.circuit_breaker.record_failure();
                        let header_secs = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.trim().parse::<u64>().ok());
                        tracing::warn!(
                            what,
                            retry_after = ?header_secs,
                            "rate limited by batch API"
                        );
                        retry_after = header_secs.map(Duration::from_secs);
                        last_error = Some(TransportError::RateLimited {
                            retry_after_secs: header_secs.unwrap_or(60),
                        });
                        continue;
                    }
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if status.is_server_error() {
                        self.circuit_breaker.record_failure();
                        tracing::warn!(what, %status, "batch API server error");
                        let err = TransportError::Rejected {
                            status: status.as_u16(),
                            message: body,
                        };
                        if replay == Replay::Never {
                            return Err(err);
                        }
                        last_error = Some(err);
                        continue;
                    }
                    return Err(TransportError::Rejected {
                        status: status.as_u16(),
                        message: body,
                    });
                }
                Err(e) if e.is_connect() => {
                    tracing::warn!(what, error = %e, "batch API unreachable");
                    last_error = Some(TransportError::Network(e.to_string()));
                }
                Err(e) if replay == Replay::Safe && (e.is_timeout() || e.is_request()) => {
                    tracing::warn!(what, error = %e, "batch API call interrupted");
                    last_error = Some(TransportError::Network(e.to_string()));
                }
                Err(e) => return Err(TransportError::Network(e.to_string())),
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Network("max retries exceeded".into())))
    }

    fn upload_input(&self, chunk: &ChunkRequest) -> Result<String, TransportError> {
        let payload = encode_batch_input(chunk, &self.model, self.temperature)?;
        let file_name = format!("chunk_{:04}.jsonl", chunk.chunk_index);
        let url = self.url("/files");

        let resp = self.send_with_retry("upload", Replay::Safe, || {
            let part = multipart::Part::bytes(payload.clone())
                .file_name(file_name.clone())
                .mime_str("application/jsonl")
                .map_err(|e| TransportError::Response(format!("mime: {e}")))?;
            let form = multipart::Form::new()
                .text("purpose", "batch")
                .part("file", part);
            Ok(self.client.post(&url).multipart(form))
        })?;

        let file: FileObject = resp
            .json()
            .map_err(|e| TransportError::Response(format!("file upload response: {e}")))?;
        Ok(file.id)
    }

    fn fetch_batch(&self, id: &SubmissionId) -> Result<BatchObject, TransportError> {
        let url = self.url(&format!("/batches/{}", id.as_str()));
        let resp = self
            .send_with_retry("status", Replay::Safe, || Ok(self.client.get(&url)))
            .map_err(|e| match e {
                TransportError::Rejected { status: 404, .. } => {
                    TransportError::UnknownSubmission(id.to_string())
                }
                other => other,
            })?;
        resp.json()
            .map_err(|e| TransportError::Response(format!("batch status response: {e}")))
    }
}

impl BatchTransport for OpenAiBatchTransport {
    fn name(&self) -> &str {
        "openai"
    }

    fn submit(&self, chunk: &ChunkRequest) -> Result<SubmissionId, TransportError> {
        let input_file_id = self.upload_input(chunk)?;
        let url = self.url("/batches");
        let body = CreateBatch {
            input_file_id: &input_file_id,
            endpoint: CHAT_COMPLETIONS,
            completion_window: COMPLETION_WINDOW,
            metadata: BatchMetadata {
                chunk_index: chunk.chunk_index.to_string(),
            },
        };

        let resp = self.send_with_retry("create batch", Replay::Never, || {
            Ok(self.client.post(&url).json(&body))
        })?;
        let batch: BatchObject = resp
            .json()
            .map_err(|e| TransportError::Response(format!("create batch response: {e}")))?;

        tracing::info!(
            chunk = chunk.chunk_index,
            batch_id = %batch.id,
            input_file_id = %input_file_id,
            requests = chunk.len(),
            "batch created"
        );
        Ok(SubmissionId::new(batch.id))
    }

    fn get_status(&self, id: &SubmissionId) -> Result<ProviderStatus, TransportError> {
        let batch = self.fetch_batch(id)?;
        Ok(ProviderStatus {
            status: map_provider_status(&batch.status),
            raw: batch.status,
            output_ref: batch.output_file_id,
        })
    }

    fn download_result(
        &self,
        id: &SubmissionId,
        output_ref: Option<&str>,
    ) -> Result<Vec<u8>, TransportError> {
        let file_id = match output_ref {
            Some(r) => r.to_string(),
            None => self
                .fetch_batch(id)?
                .output_file_id
                .ok_or_else(|| TransportError::ResultUnavailable(id.to_string()))?,
        };
        let url = self.url(&format!("/files/{file_id}/content"));
        let resp = self
            .send_with_retry("download", Replay::Safe, || Ok(self.client.get(&url)))
            .map_err(|e| match e {
                TransportError::Rejected { status: 404, .. } => {
                    TransportError::ResultUnavailable(id.to_string())
                }
                other => other,
            })?;
        let bytes = resp
            .bytes()
            .map_err(|e| TransportError::Network(format!("download body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbspeech_core::chunker::ChunkItem;
    use cbspeech_core::lifecycle::ChunkStatus;
    use cbspeech_core::prompt::PromptPayload;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    /// Canned reply from the local batch service: status, JSON body, stall before answering.
    type Reply = (u16, String, Duration);

    /// Serve HTTP/1.1 on a loopback port. `route` sees the method, the path
    /// and how many requests that route has already received.
    fn serve<R>(route: R) -> (String, Arc<Mutex<Vec<String>>>)
    where
        R: Fn(&str, &str, usize) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let route = Arc::new(route);
        let log = Arc::clone(&seen);
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let route = Arc::clone(&route);
                let log = Arc::clone(&log);
                std::thread::spawn(move || handle(stream, &*route, &log));
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn handle<R>(stream: TcpStream, route: &R, log: &Mutex<Vec<String>>)
    where
        R: Fn(&str, &str, usize) -> Reply,
    {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            return;
        }
        let mut content_length = 0usize;
        let mut chunked = false;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            let lower = header.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("content-length:") {
                content_length = v.trim().parse().unwrap_or(0);
            }
            if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
                chunked = true;
            }
        }
        if chunked {
            loop {
                let mut size_line = String::new();
                reader.read_line(&mut size_line).unwrap();
                let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
                let mut data = vec![0u8; size + 2];
                reader.read_exact(&mut data).unwrap();
                if size == 0 {
                    break;
                }
            }
        } else {
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();
        let key = format!("{method} {path}");
        let seen_before = {
            let mut log = log.lock().unwrap();
            let n = log.iter().filter(|k| **k == key).count();
            log.push(key);
            n
        };

        let (status, body, stall) = route(&method, &path, seen_before);
        std::thread::sleep(stall);
        let response = format!(
            "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let mut stream = stream;
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.flush();
    }

    fn calls(seen: &Mutex<Vec<String>>, key: &str) -> usize {
        seen.lock().unwrap().iter().filter(|k| *k == key).count()
    }

    fn transport_at(base_url: &str, timeout: Duration, max_retries: u32) -> OpenAiBatchTransport {
        let settings = OpenAiSettings {
            base_url: base_url.into(),
            api_key: "sk-test".into(),
            model: "m".into(),
            temperature: 0.0,
            timeout,
            max_retries,
        };
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(60), 10));
        let mut t = OpenAiBatchTransport::new(settings, breaker).unwrap();
        t.base_delay = Duration::from_millis(10);
        t
    }

    fn ok(body: &str) -> Reply {
        (200, body.to_string(), Duration::ZERO)
    }

    fn chunk() -> ChunkRequest {
        ChunkRequest {
            chunk_index: 7,
            items: vec![
                ChunkItem {
                    speech_id: "fed-001".into(),
                    estimated_tokens: 10,
                    prompt: PromptPayload {
                        system: "sys".into(),
                        user: "hello".into(),
                    },
                },
                ChunkItem {
                    speech_id: "ecb-002".into(),
                    estimated_tokens: 12,
                    prompt: PromptPayload {
                        system: "sys".into(),
                        user: "bonjour".into(),
                    },
                },
            ],
        }
    }

    #[test]
    fn input_lines_carry_custom_id_and_messages() {
        let bytes = encode_batch_input(&chunk(), "gpt-4o-mini", 0.0).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["custom_id"], "fed-001");
        assert_eq!(lines[0]["url"], "/v1/chat/completions");
        assert_eq!(lines[0]["body"]["model"], "gpt-4o-mini");
        assert_eq!(lines[0]["body"]["messages"][0]["role"], "system");
        assert_eq!(lines[1]["body"]["messages"][1]["content"], "bonjour");
        assert_eq!(lines[1]["body"]["response_format"]["type"], "json_object");
    }

    #[test]
    fn empty_key_rejected() {
        let settings = OpenAiSettings {
            base_url: "http://localhost".into(),
            api_key: "  ".into(),
            model: "m".into(),
            temperature: 0.0,
            timeout: Duration::from_secs(1),
            max_retries: 0,
        };
        let err = OpenAiBatchTransport::new(settings, Arc::new(CircuitBreaker::default_provider()))
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Authentication(_)));
    }

    #[test]
    fn tripped_breaker_fails_fast() {
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(60), 1));
        breaker.trip();
        let settings = OpenAiSettings {
            base_url: "http://127.0.0.1:9".into(),
            api_key: "sk-test".into(),
            model: "m".into(),
            temperature: 0.0,
            timeout: Duration::from_secs(1),
            max_retries: 0,
        };
        let t = OpenAiBatchTransport::new(settings, breaker).unwrap();
        let err = t.get_status(&SubmissionId::new("batch_1")).unwrap_err();
        assert!(matches!(err, TransportError::CircuitBreakerTripped));
    }

    #[test]
    fn timed_out_create_is_not_sent_twice() {
        let (url, seen) = serve(|method, path, n| match (method, path) {
            ("POST", "/files") => ok(r#"{"id":"file-1"}"#),
            ("POST", "/batches") if n == 0 => (
                200,
                r#"{"id":"batch_1","status":"validating"}"#.into(),
                Duration::from_millis(1500),
            ),
            ("POST", "/batches") => ok(r#"{"id":"batch_2","status":"validating"}"#),
            _ => (404, "{}".into(), Duration::ZERO),
        });
        let t = transport_at(&url, Duration::from_millis(400), 3);

        let err = t.submit(&chunk()).unwrap_err();
        assert!(matches!(err, TransportError::Network(_)), "{err:?}");
        assert_eq!(calls(&seen, "POST /batches"), 1);
        assert_eq!(calls(&seen, "POST /files"), 1);
    }

    #[test]
    fn server_error_on_create_is_returned_without_retry() {
        let (url, seen) = serve(|method, path, _| match (method, path) {
            ("POST", "/files") => ok(r#"{"id":"file-1"}"#),
            ("POST", "/batches") => (502, r#"{"error":"bad gateway"}"#.into(), Duration::ZERO),
            _ => (404, "{}".into(), Duration::ZERO),
        });
        let t = transport_at(&url, Duration::from_secs(5), 3);

        let err = t.submit(&chunk()).unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 502, .. }), "{err:?}");
        assert_eq!(calls(&seen, "POST /batches"), 1);
    }

    #[test]
    fn status_reads_are_retried_after_server_error() {
        let (url, seen) = serve(|method, path, n| match (method, path) {
            ("GET", "/batches/batch_9") if n == 0 => {
                (503, r#"{"error":"busy"}"#.into(), Duration::ZERO)
            }
            ("GET", "/batches/batch_9") => ok(
                r#"{"id":"batch_9","status":"completed","output_file_id":"file-out"}"#,
            ),
            _ => (404, "{}".into(), Duration::ZERO),
        });
        let t = transport_at(&url, Duration::from_secs(5), 2);

        let status = t.get_status(&SubmissionId::new("batch_9")).unwrap();
        assert_eq!(status.status, ChunkStatus::Completed);
        assert_eq!(status.output_ref.as_deref(), Some("file-out"));
        assert_eq!(calls(&seen, "GET /batches/batch_9"), 2);
    }

    #[test]
    fn successful_submit_uploads_then_creates() {
        let (url, seen) = serve(|method, path, _| match (method, path) {
            ("POST", "/files") => ok(r#"{"id":"file-1"}"#),
            ("POST", "/batches") => ok(r#"{"id":"batch_1","status":"validating"}"#),
            _ => (404, "{}".into(), Duration::ZERO),
        });
        let t = transport_at(&url, Duration::from_secs(5), 1);

        let id = t.submit(&chunk()).unwrap();
        assert_eq!(id.as_str(), "batch_1");
        assert_eq!(calls(&seen, "POST /files"), 1);
        assert_eq!(calls(&seen, "POST /batches"), 1);
    }

    #[test]
    fn retry_delay_honours_retry_after() {
        let t = transport_at("http://127.0.0.1:9", Duration::from_secs(1), 3);
        // base delay 10 ms: attempts 1, 2, 3 back off 10, 20, 40 ms
        assert_eq!(t.retry_delay(1, None), Duration::from_millis(10));
        assert_eq!(t.retry_delay(3, None), Duration::from_millis(40));
        assert_eq!(t.retry_delay(1, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(
            t.retry_delay(3, Some(Duration::from_millis(15))),
            Duration::from_millis(40)
        );
    }
}
