use crate::config::GenerationConfig;
use crate::error::GenerationError;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Answer generation from a question and retrieved context.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, question: &str, context: &str) -> Result<String, GenerationError>;

    fn name(&self) -> &str;
}

pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        "You are a helpful assistant for the company's knowledge base.\n\
         Answer the customer's question using only the information below.\n\n\
         Knowledge base context:\n{context}\n\n\
         Customer question: {question}\n\n\
         Requirements:\n\
         1. Answer only from the provided context.\n\
         2. If the context is not enough, say so honestly.\n\
         3. Be friendly and professional.\n\
         4. Structure the answer so it is easy to read.\n\n\
         Answer:"
    )
}

/// `Basic` authorization key built from a client id and secret.
pub fn encode_client_credentials(client_id: &str, client_secret: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{client_id}:{client_secret}"))
}

/// Access token with its expiry. Owned by the backend adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Tokens this close to expiry are refreshed before use.
    pub const REFRESH_MARGIN_SECS: i64 = 60;

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::seconds(Self::REFRESH_MARGIN_SECS) > now
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Milliseconds since the epoch.
    expires_at: Option<i64>,
}

/// Chat-completion backend behind an OAuth token endpoint.
pub struct ChatCompletionBackend {
    config: GenerationConfig,
    authorization_key: String,
    client: Client,
    timeout: Duration,
    credential: Mutex<Option<Credential>>,
}

impl ChatCompletionBackend {
    pub fn new(
        config: GenerationConfig,
        authorization_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            config,
            authorization_key: authorization_key.into(),
            client,
            timeout,
            credential: Mutex::new(None),
        })
    }

    /// Returns a token that is valid now, fetching a new one when needed.
    pub async fn ensure_valid(&self) -> Result<String, GenerationError> {
        let mut credential = self.credential.lock().await;
        if let Some(current) = credential.as_ref() {
            if current.is_valid_at(Utc::now()) {
                return Ok(current.token.clone());
            }
        }

        let fresh = self.fetch_credential().await?;
        let token = fresh.token.clone();
        *credential = Some(fresh);
        Ok(token)
    }

    async fn invalidate(&self) {
        *self.credential.lock().await = None;
    }

    async fn fetch_credential(&self) -> Result<Credential, GenerationError> {
        debug!(auth_url = %self.config.auth_url, "requesting access token");
        let response = self
            .client
            .post(&self.config.auth_url)
            .header("Accept", "application/json")
            .header("RqUID", Uuid::new_v4().to_string())
            .header("Authorization", format!("Basic {}", self.authorization_key))
            .form(&[("scope", self.config.scope.as_str())])
            .send()
            .await
            .map_err(|error| self.classify(error))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Auth(format!("{status}: {body}")));
        }

        let parsed: TokenResponse = response.json().await?;
        let expires_at = parsed
            .expires_at
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(|| Utc::now() + ChronoDuration::minutes(30));

        Ok(Credential {
            token: parsed.access_token,
            expires_at,
        })
    }

    async fn complete(
        &self,
        token: &str,
        prompt: &str,
    ) -> Result<reqwest::Response, GenerationError> {
        self.client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .header("Accept", "application/json")
            .bearer_auth(token)
            .json(&json!({
                "model": self.config.model,
                "messages": [{ "role": "user", "content": prompt }],
                "temperature": self.config.temperature,
                "max_tokens": self.config.max_tokens,
            }))
            .send()
            .await
            .map_err(|error| self.classify(error))
    }

    fn classify(&self, error: reqwest::Error) -> GenerationError {
        if error.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else {
            GenerationError::Http(error)
        }
    }
}

#[async_trait]
impl GenerationBackend for ChatCompletionBackend {
    async fn generate(&self, question: &str, context: &str) -> Result<String, GenerationError> {
        let prompt = build_prompt(question, context);

        let token = self.ensure_valid().await?;
        let mut response = self.complete(&token, &prompt).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("access token rejected, refreshing once");
            self.invalidate().await;
            let token = self.ensure_valid().await?;
            response = self.complete(&token, &prompt).await?;
        }

        if !response.status().is_success() {
            return Err(GenerationError::BackendResponse {
                backend: self.name().to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GenerationError::BackendResponse {
                backend: self.name().to_string(),
                details: "response has no choices[0].message.content".to_string(),
            })
    }

    fn name(&self) -> &str {
        "chat-completions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal token + chat-completions endpoint. Tokens are `token-1`, `token-2`, ...
    #[derive(Default)]
    struct FakeChatServer {
        token_requests: AtomicUsize,
        completion_requests: AtomicUsize,
        reject_first_token: bool,
    }

    impl FakeChatServer {
        async fn start(self) -> std::io::Result<(Arc<Self>, String)> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let address = listener.local_addr()?;
            let state = Arc::new(self);
            let served = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let served = Arc::clone(&served);
                    tokio::spawn(async move {
                        let _ = served.handle(stream).await;
                    });
                }
            });
            Ok((state, format!("http://{address}")))
        }

        async fn handle(&self, mut stream: TcpStream) -> std::io::Result<()> {
            let mut request = Vec::new();
            let mut buffer = [0u8; 2048];
            let header_end = loop {
                let read = stream.read(&mut buffer).await?;
                if read == 0 {
                    return Ok(());
                }
                request.extend_from_slice(&buffer[..read]);
                if let Some(at) = request.windows(4).position(|window| window == b"\r\n\r\n") {
                    break at + 4;
                }
            };
            let head = String::from_utf8_lossy(&request[..header_end]).to_string();
            let content_length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while request.len() < header_end + content_length {
                let read = stream.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }

            let request_line = head.lines().next().unwrap_or_default();
            let (status, body) = if request_line.contains("/oauth") {
                let issued = self.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
                let expires_at = (Utc::now() + ChronoDuration::minutes(30)).timestamp_millis();
                (
                    "200 OK",
                    format!(r#"{{"access_token":"token-{issued}","expires_at":{expires_at}}}"#),
                )
            } else {
                self.completion_requests.fetch_add(1, Ordering::SeqCst);
                if self.reject_first_token && head.contains("Bearer token-1") {
                    ("401 Unauthorized", "{}".to_string())
                } else {
                    (
                        "200 OK",
                        r#"{"choices":[{"message":{"role":"assistant","content":"Open daily."}}]}"#
                            .to_string(),
                    )
                }
            };

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await
        }
    }

    fn backend_for(base: &str) -> ChatCompletionBackend {
        let config = GenerationConfig {
            auth_url: format!("{base}/oauth"),
            base_url: format!("{base}/api"),
            ..GenerationConfig::default()
        };
        ChatCompletionBackend::new(config, "key", Duration::from_secs(5)).expect("client builds")
    }

    #[tokio::test]
    async fn valid_token_is_reused() {
        let (server, base) = FakeChatServer::default().start().await.expect("server starts");
        let backend = backend_for(&base);

        let first = backend.ensure_valid().await.expect("token");
        let second = backend.ensure_valid().await.expect("token");

        assert_eq!(first, "token-1");
        assert_eq!(first, second);
        assert_eq!(server.token_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_token_is_refetched_once() {
        let server = FakeChatServer {
            reject_first_token: true,
            ..FakeChatServer::default()
        };
        let (server, base) = server.start().await.expect("server starts");
        let backend = backend_for(&base);

        let answer = backend.generate("When are you open?", "hours: daily").await;

        assert_eq!(answer.expect("second attempt succeeds"), "Open daily.");
        assert_eq!(server.token_requests.load(Ordering::SeqCst), 2);
        assert_eq!(server.completion_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn accepted_token_needs_a_single_round_trip() {
        let (server, base) = FakeChatServer::default().start().await.expect("server starts");
        let backend = backend_for(&base);

        backend.generate("q", "c").await.expect("answer");
        backend.generate("q", "c").await.expect("answer");

        assert_eq!(server.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(server.completion_requests.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn credential_expiring_soon_is_not_valid() {
        let now = Utc::now();
        let fresh = Credential {
            token: "t".to_string(),
            expires_at: now + ChronoDuration::minutes(10),
        };
        let stale = Credential {
            token: "t".to_string(),
            expires_at: now + ChronoDuration::seconds(30),
        };
        assert!(fresh.is_valid_at(now));
        assert!(!stale.is_valid_at(now));
        assert!(!fresh.is_valid_at(now + ChronoDuration::minutes(10)));
    }

    #[test]
    fn prompt_places_context_before_question() {
        let prompt = build_prompt("Where is the studio?", "studio: Arbat");
        let context_at = prompt.find("studio: Arbat").expect("context present");
        let question_at = prompt.find("Where is the studio?").expect("question present");
        assert!(context_at < question_at);
    }

    #[test]
    fn client_credentials_are_base64_encoded() {
        assert_eq!(encode_client_credentials("id", "secret"), "aWQ6c2VjcmV0");
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_a_generation_error() {
        let config = GenerationConfig {
            auth_url: "http://127.0.0.1:9/oauth".to_string(),
            base_url: "http://127.0.0.1:9/api".to_string(),
            ..GenerationConfig::default()
        };
        let backend = ChatCompletionBackend::new(config, "key", Duration::from_secs(2))
            .expect("client builds");
        let result = backend.generate("question", "context").await;
        assert!(result.is_err());
    }
}
