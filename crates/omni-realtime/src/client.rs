use crate::{error::ClientError, transport};
use bytes::Bytes;
use futures::{Stream as FuturesStream, StreamExt, stream::BoxStream};
use omni_agent_core::{
    ChannelObserver, ConfigOverrides, Fault, Message, Session, SessionConfig, Stream,
    StreamEvent, StreamObserver, StreamOptions, TransportCode, TransportFailure,
    provider::ChatReply,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_TARGET: &str = "localhost:50051";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_HEADER: &str = "X-Session-ID";

#[derive(Serialize)]
struct CreateSessionBody<'a> {
    config: &'a ConfigOverrides,
}

#[derive(Deserialize)]
struct SessionBody {
    session_id: String,
    config: SessionConfig,
}

#[derive(Deserialize)]
struct CloseBody {
    closed: bool,
}

#[derive(Deserialize)]
struct TranscribeBody {
    text: String,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    messages: &'a [Message],
}

#[derive(Deserialize)]
struct ChatReplyBody {
    content: String,
    finish_reason: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: String,
    param: Option<String>,
}

/// Server health as reported by `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
}

/// Builder for [`OmniAgentClient`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    target: String,
    use_tls: bool,
    timeout: Duration,
    stream_deadline: Option<Duration>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            use_tls: false,
            timeout: DEFAULT_TIMEOUT,
            stream_deadline: None,
        }
    }
}

impl ClientBuilder {
    /// `host:port` of the agent.
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Per-request timeout for the unary calls.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Deadline applied to streams whose options do not set one.
    pub fn stream_deadline(mut self, deadline: Duration) -> Self {
        self.stream_deadline = Some(deadline);
        self
    }

    pub fn build(self) -> Result<OmniAgentClient, ClientError> {
        let target = self.target.trim().trim_end_matches('/');
        if target.is_empty() || target.contains("://") {
            return Err(ClientError::Config(format!(
                "target must be host:port, got '{}'",
                self.target
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let (http_scheme, ws_scheme) = if self.use_tls {
            ("https", "wss")
        } else {
            ("http", "ws")
        };
        info!(%target, use_tls = self.use_tls, "OmniAgentClient created");
        Ok(OmniAgentClient {
            http,
            http_base: format!("{http_scheme}://{target}"),
            ws_base: format!("{ws_scheme}://{target}"),
            stream_deadline: self.stream_deadline,
        })
    }
}

/// Client for an Omni-Agent server: the streaming exchange over WebSocket and
/// the unary session, transcription and chat calls over HTTP.
#[derive(Debug, Clone)]
pub struct OmniAgentClient {
    http: reqwest::Client,
    http_base: String,
    ws_base: String,
    stream_deadline: Option<Duration>,
}

impl OmniAgentClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    // ========== Sessions ==========

    pub async fn create_session(&self, config: ConfigOverrides) -> Result<Session, ClientError> {
        let response = self
            .http
            .post(format!("{}/v1/sessions", self.http_base))
            .json(&CreateSessionBody { config: &config })
            .send()
            .await;
        let body: SessionBody = read_json(response, None).await?;
        info!(session_id = %body.session_id, "Session created");
        Ok(Session::new(body.session_id, body.config)?)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ClientError> {
        let response = self
            .http
            .get(format!("{}/v1/sessions/{session_id}", self.http_base))
            .send()
            .await;
        let body: SessionBody = read_json(response, Some(session_id)).await?;
        Ok(Session::new(body.session_id, body.config)?)
    }

    /// Closes a session on the server. Returns whether it was open.
    pub async fn close_session(&self, session_id: &str) -> Result<bool, ClientError> {
        let response = self
            .http
            .delete(format!("{}/v1/sessions/{session_id}", self.http_base))
            .send()
            .await;
        let body: CloseBody = read_json(response, Some(session_id)).await?;
        Ok(body.closed)
    }

    /// Closes `session` locally and on the server. Only the first call talks
    /// to the server; later calls return `false`.
    pub async fn close(&self, session: &Session) -> Result<bool, ClientError> {
        if !session.close() {
            return Ok(false);
        }
        self.close_session(session.id()).await
    }

    // ========== Unary calls ==========

    pub async fn transcribe(
        &self,
        session_id: &str,
        audio: impl Into<Bytes>,
    ) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{}/v1/stt/transcribe", self.http_base))
            .header(SESSION_HEADER, session_id)
            .body(audio.into())
            .send()
            .await;
        let body: TranscribeBody = read_json(response, Some(session_id)).await?;
        Ok(body.text)
    }

    /// Sends `messages` as-is, without touching any session history.
    pub async fn chat_messages(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<ChatReply, ClientError> {
        let response = self
            .http
            .post(format!("{}/v1/chat", self.http_base))
            .header(SESSION_HEADER, session_id)
            .json(&ChatBody { messages })
            .send()
            .await;
        let body: ChatReplyBody = read_json(response, Some(session_id)).await?;
        Ok(ChatReply {
            content: body.content,
            finish_reason: body.finish_reason,
        })
    }

    /// Sends `content` on top of the session history. With `remember`, both
    /// turns are kept in the history once the reply arrives.
    pub async fn chat(
        &self,
        session: &Session,
        content: &str,
        remember: bool,
    ) -> Result<ChatReply, ClientError> {
        let mut exchange = session.begin_exchange(Some(content), remember)?;
        let mut messages = exchange.outgoing_history().to_vec();
        messages.push(Message::user(content));

        let reply = self.chat_messages(session.id(), &messages).await?;
        exchange.complete(&reply.content);
        Ok(reply)
    }

    pub async fn health(&self) -> Result<HealthStatus, ClientError> {
        let response = self
            .http
            .get(format!("{}/health", self.http_base))
            .send()
            .await;
        read_json(response, None).await
    }

    // ========== Streaming ==========

    /// Connects a stream for `session` and sends its start frame.
    pub async fn open_stream(
        &self,
        session: &Session,
        mut options: StreamOptions,
        observer: impl StreamObserver + 'static,
    ) -> Result<Stream, ClientError> {
        if options.deadline.is_none() {
            options.deadline = self.stream_deadline;
        }
        let url = format!("{}/v1/stream", self.ws_base);
        let transport = transport::connect(&url)
            .await
            .map_err(|failure| Fault::from_transport(&failure.with_session(session.id())))?;
        Ok(Stream::open(session.clone(), transport, options, observer).await?)
    }

    /// Streams `audio` through one exchange and yields every event, ending
    /// after the terminal one.
    ///
    /// Audio is forwarded from a background task; once `audio` is exhausted
    /// the end-of-audio signal is sent.
    pub async fn process_stream<A>(
        &self,
        session: &Session,
        options: StreamOptions,
        audio: A,
    ) -> Result<BoxStream<'static, StreamEvent>, ClientError>
    where
        A: FuturesStream<Item = Bytes> + Send + 'static,
    {
        let (observer, events) = ChannelObserver::new();
        let feeder = self.open_stream(session, options, observer).await?;

        tokio::spawn(async move {
            let mut audio = Box::pin(audio);
            while let Some(chunk) = audio.next().await {
                if let Err(e) = feeder.send_audio(chunk).await {
                    debug!("Stopped forwarding audio: {e}");
                    return;
                }
            }
            if let Err(e) = feeder.end_audio().await {
                warn!("Could not end audio: {e}");
                return;
            }
            feeder.closed().await;
        });

        Ok(futures::stream::unfold((events, false), |(mut events, done)| async move {
            if done {
                return None;
            }
            let event = events.recv().await?;
            let done = event.is_terminal();
            Some((event, (events, done)))
        })
        .boxed())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: Result<reqwest::Response, reqwest::Error>,
    session_id: Option<&str>,
) -> Result<T, ClientError> {
    let response = response.map_err(|e| fault_from_reqwest(e, session_id))?;
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| fault_from_reqwest(e, session_id).into());
    }

    let failure = match response.json::<ErrorBody>().await {
        Ok(body) => {
            let code = body
                .code
                .map(|code| TransportCode::parse(&code))
                .unwrap_or_else(|| TransportCode::from_http_status(status.as_u16()));
            let mut failure = TransportFailure::new(code, body.message);
            failure.param = body.param;
            failure
        }
        Err(_) => TransportFailure::new(
            TransportCode::from_http_status(status.as_u16()),
            status.canonical_reason().unwrap_or("request failed"),
        ),
    };
    Err(Fault::from_transport(&with_session(failure, session_id)).into())
}

fn fault_from_reqwest(error: reqwest::Error, session_id: Option<&str>) -> Fault {
    let code = if error.is_timeout() {
        TransportCode::DeadlineExceeded
    } else if error.is_connect() {
        TransportCode::Unavailable
    } else if let Some(status) = error.status() {
        TransportCode::from_http_status(status.as_u16())
    } else if error.is_decode() {
        TransportCode::Internal
    } else {
        TransportCode::Other("http".into())
    };
    let failure = TransportFailure::new(code, error.to_string());
    Fault::from_transport(&with_session(failure, session_id))
}

fn with_session(failure: TransportFailure, session_id: Option<&str>) -> TransportFailure {
    match session_id {
        Some(id) => failure.with_session(id),
        None => failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_plaintext_localhost() {
        let client = OmniAgentClient::builder().build().unwrap();
        assert_eq!(client.http_base, "http://localhost:50051");
        assert_eq!(client.ws_base, "ws://localhost:50051");
        assert!(client.stream_deadline.is_none());
    }

    #[test]
    fn test_builder_tls_and_deadline() {
        let client = OmniAgentClient::builder()
            .target("agent.example.com:443/")
            .use_tls(true)
            .stream_deadline(Duration::from_secs(60))
            .build()
            .unwrap();
        assert_eq!(client.http_base, "https://agent.example.com:443");
        assert_eq!(client.ws_base, "wss://agent.example.com:443");
        assert_eq!(client.stream_deadline, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_builder_rejects_urls_as_targets() {
        assert!(matches!(
            OmniAgentClient::builder().target("http://x:1").build(),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = OmniAgentClient::builder()
            .target(format!("127.0.0.1:{port}"))
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let err = client.health().await.unwrap_err();
        assert!(err.fault().is_some_and(Fault::is_retryable));
    }
}
