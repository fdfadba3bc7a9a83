//! # Vosk Server Recognizer
//!
//! Talks to a [Vosk server](https://github.com/alphacep/vosk-server) over its
//! WebSocket protocol:
//!
//! 1. Text `{"config": {"sample_rate": 16000, "words": 1}}` right after connecting
//! 2. One binary message of PCM per audio unit; the server answers each with
//!    either `{"partial": ...}` or a finished segment `{"text": ..., "result": [...]}`
//! 3. Text `{"eof" : 1}`; the server answers with the last segment and closes
//!
//! Finished segments are merged, so the final transcript covers the whole request
//! even when the server split the utterance. Resetting closes the socket: the
//! next request reconnects and gets a fresh decoder on the server side.

use crate::transcription::engine::{Recognizer, RecognizerFactory, TranscriptResult};
use crate::transcription::language::LanguageTag;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EOF_MESSAGE: &str = r#"{"eof" : 1}"#;

/// Placeholder replaced by the language tag in the endpoint template.
pub const LANGUAGE_PLACEHOLDER: &str = "{lang}";

/// Creates one recognizer per session, each with its own connection.
pub struct VoskServerFactory {
    url_template: String,
    sample_rate: u32,
}

impl VoskServerFactory {
    pub fn new(url_template: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            url_template: url_template.into(),
            sample_rate,
        }
    }

    /// Endpoint serving `language`.
    pub fn endpoint_for(&self, language: &LanguageTag) -> String {
        self.url_template.replace(LANGUAGE_PLACEHOLDER, language.as_str())
    }
}

#[async_trait]
impl RecognizerFactory for VoskServerFactory {
    async fn create(&self, language: &LanguageTag) -> Result<Box<dyn Recognizer>> {
        let mut recognizer = VoskServerRecognizer::new(self.endpoint_for(language), self.sample_rate);
        // Connect eagerly so an unreachable server fails the checkout, not the first frame
        recognizer.connection().await?;
        Ok(Box::new(recognizer))
    }
}

pub struct VoskServerRecognizer {
    url: String,
    sample_rate: u32,
    socket: Option<Socket>,
    transcript: TranscriptResult,
}

impl VoskServerRecognizer {
    pub fn new(url: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            url: url.into(),
            sample_rate,
            socket: None,
            transcript: TranscriptResult::default(),
        }
    }

    fn config_message(&self) -> String {
        json!({ "config": { "sample_rate": self.sample_rate, "words": 1 } }).to_string()
    }

    /// The open socket, connecting first if needed.
    async fn connection(&mut self) -> Result<&mut Socket> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                let (mut socket, _) = connect_async(self.url.as_str())
                    .await
                    .with_context(|| format!("Failed to connect to recognizer at {}", self.url))?;
                socket
                    .send(Message::Text(self.config_message()))
                    .await
                    .context("Failed to configure recognizer")?;
                debug!(url = %self.url, "Connected to recognizer");
                socket
            }
        };
        Ok(self.socket.insert(socket))
    }

    /// Wait for the server's next JSON reply, skipping control frames.
    async fn next_reply(&mut self) -> Result<Value> {
        let socket = self.connection().await?;
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).context("Recognizer sent invalid JSON");
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(anyhow!("Recognizer closed the connection"));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(anyhow!(e).context("Recognizer connection failed")),
            }
        }
    }

    /// Merge a finished segment; partial hypotheses are ignored.
    fn absorb(&mut self, reply: Value) -> Result<bool> {
        if reply.get("text").is_some() {
            self.transcript.merge(TranscriptResult::from_engine_value(reply)?);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!(error = %e, "Recognizer socket did not close cleanly");
            }
        }
    }
}

#[async_trait]
impl Recognizer for VoskServerRecognizer {
    async fn accept_waveform(&mut self, pcm: &[u8]) -> Result<()> {
        self.connection()
            .await?
            .send(Message::Binary(pcm.to_vec()))
            .await
            .context("Failed to send audio to recognizer")?;

        let reply = self.next_reply().await?;
        self.absorb(reply)?;
        Ok(())
    }

    async fn final_result(&mut self) -> Result<TranscriptResult> {
        self.connection()
            .await?
            .send(Message::Text(EOF_MESSAGE.to_string()))
            .await
            .context("Failed to finalize recognition")?;

        loop {
            let reply = self.next_reply().await?;
            if self.absorb(reply)? {
                break;
            }
        }

        // The server closes after eof
        self.close().await;
        Ok(std::mem::take(&mut self.transcript))
    }

    async fn reset(&mut self) -> Result<()> {
        if !self.transcript.is_empty() {
            warn!(url = %self.url, "Discarding unfinished transcript on reset");
        }
        self.transcript = TranscriptResult::default();
        self.close().await;
        Ok(())
    }
}
