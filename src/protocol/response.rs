//! # NMSP Response Rendering
//!
//! Every reply is a single-part multipart document with a fixed boundary. The
//! part's `Content-Disposition` name tells the client how to read the payload:
//! `QueryResult` carries words, `QueryRetry` asks the user to try again.
//!
//! ## Body Layout:
//! ```text
//! \r\n
//! ----Nuance_NMSP_vutc5w1XobDdefsYG3wq\r\n
//! Content-Type: application/JSON; charset=utf-8\r\n
//! Content-Disposition: form-data; name="QueryResult"\r\n
//! \r\n
//! {"words": [[{"word": "Hello\\*no-space-before", "confidence": "0.9"}]]}\r\n
//! ----Nuance_NMSP_vutc5w1XobDdefsYG3wq--\r\n
//! ```

use crate::protocol::json::{legacy_float_repr, to_legacy_json};
use crate::transcription::engine::TranscriptResult;
use serde::Serialize;

/// Boundary parameter of every response. The body delimiter is `--` plus this.
pub const RESPONSE_BOUNDARY: &str = "--Nuance_NMSP_vutc5w1XobDdefsYG3wq";

const PART_CONTENT_TYPE: &str = "application/JSON; charset=utf-8";
const CRLF: &str = "\r\n";

const NO_SPEECH_PROMPT: &str = "Sorry, speech not recognized. Please try again.";
const DECODE_ERROR_PROMPT: &str = "Error while decoding incoming audio.";

/// How a request ended, as far as the client is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOutcome {
    /// Recognized words, first word already normalized
    Success(TranscriptResult),
    /// The audio was fine but contained no speech
    NoSpeechDetected,
    /// Decoding or recognition failed
    DecodeError,
}

impl ProtocolOutcome {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolOutcome::Success(_) => "success",
            ProtocolOutcome::NoSpeechDetected => "no_speech",
            ProtocolOutcome::DecodeError => "decode_error",
        }
    }

    fn disposition_name(&self) -> &'static str {
        match self {
            ProtocolOutcome::Success(_) => "QueryResult",
            _ => "QueryRetry",
        }
    }
}

#[derive(Serialize)]
struct WordEntry<'a> {
    word: &'a str,
    confidence: String,
}

#[derive(Serialize)]
struct QueryResult<'a> {
    words: [Vec<WordEntry<'a>>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct QueryRetry {
    cause: u8,
    name: &'static str,
    prompt: &'static str,
}

impl QueryRetry {
    fn audio_info(prompt: &'static str) -> Self {
        Self {
            cause: 1,
            name: "AUDIO_INFO",
            prompt,
        }
    }
}

/// A rendered reply: header value plus body bytes.
#[derive(Debug, Clone)]
pub struct ProtocolResponse {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// `Content-Type` header of every response.
pub fn response_content_type() -> String {
    format!("multipart/form-data; boundary={}", RESPONSE_BOUNDARY)
}

fn payload(outcome: &ProtocolOutcome) -> serde_json::Result<Vec<u8>> {
    match outcome {
        ProtocolOutcome::Success(transcript) => {
            let words = transcript
                .words
                .iter()
                .map(|w| WordEntry {
                    word: &w.text,
                    confidence: legacy_float_repr(w.confidence),
                })
                .collect();
            to_legacy_json(&QueryResult { words: [words] })
        }
        ProtocolOutcome::NoSpeechDetected => to_legacy_json(&QueryRetry::audio_info(NO_SPEECH_PROMPT)),
        ProtocolOutcome::DecodeError => to_legacy_json(&QueryRetry::audio_info(DECODE_ERROR_PROMPT)),
    }
}

/// Render `outcome` as a complete NMSP reply.
pub fn render(outcome: &ProtocolOutcome) -> serde_json::Result<ProtocolResponse> {
    let json = payload(outcome)?;
    let delimiter = format!("--{}", RESPONSE_BOUNDARY);

    let mut body = Vec::with_capacity(json.len() + 256);
    body.extend_from_slice(CRLF.as_bytes());
    body.extend_from_slice(delimiter.as_bytes());
    body.extend_from_slice(CRLF.as_bytes());
    body.extend_from_slice(format!("Content-Type: {}{}", PART_CONTENT_TYPE, CRLF).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"{}",
            outcome.disposition_name(),
            CRLF
        )
        .as_bytes(),
    );
    body.extend_from_slice(CRLF.as_bytes());
    body.extend_from_slice(&json);
    body.extend_from_slice(CRLF.as_bytes());
    body.extend_from_slice(format!("{}--{}", delimiter, CRLF).as_bytes());

    Ok(ProtocolResponse {
        content_type: response_content_type(),
        body,
    })
}
