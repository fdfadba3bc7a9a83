//! # Recognition Engine Interface
//!
//! The acoustic recognizer is an external engine. Everything the rest of the
//! service needs from it fits in three calls:
//!
//! 1. **accept_waveform**: feed one unit of 16kHz mono PCM; no result comes back
//! 2. **final_result**: finish the utterance and return the transcript
//! 3. **reset**: forget everything so the next request starts clean
//!
//! Engines are created per language through a [`RecognizerFactory`] and owned by
//! exactly one recognition session at a time (see `registry`).

use crate::transcription::language::LanguageTag;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// One recognized word with the engine's confidence in it.
#[derive(Debug, Clone, PartialEq)]
pub struct WordResult {
    pub text: String,
    pub confidence: f64,
}

/// Complete result of one request's recognition.
///
/// ## Invariants:
/// - `words` are in the order they were spoken
/// - An empty `full_text` means no speech was recognized
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptResult {
    pub full_text: String,
    pub words: Vec<WordResult>,
}

/// Wire shape of a Vosk-style result object.
#[derive(Debug, Deserialize)]
struct EngineResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    result: Vec<EngineWord>,
}

#[derive(Debug, Deserialize)]
struct EngineWord {
    word: String,
    conf: f64,
}

impl From<EngineResult> for TranscriptResult {
    fn from(raw: EngineResult) -> Self {
        Self {
            full_text: raw.text,
            words: raw
                .result
                .into_iter()
                .map(|w| WordResult {
                    text: w.word,
                    confidence: w.conf,
                })
                .collect(),
        }
    }
}

impl TranscriptResult {
    /// Parse an engine result such as
    /// `{"text": "hello world", "result": [{"word": "hello", "conf": 0.9}, ...]}`.
    ///
    /// Missing `text` or `result` fields mean "nothing recognized".
    #[cfg(test)]
    pub fn from_engine_json(json: &str) -> Result<Self> {
        let raw: EngineResult =
            serde_json::from_str(json).context("Malformed recognition result")?;
        Ok(raw.into())
    }

    /// Same as [`from_engine_json`](Self::from_engine_json) for an already parsed value.
    pub fn from_engine_value(value: serde_json::Value) -> Result<Self> {
        let raw: EngineResult =
            serde_json::from_value(value).context("Malformed recognition result")?;
        Ok(raw.into())
    }

    pub fn is_empty(&self) -> bool {
        self.full_text.is_empty()
    }

    /// Append a later segment of the same utterance.
    pub fn merge(&mut self, segment: TranscriptResult) {
        if !segment.full_text.is_empty() {
            if !self.full_text.is_empty() {
                self.full_text.push(' ');
            }
            self.full_text.push_str(&segment.full_text);
        }
        self.words.extend(segment.words);
    }
}

/// Incremental speech recognizer bound to one language.
#[async_trait]
pub trait Recognizer: Send {
    /// Feed 16-bit little-endian mono PCM at 16kHz.
    async fn accept_waveform(&mut self, pcm: &[u8]) -> Result<()>;

    /// Finish the current utterance and return everything recognized since the last reset.
    async fn final_result(&mut self) -> Result<TranscriptResult>;

    /// Discard all decoder state accumulated by the current request.
    async fn reset(&mut self) -> Result<()>;
}

/// Creates recognizers for a given language.
#[async_trait]
pub trait RecognizerFactory: Send + Sync {
    async fn create(&self, language: &LanguageTag) -> Result<Box<dyn Recognizer>>;
}
