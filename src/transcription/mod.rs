//! # Transcription Module
//!
//! Everything between "we have PCM" and "we have words": the recognizer seam,
//! the language catalog, and the registry that decides which language is
//! active and which session serves which request.
//!
//! ## Key Components:
//! - **Engine interface**: `Recognizer` / `RecognizerFactory` traits and the transcript types
//! - **Languages**: `LanguageTag` derived from the Host header, catalog fetched at startup
//! - **Session registry**: active-language state machine plus per-language session pool
//! - **Vosk server client**: the bundled recognizer, reached over WebSocket

pub mod engine;      // Recognizer traits and transcript types
pub mod language;    // Language tags and the model catalog
pub mod registry;    // Active language and session pooling
pub mod vosk;        // Vosk server WebSocket recognizer

#[cfg(test)]
pub mod testing;
