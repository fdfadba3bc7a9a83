//! # Audio Processing Module
//!
//! Turns a streaming NMSP upload into something a recognizer can consume.
//!
//! ## Key Components:
//! - **Frames**: incremental multipart framing of the request body
//! - **Processor**: PCM conversion and gain
//! - **Codec**: decoder seam for the client's compressed frames
//! - **Denoise**: optional noise suppression and the window policy it follows
//! - **Pipeline**: feeds trimmed frames through a session and classifies the result
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono

pub mod codec;       // Frame decoders
pub mod denoise;     // Noise suppression seam
pub mod frames;      // Multipart framing of the upload body
pub mod pipeline;    // Per-request recognition flow
pub mod processor;   // Sample conversion and gain
