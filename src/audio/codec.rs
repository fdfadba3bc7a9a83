//! # Frame Decoding
//!
//! The codec that turns one uploaded frame into raw PCM is an external engine;
//! this module only defines the seam and a registry of available decoders.
//!
//! Decoders are stateful (codecs carry inter-frame prediction state), so every
//! recognition session owns its own instance and resets it between requests.

use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Name of the bundled pass-through decoder.
pub const PCM_S16LE: &str = "pcm_s16le";

/// Codec names accepted in `audio.codec`.
pub const SUPPORTED_CODECS: &[&str] = &[PCM_S16LE];

/// Decodes one frame into little-endian 16-bit mono PCM.
pub trait FrameDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Drop inter-frame state so the next request starts clean.
    fn reset(&mut self) {}
}

/// Builds a fresh decoder for a new session.
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn FrameDecoder> + Send + Sync>;

/// Look up a decoder factory by codec name.
pub fn decoder_factory(name: &str) -> Result<DecoderFactory> {
    match name {
        PCM_S16LE => Ok(Arc::new(|| Box::new(PcmPassthroughDecoder) as Box<dyn FrameDecoder>)),
        other => Err(anyhow!("No decoder registered for codec '{}'", other)),
    }
}

/// Frames that already carry 16-bit PCM. Only checks sample alignment.
#[derive(Debug, Default)]
pub struct PcmPassthroughDecoder;

impl FrameDecoder for PcmPassthroughDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.is_empty() {
            return Err(anyhow!("Empty frame cannot be decoded"));
        }
        if frame.len() % 2 != 0 {
            return Err(anyhow!(
                "Frame of {} bytes is not 16-bit aligned",
                frame.len()
            ));
        }
        Ok(frame.to_vec())
    }
}
