//! # Audio Pipeline
//!
//! Runs one request's frames through a recognition session:
//!
//! ```text
//! RawFrame → decode → gain → PcmUnit → [noise window policy] → accept_waveform
//! ```
//!
//! then asks for the final transcript and maps it to a [`ProtocolOutcome`].
//! Nothing in here fails the HTTP request: every engine error becomes
//! `DecodeError`, which the client answers by asking the user to try again.

use crate::audio::denoise::NoiseWindowPolicy;
use crate::audio::frames::RawFrame;
use crate::audio::processor::{AudioProcessor, PcmUnit};
use crate::protocol::ProtocolOutcome;
use crate::transcription::engine::TranscriptResult;
use crate::transcription::registry::RecognitionSession;
use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Marker the client reads as "no leading space before this word".
pub const NO_SPACE_BEFORE_MARKER: &str = "\\*no-space-before";

/// Result of one pipeline run.
#[derive(Debug)]
pub struct PipelineOutput {
    pub outcome: ProtocolOutcome,
    /// Audio exactly as fed to the recognizer. Present only when capture was
    /// requested and every frame made it through.
    pub recording: Option<PcmUnit>,
    pub frames_processed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioPipeline {
    processor: AudioProcessor,
    noise_window: NoiseWindowPolicy,
}

impl AudioPipeline {
    pub fn new(processor: AudioProcessor, noise_window: NoiseWindowPolicy) -> Self {
        Self {
            processor,
            noise_window,
        }
    }

    #[cfg(test)]
    pub fn processor(&self) -> &AudioProcessor {
        &self.processor
    }

    #[cfg(test)]
    pub fn noise_window(&self) -> NoiseWindowPolicy {
        self.noise_window
    }

    /// Feed `frames` to `session` and classify the final transcript.
    ///
    /// The session is left dirty; the caller resets it by releasing the lease.
    pub async fn run(
        &self,
        session: &mut RecognitionSession,
        frames: &[RawFrame],
        capture: bool,
    ) -> PipelineOutput {
        let mut recording = capture.then(PcmUnit::default);

        if let Err(e) = self.feed(session, frames, recording.as_mut()).await {
            warn!(
                session_id = %session.id(),
                language = %session.language(),
                error = %format!("{:#}", e),
                "Audio decoding failed"
            );
            return PipelineOutput {
                outcome: ProtocolOutcome::DecodeError,
                recording: None,
                frames_processed: 0,
            };
        }

        let outcome = match session.final_result().await {
            Ok(transcript) => classify(transcript),
            Err(e) => {
                warn!(
                    session_id = %session.id(),
                    error = %format!("{:#}", e),
                    "Recognizer failed to produce a result"
                );
                ProtocolOutcome::DecodeError
            }
        };

        debug!(
            session_id = %session.id(),
            frames = frames.len(),
            outcome = outcome.label(),
            "Pipeline finished"
        );

        PipelineOutput {
            outcome,
            recording,
            frames_processed: frames.len(),
        }
    }

    async fn feed(
        &self,
        session: &mut RecognitionSession,
        frames: &[RawFrame],
        mut recording: Option<&mut PcmUnit>,
    ) -> Result<()> {
        for (index, frame) in frames.iter().enumerate() {
            let pcm = session
                .decode(frame.as_bytes())
                .with_context(|| format!("frame {} could not be decoded", index))?;
            let unit = self.processor.process(&pcm)?;
            let unit = session
                .suppress(self.noise_window, unit)
                .with_context(|| format!("noise suppression failed on frame {}", index))?;

            session
                .accept_waveform(&unit.to_bytes())
                .await
                .with_context(|| format!("recognizer rejected frame {}", index))?;

            if let Some(recording) = recording.as_deref_mut() {
                recording.append(unit);
            }
        }
        Ok(())
    }
}

/// Map a final transcript to the reply the client gets.
///
/// Text without word details cannot be rendered and counts as a decoding failure.
pub fn classify(transcript: TranscriptResult) -> ProtocolOutcome {
    if transcript.full_text.is_empty() {
        return ProtocolOutcome::NoSpeechDetected;
    }
    if transcript.words.is_empty() {
        warn!(text = %transcript.full_text, "Transcript has text but no word results");
        return ProtocolOutcome::DecodeError;
    }
    ProtocolOutcome::Success(normalize_first_word(transcript))
}

/// Append the no-space marker to the first word and capitalize its first letter.
pub fn normalize_first_word(mut transcript: TranscriptResult) -> TranscriptResult {
    if let Some(first) = transcript.words.first_mut() {
        let marked = format!("{}{}", first.text, NO_SPACE_BEFORE_MARKER);
        let mut chars = marked.chars();
        first.text = match chars.next() {
            Some(initial) => initial.to_uppercase().chain(chars).collect(),
            None => marked,
        };
    }
    transcript
}
