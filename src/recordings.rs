//! # Debug Recordings
//!
//! With `debug.audio_debug` enabled, every request's processed audio is written
//! to `debug.recordings_dir` so recognition problems can be listened to later:
//!
//! - `pbl-debug-<timestamp>-<lang>.wav`: the audio exactly as the recognizer got it
//! - `pbl-debug-<timestamp>-<lang>.txt`: the transcript, only for successful requests
//!
//! Write failures are logged by the caller and never affect the response.

use crate::audio::processor::{PcmUnit, CHANNELS, SAMPLE_RATE};
use crate::transcription::language::LanguageTag;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FILE_PREFIX: &str = "pbl-debug-";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
/// Length of a timestamp rendered with [`TIMESTAMP_FORMAT`].
const TIMESTAMP_LEN: usize = 26;

/// One captured request as shown by the listing endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordingEntry {
    pub wav: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub language: Option<String>,
    pub recorded_at: Option<String>,
}

/// Directory of captured recordings.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    dir: PathBuf,
}

impl RecordingStore {
    /// Open (and create if needed) the recordings directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create recordings directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one request's audio, plus its transcript when there is one.
    ///
    /// ## Returns:
    /// Path of the written `.wav` file.
    pub fn save(
        &self,
        audio: &PcmUnit,
        transcript: Option<&str>,
        language: &LanguageTag,
        recorded_at: DateTime<Local>,
    ) -> Result<PathBuf> {
        let stem = format!(
            "{}{}-{}",
            FILE_PREFIX,
            recorded_at.format(TIMESTAMP_FORMAT),
            language
        );
        let wav_path = self.dir.join(format!("{}.wav", stem));

        let spec = WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&wav_path, spec)
            .with_context(|| format!("Failed to create {}", wav_path.display()))?;
        for &sample in audio.samples() {
            writer.write_sample(sample)?;
        }
        writer
            .finalize()
            .with_context(|| format!("Failed to write {}", wav_path.display()))?;

        if let Some(text) = transcript {
            let txt_path = self.dir.join(format!("{}.txt", stem));
            fs::write(&txt_path, text)
                .with_context(|| format!("Failed to write {}", txt_path.display()))?;
        }

        debug!(path = %wav_path.display(), duration_ms = audio.duration_ms(), "Saved debug recording");
        Ok(wav_path)
    }

    /// All recordings, newest first.
    pub fn list(&self) -> Result<Vec<RecordingEntry>> {
        let mut entries = Vec::new();

        let dir = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?;
        for item in dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".wav") else {
                continue;
            };

            let txt_path = self.dir.join(format!("{}.txt", stem));
            let text = if txt_path.is_file() {
                match fs::read_to_string(&txt_path) {
                    Ok(text) => Some(text.trim().to_string()),
                    Err(e) => {
                        warn!(path = %txt_path.display(), error = %e, "Unable to read transcript file");
                        None
                    }
                }
            } else {
                None
            };

            let (recorded_at, language) = parse_stem(stem).unzip();
            entries.push(RecordingEntry {
                wav: name,
                text,
                language,
                recorded_at,
            });
        }

        // Timestamps sort lexicographically; unnamed files go last
        entries.sort_by(|a, b| {
            b.recorded_at
                .cmp(&a.recorded_at)
                .then_with(|| b.wav.cmp(&a.wav))
        });
        Ok(entries)
    }

    /// Path of a recording by file name.
    ///
    /// Only plain `.wav` names inside the directory resolve; anything with a
    /// path separator or parent reference is refused.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && !name.contains('/')
            && !name.contains('\\')
            && !name.contains("..")
            && name.ends_with(".wav");
        if !plain {
            return None;
        }

        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }
}

/// Split `pbl-debug-<timestamp>-<lang>` into timestamp and language.
fn parse_stem(stem: &str) -> Option<(String, String)> {
    let rest = stem.strip_prefix(FILE_PREFIX)?;
    let timestamp = rest.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    let language = rest.get(TIMESTAMP_LEN..)?.strip_prefix('-')?;
    Some((timestamp.to_string(), language.to_string()))
}
