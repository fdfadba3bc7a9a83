//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP_` prefix, `__` between path segments)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_MODELS__DEFAULT_LANGUAGE`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)
//!
//! The double underscore separator keeps field names such as `default_language`
//! addressable from the environment.

use crate::audio::codec;
use crate::audio::denoise::NoiseWindowPolicy;
use crate::audio::frames::PREAMBLE_FRAMES;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
    pub debug: DebugConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Language model and recognizer settings.
///
/// ## Fields:
/// - `default_language`: Language active at startup, before any request selects one
/// - `catalog_url`: JSON model list fetched once at startup to learn the supported languages
/// - `catalog_timeout_secs`: Upper bound on the startup catalog fetch
/// - `recognizer_url`: WebSocket URL of the recognition server; `{lang}` is
///   replaced with the language tag, so one server per language can be addressed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default_language: String,
    pub catalog_url: String,
    pub catalog_timeout_secs: u64,
    pub recognizer_url: String,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `codec`: Name of the frame decoder (see `audio::codec::SUPPORTED_CODECS`)
/// - `sample_rate`: Rate the recognizer is configured with; the device always sends 16kHz
/// - `gain`: Fixed loudness multiplier applied to every decoded sample
/// - `read_timeout_secs`: Longest wait for the next complete frame of an upload
/// - `max_upload_bytes`: Upload body size at which the request is refused
/// - `max_frames`: Frames per upload at which the request is refused
/// - `noise_suppression`: Whether the noise-suppression engine is available
/// - `noise_window`: Which part of each unit is suppressed (`leading` or `whole`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub gain: f32,
    pub read_timeout_secs: u64,
    pub max_upload_bytes: usize,
    pub max_frames: usize,
    pub noise_suppression: bool,
    pub noise_window: String,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Recognition sessions checked out at the same time.
///   Requests beyond this wait for a session to be released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Diagnostic capture of incoming audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Persist every request's audio and transcript, and route the listing endpoints
    pub audio_debug: bool,
    /// Directory recordings are written to
    pub recordings_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                default_language: "en-us".to_string(),
                catalog_url: "https://alphacephei.com/vosk/models/model-list.json".to_string(),
                catalog_timeout_secs: 10,
                recognizer_url: "ws://127.0.0.1:2700".to_string(),
            },
            audio: AudioConfig {
                codec: codec::PCM_S16LE.to_string(),
                sample_rate: 16000,
                gain: 6.0,
                read_timeout_secs: 30,
                max_upload_bytes: 16 * 1024 * 1024,
                max_frames: 10_000,
                noise_suppression: false,
                noise_window: "leading".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 4,
            },
            debug: DebugConfig {
                audio_debug: false,
                recordings_dir: "audio-debug".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_MODELS__RECOGNIZER_URL=ws://asr:2700`: Point at another recognition server
    /// - `APP_DEBUG__AUDIO_DEBUG=true`: Enable recording capture
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching these at startup gives a clear message instead of a request-time
    /// failure deep inside the audio pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.default_language.trim().is_empty() {
            return Err(anyhow::anyhow!("Default language cannot be empty"));
        }

        if self.models.catalog_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Language catalog URL cannot be empty"));
        }

        if self.models.recognizer_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Recognizer URL cannot be empty"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if !(self.audio.gain > 0.0) {
            return Err(anyhow::anyhow!("Audio gain must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.read_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Read timeout must be greater than 0"));
        }

        if self.audio.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        if self.audio.max_frames <= PREAMBLE_FRAMES {
            return Err(anyhow::anyhow!(
                "Max frames must leave room for audio after the {} preamble frames",
                PREAMBLE_FRAMES
            ));
        }

        if !codec::SUPPORTED_CODECS.contains(&self.audio.codec.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown codec '{}' (supported: {})",
                self.audio.codec,
                codec::SUPPORTED_CODECS.join(", ")
            ));
        }

        self.noise_window_policy()?;

        Ok(())
    }

    /// Parsed form of `audio.noise_window`.
    pub fn noise_window_policy(&self) -> Result<NoiseWindowPolicy> {
        self.audio.noise_window.parse()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.audio.read_timeout_secs)
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.models.catalog_timeout_secs)
    }
}
