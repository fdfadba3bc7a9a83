//! # Language Session Registry
//!
//! Owns the process-wide "active language" and the recognition sessions that
//! serve it.
//!
//! ## Language State Machine:
//! `Idle → Active(tag) → Active(other) → ...`
//!
//! `select(tag)` switches only when `tag` is in the catalog and differs from the
//! current one; an unknown tag leaves the active language alone and the request
//! proceeds with whatever was already loaded.
//!
//! ## Session Pooling:
//! Sessions are never shared between in-flight requests. A request checks one
//! out with [`LanguageSessionManager::acquire`], gets exclusive access through
//! the [`SessionLease`], and hands it back with
//! [`LanguageSessionManager::release`], which resets it. Only sessions of the
//! active language go back into the pool; a lease that is dropped without being
//! released (the handler future was cancelled) is torn down with it.
//!
//! The number of leases out at once is bounded by a semaphore sized from
//! `performance.max_concurrent_sessions`; further requests wait their turn.

use crate::audio::codec::{DecoderFactory, FrameDecoder};
use crate::audio::denoise::{DenoiserFactory, NoiseSuppressor, NoiseWindowPolicy};
use crate::audio::processor::PcmUnit;
use crate::transcription::engine::{Recognizer, RecognizerFactory, TranscriptResult};
use crate::transcription::language::LanguageTag;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which language the process is currently serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanguageState {
    /// Nothing selected yet
    Idle,
    /// Requests run against this language
    Active(LanguageTag),
}

impl LanguageState {
    pub fn tag(&self) -> Option<&LanguageTag> {
        match self {
            LanguageState::Idle => None,
            LanguageState::Active(tag) => Some(tag),
        }
    }
}

/// Everything one request needs to turn frames into text.
///
/// Decoder and suppressor state live here next to the recognizer, so they
/// travel together and are reset together.
pub struct RecognitionSession {
    id: Uuid,
    language: LanguageTag,
    decoder: Box<dyn FrameDecoder>,
    denoiser: Option<Box<dyn NoiseSuppressor>>,
    recognizer: Box<dyn Recognizer>,
    requests_served: u64,
}

impl RecognitionSession {
    pub fn new(
        language: LanguageTag,
        decoder: Box<dyn FrameDecoder>,
        denoiser: Option<Box<dyn NoiseSuppressor>>,
        recognizer: Box<dyn Recognizer>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            language,
            decoder,
            denoiser,
            recognizer,
            requests_served: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn language(&self) -> &LanguageTag {
        &self.language
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// Decode one frame to 16-bit PCM.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        self.decoder.decode(frame)
    }

    /// Run the session's suppressor over `unit`; without one the unit passes through.
    pub fn suppress(&mut self, policy: NoiseWindowPolicy, unit: PcmUnit) -> Result<PcmUnit> {
        match self.denoiser.as_mut() {
            Some(denoiser) => policy.apply(denoiser.as_mut(), &unit),
            None => Ok(unit),
        }
    }

    pub async fn accept_waveform(&mut self, pcm: &[u8]) -> Result<()> {
        self.recognizer.accept_waveform(pcm).await
    }

    pub async fn final_result(&mut self) -> Result<TranscriptResult> {
        self.recognizer.final_result().await
    }

    /// Return every engine to a clean state.
    pub async fn reset(&mut self) -> Result<()> {
        self.decoder.reset();
        if let Some(denoiser) = self.denoiser.as_mut() {
            denoiser.reset();
        }
        self.recognizer.reset().await
    }
}

/// Builds complete sessions from the configured engines.
#[derive(Clone)]
pub struct SessionFactory {
    recognizers: Arc<dyn RecognizerFactory>,
    decoders: DecoderFactory,
    denoisers: Option<DenoiserFactory>,
}

impl SessionFactory {
    pub fn new(
        recognizers: Arc<dyn RecognizerFactory>,
        decoders: DecoderFactory,
        denoisers: Option<DenoiserFactory>,
    ) -> Self {
        Self {
            recognizers,
            decoders,
            denoisers,
        }
    }

    pub async fn create(&self, language: &LanguageTag) -> Result<RecognitionSession> {
        let recognizer = self
            .recognizers
            .create(language)
            .await
            .with_context(|| format!("Failed to create recognizer for '{}'", language))?;
        let denoiser = self.denoisers.as_ref().map(|factory| factory());

        Ok(RecognitionSession::new(
            language.clone(),
            (self.decoders)(),
            denoiser,
            recognizer,
        ))
    }
}

/// Exclusive, checked-out access to one session.
///
/// Dereferences to [`RecognitionSession`]. Holds one concurrency permit until
/// it is released or dropped.
pub struct SessionLease {
    session: RecognitionSession,
    _permit: OwnedSemaphorePermit,
}

impl Deref for SessionLease {
    type Target = RecognitionSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

struct RegistryState {
    language: LanguageState,
    idle: Vec<RecognitionSession>,
    switches: u64,
}

/// Coordinates language selection and session checkout.
pub struct LanguageSessionManager {
    supported: HashSet<LanguageTag>,
    factory: SessionFactory,
    state: Mutex<RegistryState>,
    permits: Arc<Semaphore>,
    max_sessions: usize,
}

impl LanguageSessionManager {
    pub fn new(supported: HashSet<LanguageTag>, factory: SessionFactory, max_sessions: usize) -> Self {
        Self {
            supported,
            factory,
            state: Mutex::new(RegistryState {
                language: LanguageState::Idle,
                idle: Vec::new(),
                switches: 0,
            }),
            permits: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
        }
    }

    pub fn is_supported(&self, tag: &LanguageTag) -> bool {
        self.supported.contains(tag)
    }

    pub fn supported_count(&self) -> usize {
        self.supported.len()
    }

    /// Switch the active language to `tag` if possible.
    ///
    /// ## Returns:
    /// The language the request should run against: `tag` when it is
    /// supported, otherwise the previously active language. `None` only while
    /// no language has ever been activated.
    pub async fn select(&self, tag: &LanguageTag) -> Option<LanguageTag> {
        let mut state = self.state.lock().await;

        if !self.supported.contains(tag) {
            debug!(requested = %tag, active = ?state.language.tag(), "Unsupported language, keeping current");
            return state.language.tag().cloned();
        }

        if state.language.tag() != Some(tag) {
            let previous = std::mem::replace(&mut state.language, LanguageState::Active(tag.clone()));
            let retired = std::mem::take(&mut state.idle);
            state.switches += 1;

            info!(
                from = ?previous.tag(),
                to = %tag,
                retired_sessions = retired.len(),
                "Switched active language"
            );
        }

        Some(tag.clone())
    }

    /// Activate the startup language. Unlike [`select`](Self::select) this
    /// fails when the language is not in the catalog.
    pub async fn activate(&self, tag: &LanguageTag) -> Result<()> {
        if !self.is_supported(tag) {
            anyhow::bail!(
                "Default language '{}' is not in the model catalog ({} languages known)",
                tag,
                self.supported.len()
            );
        }
        self.select(tag).await;
        Ok(())
    }

    /// Check out a session for `tag`, waiting for a free slot if needed.
    ///
    /// A pooled session is reused when one exists; otherwise a new one is built.
    pub async fn acquire(&self, tag: &LanguageTag) -> Result<SessionLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("Session registry is shut down")?;

        let pooled = {
            let mut state = self.state.lock().await;
            state
                .idle
                .iter()
                .position(|s| s.language() == tag)
                .map(|index| state.idle.swap_remove(index))
        };

        let session = match pooled {
            Some(session) => {
                debug!(session_id = %session.id(), language = %tag, "Reusing pooled session");
                session
            }
            None => {
                let session = self.factory.create(tag).await?;
                info!(session_id = %session.id(), language = %tag, "Created recognition session");
                session
            }
        };

        Ok(SessionLease {
            session,
            _permit: permit,
        })
    }

    /// Reset a session and return it to the pool, or tear it down if its
    /// language is no longer active or the reset failed.
    pub async fn release(&self, lease: SessionLease) {
        let SessionLease { mut session, _permit } = lease;
        session.requests_served += 1;

        if let Err(e) = session.reset().await {
            warn!(session_id = %session.id(), error = %e, "Session reset failed, discarding session");
            return;
        }

        let mut state = self.state.lock().await;
        if state.language.tag() == Some(session.language()) && state.idle.len() < self.max_sessions {
            state.idle.push(session);
        } else {
            debug!(
                session_id = %session.id(),
                language = %session.language(),
                "Retiring session of inactive language"
            );
        }
    }

    pub async fn active_language(&self) -> Option<LanguageTag> {
        self.state.lock().await.language.tag().cloned()
    }

    pub async fn language_switches(&self) -> u64 {
        self.state.lock().await.switches
    }

    pub async fn idle_sessions(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    /// Leases currently checked out.
    pub fn sessions_in_use(&self) -> usize {
        self.max_sessions - self.permits.available_permits()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
