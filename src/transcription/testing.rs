//! Scripted engines for unit tests.

use crate::audio::denoise::{DenoiserFactory, NoiseSuppressor};
use crate::audio::processor::PcmUnit;
use crate::transcription::engine::{Recognizer, RecognizerFactory, TranscriptResult, WordResult};
use crate::transcription::language::{LanguageCatalog, LanguageTag};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Build a transcript from `(word, confidence)` pairs.
pub fn transcript(words: &[(&str, f64)]) -> TranscriptResult {
    TranscriptResult {
        full_text: words.iter().map(|(w, _)| *w).collect::<Vec<_>>().join(" "),
        words: words
            .iter()
            .map(|(w, c)| WordResult {
                text: w.to_string(),
                confidence: *c,
            })
            .collect(),
    }
}

#[derive(Default)]
struct ScriptState {
    results: VecDeque<Result<TranscriptResult, String>>,
    fail_accept: bool,
    fail_create: bool,
    created: Vec<LanguageTag>,
    accepted: Vec<usize>,
    units_at_final: Vec<usize>,
    resets: usize,
}

/// Shared handle that scripts and observes every mock recognizer built from it.
#[derive(Clone, Default)]
pub struct MockScript {
    inner: Arc<Mutex<ScriptState>>,
}

impl MockScript {
    /// Queue the outcome of the next `final_result` call. Once the queue is
    /// empty, recognizers report an empty transcript.
    pub fn push_result(&self, result: Result<TranscriptResult, String>) {
        self.inner.lock().unwrap().results.push_back(result);
    }

    pub fn fail_accept(&self, fail: bool) {
        self.inner.lock().unwrap().fail_accept = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create = fail;
    }

    pub fn created(&self) -> Vec<LanguageTag> {
        self.inner.lock().unwrap().created.clone()
    }

    /// Byte length of every accepted waveform, in order.
    pub fn accepted(&self) -> Vec<usize> {
        self.inner.lock().unwrap().accepted.clone()
    }

    /// Units accepted since the last reset, sampled at each `final_result`.
    pub fn units_at_final(&self) -> Vec<usize> {
        self.inner.lock().unwrap().units_at_final.clone()
    }

    pub fn resets(&self) -> usize {
        self.inner.lock().unwrap().resets
    }
}

pub struct MockRecognizer {
    script: MockScript,
    pending: usize,
}

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn accept_waveform(&mut self, pcm: &[u8]) -> Result<()> {
        let mut state = self.script.inner.lock().unwrap();
        if state.fail_accept {
            return Err(anyhow!("mock recognizer rejected audio"));
        }
        state.accepted.push(pcm.len());
        self.pending += 1;
        Ok(())
    }

    async fn final_result(&mut self) -> Result<TranscriptResult> {
        let mut state = self.script.inner.lock().unwrap();
        state.units_at_final.push(self.pending);
        match state.results.pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(TranscriptResult::default()),
        }
    }

    async fn reset(&mut self) -> Result<()> {
        self.script.inner.lock().unwrap().resets += 1;
        self.pending = 0;
        Ok(())
    }
}

pub struct MockRecognizerFactory {
    script: MockScript,
}

impl MockRecognizerFactory {
    pub fn new(script: MockScript) -> Self {
        Self { script }
    }
}

#[async_trait]
impl RecognizerFactory for MockRecognizerFactory {
    async fn create(&self, language: &LanguageTag) -> Result<Box<dyn Recognizer>> {
        let mut state = self.script.inner.lock().unwrap();
        if state.fail_create {
            return Err(anyhow!("no model for {}", language));
        }
        state.created.push(language.clone());
        Ok(Box::new(MockRecognizer {
            script: self.script.clone(),
            pending: 0,
        }))
    }
}

/// Catalog with a fixed language list.
pub struct StaticCatalog(pub Vec<&'static str>);

#[async_trait]
impl LanguageCatalog for StaticCatalog {
    async fn fetch(&self) -> Result<HashSet<LanguageTag>> {
        Ok(self.0.iter().map(|t| LanguageTag::new(*t)).collect())
    }
}

/// Pass-through suppressor whose first calls fail.
struct FailingSuppressor {
    remaining_failures: Arc<AtomicUsize>,
}

impl NoiseSuppressor for FailingSuppressor {
    fn suppress(&mut self, unit: &PcmUnit) -> Result<PcmUnit> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("mock suppressor failed"));
        }
        Ok(unit.clone())
    }
}

/// Suppressors that fail the first `failures` calls, counted across every
/// suppressor the factory builds.
pub fn failing_denoisers(failures: usize) -> DenoiserFactory {
    let remaining_failures = Arc::new(AtomicUsize::new(failures));
    Arc::new(move || {
        Box::new(FailingSuppressor {
            remaining_failures: remaining_failures.clone(),
        }) as Box<dyn NoiseSuppressor>
    })
}
