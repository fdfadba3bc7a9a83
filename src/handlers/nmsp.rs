//! # NMSP Recognition Endpoint
//!
//! `POST /NmspServlet/` is the whole service as far as the dictation client is
//! concerned. Per request:
//!
//! 1. Derive the language from the Host header and `select` it
//! 2. Parse the body into frames and drop preamble and button-click frames
//! 3. Check out a session for the language, run the audio pipeline, release the session
//! 4. Render the outcome as an NMSP multipart reply
//!
//! Recognition failures are not HTTP failures: the client gets a 200 with a
//! `QueryRetry` payload. Only a request we cannot read at all (no boundary,
//! broken, stalled or oversized body) is answered with an error status.
//!
//! The language comes from the `Host` header the client sent. Forwarding
//! headers are ignored, so they cannot pick a language.

use crate::audio::frames::{trim_device_artifacts, Boundary, FrameStream, FrameStreamError, RawFrame};
use crate::audio::pipeline::PipelineOutput;
use crate::audio::processor::PcmUnit;
use crate::error::{AppError, AppResult};
use crate::protocol::{self, ProtocolOutcome};
use crate::state::AppState;
use crate::transcription::language::LanguageTag;
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use futures_util::{Stream, StreamExt};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub async fn recognize(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let boundary = Boundary::from_content_type(content_type).ok_or_else(|| {
        AppError::BadRequest(format!(
            "Content-Type '{}' does not carry a boundary",
            content_type
        ))
    })?;

    let host = request_host(&req);
    let requested = LanguageTag::from_host(&host);
    let language = state.sessions.select(&requested).await;

    let audio = &state.config.audio;
    let frames = FrameStream::new(payload, boundary, audio.max_upload_bytes);
    let frames = collect_frames(frames, state.config.read_timeout(), audio.max_frames).await?;
    let received = frames.len();
    let frames = trim_device_artifacts(frames);

    debug!(
        request_id = %request_id,
        host = %host,
        requested_language = %requested,
        frames_received = received,
        frames_kept = frames.len(),
        audio_bytes = frames.iter().map(|f| f.as_bytes().len()).sum::<usize>(),
        "Upload parsed"
    );

    let output = match &language {
        Some(language) => run_recognition(&state, language, &frames).await,
        None => {
            warn!(request_id = %request_id, requested_language = %requested, "No language is active");
            PipelineOutput {
                outcome: ProtocolOutcome::DecodeError,
                recording: None,
                frames_processed: 0,
            }
        }
    };

    state.record_outcome(&output.outcome, output.frames_processed);
    if let (Some(language), Some(recording)) = (&language, output.recording) {
        save_recording(&state, recording, &output.outcome, language).await;
    }

    info!(
        request_id = %request_id,
        language = ?language.as_ref().map(|l| l.as_str()),
        outcome = output.outcome.label(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Recognition request finished"
    );

    let response = protocol::render(&output.outcome)?;
    Ok(HttpResponse::Ok()
        .content_type(response.content_type)
        .body(response.body))
}

/// `Host` header as sent by the client, or the URI authority for HTTP/2.
fn request_host(req: &HttpRequest) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default()
        .to_string()
}

/// Drain the frame stream.
///
/// Gives up when the next frame does not arrive within `read_timeout`, or when
/// more than `max_frames` frames arrive.
async fn collect_frames<S>(
    mut frames: S,
    read_timeout: Duration,
    max_frames: usize,
) -> AppResult<Vec<RawFrame>>
where
    S: Stream<Item = Result<RawFrame, FrameStreamError>> + Unpin,
{
    let mut collected = Vec::new();

    loop {
        match tokio::time::timeout(read_timeout, frames.next()).await {
            Ok(Some(Ok(frame))) => {
                if collected.len() == max_frames {
                    return Err(AppError::PayloadTooLarge(format!(
                        "Upload has more than {} frames",
                        max_frames
                    )));
                }
                collected.push(frame);
            }
            Ok(Some(Err(e @ FrameStreamError::TooLarge { .. }))) => {
                return Err(AppError::PayloadTooLarge(e.to_string()))
            }
            Ok(Some(Err(e))) => return Err(AppError::BadRequest(e.to_string())),
            Ok(None) => return Ok(collected),
            Err(_) => {
                return Err(AppError::Timeout(format!(
                    "Upload stalled for {}s after {} frames",
                    read_timeout.as_secs(),
                    collected.len()
                )))
            }
        }
    }
}

/// Check out a session, run the pipeline on it and hand it back.
///
/// Failing to get a session is a recognition failure, not a request failure.
async fn run_recognition(state: &AppState, language: &LanguageTag, frames: &[RawFrame]) -> PipelineOutput {
    let mut lease = match state.sessions.acquire(language).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(language = %language, error = %format!("{:#}", e), "No recognition session available");
            return PipelineOutput {
                outcome: ProtocolOutcome::DecodeError,
                recording: None,
                frames_processed: 0,
            };
        }
    };

    let output = state
        .pipeline
        .run(&mut lease, frames, state.recordings.is_some())
        .await;
    state.sessions.release(lease).await;
    output
}

async fn save_recording(
    state: &AppState,
    recording: PcmUnit,
    outcome: &ProtocolOutcome,
    language: &LanguageTag,
) {
    let Some(store) = state.recordings.clone() else {
        return;
    };
    let transcript = match outcome {
        ProtocolOutcome::Success(transcript) => Some(transcript.full_text.clone()),
        _ => None,
    };
    let language = language.clone();
    let recorded_at = chrono::Local::now();

    let saved = web::block(move || {
        store.save(&recording, transcript.as_deref(), &language, recorded_at)
    })
    .await;

    match saved {
        Ok(Ok(path)) => debug!(path = %path.display(), "Recording captured"),
        Ok(Err(e)) => warn!(error = %format!("{:#}", e), "Unable to write recording"),
        Err(e) => warn!(error = %e, "Recording task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::samples_to_pcm_bytes;
    use crate::config::AppConfig;
    use crate::protocol::response::response_content_type;
    use crate::recordings::RecordingStore;
    use crate::state::test_support::{mock_state, mock_state_with_denoisers};
    use crate::transcription::testing::{failing_denoisers, transcript, MockScript};
    use actix_web::{test, App};
    use futures_util::stream;

    const TOKEN: &str = "sep1234";

    /// An upload of three preamble parts followed by `audio` parts.
    fn upload(audio: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        let preamble = [b"{\"cmd\":\"start\"}".to_vec(), b"{}".to_vec(), b"{}".to_vec()];
        for part in preamble.iter().chain(audio.iter()) {
            body.extend_from_slice(format!("--{}\r\nContent-Type: application/octet-stream\r\n\r\n", TOKEN).as_bytes());
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", TOKEN).as_bytes());
        body
    }

    fn audio_frame(value: i16) -> Vec<u8> {
        samples_to_pcm_bytes(&[value; 320])
    }

    fn request(host: &str, body: Vec<u8>) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/NmspServlet/")
            .insert_header((header::HOST, host))
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", TOKEN),
            ))
            .set_payload(body)
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .route("/NmspServlet/", web::post().to(recognize)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_success_reply() {
        let script = MockScript::default();
        script.push_result(Ok(transcript(&[("hello", 0.9), ("world", 0.8)])));
        let state = mock_state(AppConfig::default(), &script).await;
        let app = app!(state);

        let body = upload(&[audio_frame(10), audio_frame(20)]);
        let resp = test::call_service(&app, request("en-us.speech.example.net", body).to_request()).await;

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap(),
            response_content_type()
        );
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains("name=\"QueryResult\""));
        assert!(body.contains(
            r#"{"words": [[{"word": "Hello\\*no-space-before", "confidence": "0.9"}, {"word": "world", "confidence": "0.8"}]]}"#
        ));

        assert_eq!(script.accepted(), vec![640, 640]);
        assert_eq!(script.resets(), 1);
        assert_eq!(state.get_metrics_snapshot().recognition.success, 1);
    }

    #[actix_web::test]
    async fn test_empty_transcript_asks_for_retry() {
        let script = MockScript::default();
        let state = mock_state(AppConfig::default(), &script).await;
        let app = app!(state);

        let resp = test::call_service(&app, request("en-us.x", upload(&[audio_frame(1)])).to_request()).await;
        assert!(resp.status().is_success());
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains("Sorry, speech not recognized. Please try again."));
    }

    #[actix_web::test]
    async fn test_missing_boundary_is_bad_request() {
        let state = mock_state(AppConfig::default(), &MockScript::default()).await;
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/NmspServlet/")
            .insert_header((header::CONTENT_TYPE, "application/octet-stream"))
            .set_payload(upload(&[]))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn test_decode_error_then_clean_success() {
        let script = MockScript::default();
        let state = mock_state(AppConfig::default(), &script).await;
        let app = app!(state);

        // Second audio frame has an odd length and cannot be decoded
        let broken = upload(&[audio_frame(5), vec![1, 2, 3]]);
        let resp = test::call_service(&app, request("en-us.x", broken).to_request()).await;
        assert!(resp.status().is_success());
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains("Error while decoding incoming audio."));

        script.push_result(Ok(transcript(&[("again", 0.7)])));
        let good = upload(&[audio_frame(5), audio_frame(6)]);
        let resp = test::call_service(&app, request("en-us.x", good).to_request()).await;
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains(r#"{"word": "Again\\*no-space-before", "confidence": "0.7"}"#));

        // Nothing from the failed request leaked into the second result
        assert_eq!(script.units_at_final(), vec![2]);
        assert_eq!(script.resets(), 2);

        let recognition = state.get_metrics_snapshot().recognition;
        assert_eq!(recognition.decode_error, 1);
        assert_eq!(recognition.success, 1);
    }

    #[actix_web::test]
    async fn test_rejected_waveform_then_clean_success() {
        let script = MockScript::default();
        script.fail_accept(true);
        let state = mock_state(AppConfig::default(), &script).await;
        let app = app!(state);

        let resp = test::call_service(&app, request("en-us.x", upload(&[audio_frame(5)])).to_request()).await;
        assert!(resp.status().is_success());
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains("Error while decoding incoming audio."));
        assert_eq!(script.resets(), 1);

        script.fail_accept(false);
        script.push_result(Ok(transcript(&[("fine", 0.5)])));
        let good = upload(&[audio_frame(5), audio_frame(6)]);
        let resp = test::call_service(&app, request("en-us.x", good).to_request()).await;
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains(r#"{"word": "Fine\\*no-space-before", "confidence": "0.5"}"#));

        assert_eq!(script.accepted(), vec![640, 640]);
        assert_eq!(script.units_at_final(), vec![2]);
        assert_eq!(script.resets(), 2);
    }

    #[actix_web::test]
    async fn test_noise_suppression_failure_then_clean_success() {
        let script = MockScript::default();
        let mut config = AppConfig::default();
        config.audio.noise_suppression = true;
        let state = mock_state_with_denoisers(config, &script, Some(failing_denoisers(1))).await;
        let app = app!(state);

        let resp = test::call_service(&app, request("en-us.x", upload(&[audio_frame(5)])).to_request()).await;
        assert!(resp.status().is_success());
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains("Error while decoding incoming audio."));
        assert!(script.accepted().is_empty());
        assert_eq!(script.resets(), 1);

        script.push_result(Ok(transcript(&[("fine", 0.5)])));
        let resp = test::call_service(&app, request("en-us.x", upload(&[audio_frame(5)])).to_request()).await;
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains("name=\"QueryResult\""));
        assert_eq!(script.accepted(), vec![640]);
        assert_eq!(script.resets(), 2);

        let recognition = state.get_metrics_snapshot().recognition;
        assert_eq!(recognition.decode_error, 1);
        assert_eq!(recognition.success, 1);
    }

    #[actix_web::test]
    async fn test_oversized_upload_is_refused() {
        let script = MockScript::default();
        let mut config = AppConfig::default();
        config.audio.max_upload_bytes = 1024;
        let state = mock_state(config, &script).await;
        let app = app!(state);

        let audio: Vec<Vec<u8>> = (0..4).map(|i| audio_frame(i as i16)).collect();
        let resp = test::call_service(&app, request("en-us.x", upload(&audio)).to_request()).await;
        assert_eq!(resp.status(), 413);
        assert!(script.accepted().is_empty());
    }

    #[actix_web::test]
    async fn test_too_many_frames_is_refused() {
        let script = MockScript::default();
        let mut config = AppConfig::default();
        config.audio.max_frames = 5;
        let state = mock_state(config, &script).await;
        let app = app!(state);

        // 3 preamble + 2 audio frames fit exactly
        let resp = test::call_service(&app, request("en-us.x", upload(&[vec![0; 4], vec![0; 4]])).to_request()).await;
        assert!(resp.status().is_success());

        let resp = test::call_service(&app, request("en-us.x", upload(&vec![vec![0; 4]; 3])).to_request()).await;
        assert_eq!(resp.status(), 413);
        assert_eq!(script.accepted().len(), 2);
    }

    #[actix_web::test]
    async fn test_forwarding_headers_do_not_pick_language() {
        let state = mock_state(AppConfig::default(), &MockScript::default()).await;
        let app = app!(state);

        let req = request("en-us.speech.example.net", upload(&[audio_frame(1)]))
            .insert_header(("x-forwarded-host", "de.speech.example.net"))
            .insert_header(("forwarded", "host=de.speech.example.net"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(state.sessions.active_language().await, Some(LanguageTag::new("en-us")));
    }

    #[actix_web::test]
    async fn test_button_click_frames_are_trimmed() {
        let script = MockScript::default();
        let state = mock_state(AppConfig::default(), &script).await;
        let app = app!(state);

        // 3 preamble + 17 audio = 20 frames on the wire
        let audio: Vec<Vec<u8>> = (0..17).map(|i| audio_frame(i as i16)).collect();
        let resp = test::call_service(&app, request("en-us.x", upload(&audio)).to_request()).await;
        assert!(resp.status().is_success());

        assert_eq!(script.accepted().len(), 2);
        assert_eq!(state.get_metrics_snapshot().recognition.frames_processed, 2);
    }

    #[actix_web::test]
    async fn test_language_follows_host() {
        let script = MockScript::default();
        let state = mock_state(AppConfig::default(), &script).await;
        let app = app!(state);

        let resp = test::call_service(&app, request("de.speech.example.net", upload(&[audio_frame(1)])).to_request()).await;
        assert!(resp.status().is_success());
        assert_eq!(state.sessions.active_language().await, Some(LanguageTag::new("de")));

        // Unknown language: served by the active one
        let resp = test::call_service(&app, request("tlh.speech.example.net", upload(&[audio_frame(1)])).to_request()).await;
        assert!(resp.status().is_success());
        assert_eq!(state.sessions.active_language().await, Some(LanguageTag::new("de")));
        assert_eq!(script.created(), vec![LanguageTag::new("de")]);
    }

    #[actix_web::test]
    async fn test_recognizer_unavailable_is_decode_error() {
        let script = MockScript::default();
        script.fail_create(true);
        let state = mock_state(AppConfig::default(), &script).await;
        let app = app!(state);

        let resp = test::call_service(&app, request("en-us.x", upload(&[audio_frame(1)])).to_request()).await;
        assert!(resp.status().is_success());
        let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
        assert!(body.contains("Error while decoding incoming audio."));
    }

    #[actix_web::test]
    async fn test_debug_capture_writes_recording() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = MockScript::default();
        script.push_result(Ok(transcript(&[("note", 0.6)])));
        let mut state = mock_state(AppConfig::default(), &script).await;
        state.recordings = Some(RecordingStore::open(tmp.path()).unwrap());
        let app = app!(state);

        let resp = test::call_service(&app, request("en-us.x", upload(&[audio_frame(3)])).to_request()).await;
        assert!(resp.status().is_success());

        let entries = state.recordings.as_ref().unwrap().list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].language.as_deref(), Some("en-us"));
        assert_eq!(entries[0].text.as_deref(), Some("note"));
    }

    #[actix_web::test]
    async fn test_stalled_upload_times_out() {
        let frames = stream::pending::<Result<RawFrame, FrameStreamError>>();
        let result = collect_frames(frames, Duration::from_millis(20), 100).await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }

    #[actix_web::test]
    async fn test_timeout_applies_per_frame() {
        // Each frame lands inside the timeout; the whole upload does not.
        let frames = stream::iter(0..4u8).then(|i| async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok::<_, FrameStreamError>(RawFrame::new(vec![i]))
        })
        .boxed();
        let collected = collect_frames(frames, Duration::from_millis(100), 100).await.unwrap();
        assert_eq!(collected.len(), 4);
    }

    #[actix_web::test]
    async fn test_body_read_error_is_bad_request() {
        let body = stream::iter(vec![
            Ok::<_, String>(bytes::Bytes::from_static(b"--sep\r\nA: b\r\n\r\nxx\r\n--sep")),
            Err("connection reset".to_string()),
        ]);
        let frames = FrameStream::new(body, Boundary::from_content_type("x; boundary=sep").unwrap(), 1024);
        let result = collect_frames(frames, Duration::from_secs(1), 100).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }
}
