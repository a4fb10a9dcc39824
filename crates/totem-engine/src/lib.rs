//! Remote-inference invocation layer and the pipelines it drives: image
//! preprocessing, photo analysis, derived spirit-image generation with an
//! HTTP fallback renderer, follow-up chat, and the workflow controller that
//! sequences them.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use totem_contracts::chat::{Transcript, ANSWER_FALLBACK};
use totem_contracts::config::EngineConfig;
use totem_contracts::errors::{classify_failure, ErrorClassification, TotemError};
use totem_contracts::events::{SessionEvent, SessionEventLog};
use totem_contracts::workflow::{AnalysisResult, Phase, SpiritRecord, WorkflowState};

pub use totem_contracts::chat::{ChatMessage, Sender};
pub use totem_contracts::workflow::SpiritStatus;

const REQUEST_TIMEOUT_S: u64 = 90;
const DESCRIPTION_EXCERPT_CHARS: usize = 1000;
const PROMPT_FALLBACK_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Transport

/// Raw HTTP exchange result, before any classification.
#[derive(Debug, Clone)]
pub struct WireReply {
    pub status: u16,
    pub body: String,
}

/// A failure below the HTTP layer: no status code, no body. `retryable`
/// distinguishes timeouts and refused connections from everything else.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub message: String,
    pub retryable: bool,
}

/// Wire-level access to the inference endpoint and the fallback image
/// service. Implemented over HTTP for real use, scripted in tests, and by
/// the offline dryrun transport.
pub trait RemoteTransport: Send + Sync {
    fn post_json(
        &self,
        endpoint: &str,
        credential: &str,
        payload: &Value,
    ) -> Result<WireReply, TransportFailure>;

    fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, TransportFailure>;
}

pub struct HttpTransport {
    http: HttpClient,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_S),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTransport for HttpTransport {
    fn post_json(
        &self,
        endpoint: &str,
        credential: &str,
        payload: &Value,
    ) -> Result<WireReply, TransportFailure> {
        let response = self
            .http
            .post(endpoint)
            .query(&[("key", credential)])
            .timeout(self.timeout)
            .json(payload)
            .send()
            .map_err(transport_failure)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(transport_failure)?;
        Ok(WireReply { status, body })
    }

    fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, TransportFailure> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .map_err(transport_failure)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(TransportFailure {
                message: format!("image service returned HTTP {status}"),
                retryable: false,
            });
        }
        let bytes = response.bytes().map_err(transport_failure)?;
        Ok(bytes.to_vec())
    }
}

fn transport_failure(err: reqwest::Error) -> TransportFailure {
    TransportFailure {
        retryable: err.is_timeout() || err.is_connect() || err.is_request(),
        message: err.to_string(),
    }
}

/// Offline transport: deterministic reading text and a solid-color JPEG
/// derived from a SHA-256 of the request, so the whole workflow runs without
/// a credential or network.
pub struct DryrunTransport;

impl RemoteTransport for DryrunTransport {
    fn post_json(
        &self,
        _endpoint: &str,
        _credential: &str,
        payload: &Value,
    ) -> Result<WireReply, TransportFailure> {
        let body = json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": dryrun_reply_text(payload) }]
                }
            }]
        });
        Ok(WireReply {
            status: 200,
            body: body.to_string(),
        })
    }

    fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, TransportFailure> {
        let digest = Sha256::digest(url.as_bytes());
        let mut canvas = RgbImage::new(64, 64);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([digest[0], digest[1], digest[2]]);
        }
        let mut bytes = Vec::new();
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut bytes), 80);
        canvas.write_with_encoder(encoder).map_err(|err| TransportFailure {
            message: err.to_string(),
            retryable: false,
        })?;
        Ok(bytes)
    }
}

fn dryrun_reply_text(payload: &Value) -> String {
    let prompt = first_request_text(payload);
    let digest = Sha256::digest(prompt.as_bytes());
    let sigil = hex::encode(&digest[..4]);
    if prompt.contains("guardian entity") {
        let names = ["Emberwatch", "Silverbough", "Duskmantle", "Brightwater"];
        let name = names[digest[0] as usize % names.len()];
        return format!(
            "a luminous guardian animal marked with the sigil {sigil}, soft painted light ({name})"
        );
    }
    format!(
        "## First Impressions\nA calm, watchful presence carrying the sigil {sigil}.\n\n\
         ## Temperament\nSteady and deliberate, with flashes of play.\n\n\
         ## Hidden Depths\nAn old patience sits behind the eyes.\n\n\
         ## Guidance\nKeep the evening walks; they matter more than they look."
    )
}

fn first_request_text(payload: &Value) -> String {
    payload
        .get("contents")
        .and_then(Value::as_array)
        .and_then(|contents| contents.first())
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("\n")
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Resilient invoker

/// Which remote model a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Conversational/analysis model, `:generateContent`.
    Generate,
    /// Dedicated image-generation model, `:predict`.
    Predict,
}

impl EndpointKind {
    fn action(self) -> &'static str {
        match self {
            EndpointKind::Generate => "generateContent",
            EndpointKind::Predict => "predict",
        }
    }
}

/// One logical call: the payload plus the retry posture it starts with.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub payload: Value,
    pub endpoint_kind: EndpointKind,
    pub retry_budget: u32,
    pub backoff_delay_ms: u64,
}

type SleepFn = Box<dyn Fn(Duration) + Send + Sync>;
type QuotaHook = Box<dyn Fn(&str) + Send + Sync>;
type RetryHook = Box<dyn Fn(u64) + Send + Sync>;

/// Issues requests against the inference endpoint with budgeted retry on
/// transient rate limits and terminal classification of everything else.
///
/// Rate-limit retry is silent and budgeted; quota and billing failures are
/// terminal and never retried, so a call that cannot succeed within the
/// current billing period is not hammered.
pub struct ResilientInvoker {
    config: EngineConfig,
    credential: Option<String>,
    transport: Box<dyn RemoteTransport>,
    sleep: SleepFn,
    on_quota_exhausted: Option<QuotaHook>,
    on_retry: Option<RetryHook>,
}

impl ResilientInvoker {
    pub fn new(
        config: EngineConfig,
        credential: Option<String>,
        transport: Box<dyn RemoteTransport>,
    ) -> Self {
        Self {
            config,
            credential: credential
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            transport,
            sleep: Box::new(thread::sleep),
            on_quota_exhausted: None,
            on_retry: None,
        }
    }

    /// Replaces the backoff sleep. Tests record the schedule instead of
    /// waiting it out.
    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn with_quota_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_quota_exhausted = Some(Box::new(hook));
        self
    }

    /// Observes every scheduled backoff with its delay in milliseconds,
    /// before the suspension happens.
    pub fn with_retry_hook(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn generate_request(&self, payload: Value) -> InvocationRequest {
        InvocationRequest {
            payload,
            endpoint_kind: EndpointKind::Generate,
            retry_budget: self.config.generate_retry_budget,
            backoff_delay_ms: self.config.backoff_base_ms,
        }
    }

    pub fn predict_request(&self, payload: Value) -> InvocationRequest {
        InvocationRequest {
            payload,
            endpoint_kind: EndpointKind::Predict,
            retry_budget: self.config.predict_retry_budget,
            backoff_delay_ms: self.config.backoff_base_ms,
        }
    }

    pub fn endpoint_for(&self, kind: EndpointKind) -> String {
        let model = match kind {
            EndpointKind::Generate => self.config.analysis_model.as_str(),
            EndpointKind::Predict => self.config.image_model.as_str(),
        };
        format!("{}/{}:{}", self.config.api_base, model, kind.action())
    }

    /// Runs the call to completion: returns the parsed success body, or a
    /// terminal `TotemError` once the retry budget cannot absorb the failure.
    pub fn invoke(&self, request: InvocationRequest) -> Result<Value, TotemError> {
        let credential = self
            .credential
            .as_deref()
            .ok_or(TotemError::MissingCredential)?;
        let endpoint = self.endpoint_for(request.endpoint_kind);
        let mut remaining = request.retry_budget;
        let mut delay_ms = request.backoff_delay_ms;

        loop {
            match self.transport.post_json(&endpoint, credential, &request.payload) {
                Ok(reply) if (200..300).contains(&reply.status) => {
                    return serde_json::from_str(&reply.body)
                        .map_err(|_| TotemError::Remote("endpoint returned invalid JSON".into()));
                }
                Ok(reply) => {
                    let message = extract_error_message(&reply.body, reply.status);
                    match classify_failure(reply.status, &message) {
                        ErrorClassification::TransientRateLimit if remaining > 0 => {
                            self.backoff(delay_ms);
                            remaining -= 1;
                            delay_ms *= 2;
                        }
                        // A rate-limit status with no budget left is a spent
                        // allowance: handled through the quota path.
                        ErrorClassification::TransientRateLimit
                        | ErrorClassification::QuotaExhausted => {
                            if let Some(hook) = &self.on_quota_exhausted {
                                hook(&message);
                            }
                            return Err(TotemError::QuotaExhausted(message));
                        }
                        ErrorClassification::BillingRequired => {
                            return Err(TotemError::BillingRequired(message));
                        }
                        ErrorClassification::Generic(raw) => {
                            return Err(TotemError::Remote(raw));
                        }
                    }
                }
                Err(failure) if failure.retryable && remaining > 0 => {
                    self.backoff(delay_ms);
                    remaining -= 1;
                    delay_ms *= 2;
                }
                Err(failure) => {
                    return Err(TotemError::NetworkFailure(failure.message));
                }
            }
        }
    }

    fn backoff(&self, delay_ms: u64) {
        if let Some(hook) = &self.on_retry {
            hook(delay_ms);
        }
        (self.sleep)(Duration::from_millis(delay_ms));
    }

    /// Unauthenticated GET against a public service; no retry, no backoff.
    pub fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, TotemError> {
        self.transport
            .fetch_binary(url)
            .map_err(|failure| TotemError::NetworkFailure(failure.message))
    }
}

/// The delays a fresh request would sleep through if every attempt were rate
/// limited: `base, base*2, base*4, ...`, one entry per unit of budget.
pub fn backoff_schedule(base_ms: u64, budget: u32) -> Vec<u64> {
    (0..budget).map(|step| base_ms << step).collect()
}

fn extract_error_message(body: &str, status: u16) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| {
            parsed
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {status}: {}", truncate_text(body, 256)))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

// ---------------------------------------------------------------------------
// Image preprocessing

/// A user photo normalized for upload: bounded dimensions, JPEG, base64.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub encoded_payload: String,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
}

/// Decodes an arbitrary image, downscales so the longer edge fits
/// `max_image_dimension` (aspect preserved, never upscaled), and re-encodes
/// as JPEG at the configured quality to bound the payload size.
pub fn prepare_image(bytes: &[u8], config: &EngineConfig) -> Result<ImageAsset, TotemError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| TotemError::InvalidInput(err.to_string()))?;
    let (width, height) = (decoded.width(), decoded.height());
    let longer = width.max(height);

    let resized = if longer > config.max_image_dimension {
        let scale = config.max_image_dimension as f64 / longer as f64;
        let new_width = ((width as f64 * scale).round() as u32).max(1);
        let new_height = ((height as f64 * scale).round() as u32).max(1);
        decoded.resize_exact(new_width, new_height, FilterType::Lanczos3)
    } else {
        decoded
    };

    let rgb = resized.to_rgb8();
    let mut encoded = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut encoded), config.jpeg_quality);
    rgb.write_with_encoder(encoder)
        .map_err(|err| TotemError::EncodingFailure(err.to_string()))?;

    Ok(ImageAsset {
        encoded_payload: BASE64.encode(&encoded),
        mime_type: "image/jpeg".to_string(),
        width: rgb.width(),
        height: rgb.height(),
    })
}

// ---------------------------------------------------------------------------
// Analysis pipeline

fn report_prompt(subject_name: &str) -> String {
    format!(
        "You are a warm, perceptive animal spiritualist. Study the photograph of {subject_name} \
         and write their reading as markdown with exactly these four sections: \
         \"## First Impressions\", \"## Temperament\", \"## Hidden Depths\", \"## Guidance\". \
         Open the reading with the personalized address \"Dearest {subject_name},\" before the \
         first section. Keep each section to a short paragraph."
    )
}

/// Builds and executes the primary multimodal analysis call.
pub fn analyze(
    invoker: &ResilientInvoker,
    image: &ImageAsset,
    subject_name: &str,
) -> Result<AnalysisResult, TotemError> {
    let payload = json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": report_prompt(subject_name) },
                {
                    "inlineData": {
                        "mimeType": image.mime_type,
                        "data": image.encoded_payload,
                    }
                },
            ],
        }],
    });
    let response = invoker.invoke(invoker.generate_request(payload))?;
    let text = first_candidate_text(&response).ok_or(TotemError::EmptyResult)?;
    Ok(AnalysisResult {
        text,
        subject_name: subject_name.to_string(),
    })
}

fn first_candidate_text(response: &Value) -> Option<String> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|text| !text.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Derived asset pipeline

fn describe_prompt(excerpt: &str) -> String {
    format!(
        "From the reading below, name a symbolic guardian entity for the subject and give a \
         short image-generation prompt for it. Reply with the image prompt followed by the \
         entity's name in parentheses, like: a silver fox wreathed in river mist (Silverfang).\n\n\
         Reading:\n{excerpt}"
    )
}

/// Splits the description-stage reply on the first `(`: prompt before, display
/// name inside the parenthetical. Missing or empty name falls back to the
/// configured placeholder.
pub fn parse_spirit_description(text: &str, placeholder: &str) -> (String, String) {
    match text.split_once('(') {
        Some((before, rest)) => {
            let name = rest
                .split_once(')')
                .map(|(inner, _)| inner.trim().to_string())
                .filter(|inner| !inner.is_empty())
                .unwrap_or_else(|| placeholder.to_string());
            (before.trim().to_string(), name)
        }
        None => (text.trim().to_string(), placeholder.to_string()),
    }
}

fn spirit_render_url(config: &EngineConfig, prompt: &str, seed: i64) -> Result<String, TotemError> {
    let stylized = format!("{prompt}, ethereal guardian spirit, luminous painterly style");
    let mut url = reqwest::Url::parse(&config.fallback_image_base)
        .map_err(|err| TotemError::Remote(format!("bad fallback image base: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| TotemError::Remote("fallback image base cannot carry a path".into()))?
        .push(&stylized);
    url.query_pairs_mut()
        .append_pair("width", &config.spirit_image_size.to_string())
        .append_pair("height", &config.spirit_image_size.to_string())
        .append_pair("seed", &seed.to_string())
        .append_pair("nologo", "true");
    Ok(url.to_string())
}

/// Two-stage summoning: derive an image prompt and display name from the
/// reading, then render through the fallback image service. Returns base64
/// JPEG data and the caption. Neither stage is retried as a sequence.
pub fn summon_spirit(
    invoker: &ResilientInvoker,
    analysis: &AnalysisResult,
) -> Result<(String, String), TotemError> {
    let excerpt: String = analysis.text.chars().take(DESCRIPTION_EXCERPT_CHARS).collect();
    let payload = json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": describe_prompt(&excerpt) }],
        }],
    });
    let response = invoker.invoke(invoker.generate_request(payload))?;
    let text = first_candidate_text(&response).ok_or(TotemError::EmptyResult)?;
    let (prompt, display_name) =
        parse_spirit_description(&text, &invoker.config().spirit_name_placeholder);

    // Unusable description: render from the opening of the reading instead.
    let prompt_source = if prompt.is_empty() {
        analysis.text.chars().take(PROMPT_FALLBACK_CHARS).collect()
    } else {
        prompt
    };

    let seed = chrono::Utc::now().timestamp_millis();
    let url = spirit_render_url(invoker.config(), &prompt_source, seed)?;
    let bytes = invoker.fetch_binary(&url)?;
    Ok((BASE64.encode(bytes), display_name))
}

// ---------------------------------------------------------------------------
// Chat session

fn follow_up_prompt(analysis: &AnalysisResult, question: &str) -> String {
    format!(
        "You are the spiritualist who wrote the reading below for {subject}. Answer the \
         follow-up question briefly and kindly, grounded in the reading.\n\n\
         Reading:\n{reading}\n\nQuestion: {question}",
        subject = analysis.subject_name,
        reading = analysis.text,
    )
}

/// How one `ask` call concluded.
#[derive(Debug, PartialEq)]
pub enum ChatOutcome {
    /// Placeholder replaced with the model's answer.
    Answered,
    /// Placeholder replaced with the fixed fallback line; carries the failure.
    FallbackUsed(TotemError),
    /// Blank question; the transcript was not touched.
    Ignored,
}

/// Appends the question and a thinking placeholder synchronously, then asks
/// the model. The placeholder is always resolved in place, with the answer or
/// the fallback line; the transcript grows by exactly two either way.
pub fn ask(
    invoker: &ResilientInvoker,
    transcript: &mut Transcript,
    analysis: &AnalysisResult,
    question: &str,
) -> Result<ChatOutcome, TotemError> {
    let question = question.trim();
    if question.is_empty() {
        return Ok(ChatOutcome::Ignored);
    }
    transcript.begin_turn(question)?;

    let payload = json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": follow_up_prompt(analysis, question) }],
        }],
    });
    let answer = invoker
        .invoke(invoker.generate_request(payload))
        .and_then(|response| first_candidate_text(&response).ok_or(TotemError::EmptyResult));
    match answer {
        Ok(text) => {
            transcript.resolve_turn(text);
            Ok(ChatOutcome::Answered)
        }
        Err(err) => {
            transcript.resolve_turn(ANSWER_FALLBACK);
            Ok(ChatOutcome::FallbackUsed(err))
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow controller

const IDLE_GREETING: &str = "No reading yet. Offer a photograph to begin.";

fn greeting_for(subject_name: &str) -> String {
    format!("The reading for {subject_name} is complete. Ask what you wish to know.")
}

/// Read-only snapshot for the presentation layer.
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    pub phase: Phase,
    pub analysis: Option<AnalysisResult>,
    pub spirit: SpiritRecord,
    pub transcript: Vec<ChatMessage>,
    pub notice: Option<String>,
    pub quota_notice: Option<String>,
    pub billing_notice: Option<String>,
}

/// Owns every session entity and sequences the pipelines. One analysis run,
/// one summoning, and one chat turn at a time, enforced by construction.
pub struct WorkflowController {
    invoker: ResilientInvoker,
    state: WorkflowState,
    transcript: Transcript,
    events: SessionEventLog,
    notice: Option<String>,
    quota_notice: Arc<Mutex<Option<String>>>,
    billing_notice: Option<String>,
}

impl WorkflowController {
    pub fn new(
        config: EngineConfig,
        credential: Option<String>,
        transport: Box<dyn RemoteTransport>,
        events: SessionEventLog,
    ) -> Self {
        let quota_notice = Arc::new(Mutex::new(None));
        let hook_notice = Arc::clone(&quota_notice);
        let quota_events = events.clone();
        let retry_events = events.clone();
        let invoker = ResilientInvoker::new(config, credential, transport)
            .with_quota_hook(move |message| {
                if let Ok(mut slot) = hook_notice.lock() {
                    *slot = Some(message.to_string());
                }
                log_event(
                    &quota_events,
                    SessionEvent::QuotaNotice {
                        message: message.to_string(),
                    },
                );
            })
            .with_retry_hook(move |delay_ms| {
                log_event(&retry_events, SessionEvent::RetryScheduled { delay_ms });
            });
        Self {
            invoker,
            state: WorkflowState::new(),
            transcript: Transcript::new(IDLE_GREETING),
            events,
            notice: None,
            quota_notice,
            billing_notice: None,
        }
    }

    /// `Input`/`Result` -> `Loading` -> `Result` on success, back to `Input`
    /// on failure. Rejected while a run is already loading.
    pub fn start(&mut self, image_bytes: &[u8], subject_name: &str) -> Result<(), TotemError> {
        let subject = subject_name.trim();
        if subject.is_empty() {
            return Err(TotemError::Rejected("a subject name is required"));
        }
        self.state.begin_analysis()?;
        self.notice = None;
        self.emit_phase();

        let run = prepare_image(image_bytes, self.invoker.config())
            .and_then(|asset| analyze(&self.invoker, &asset, subject));
        match run {
            Ok(result) => {
                self.transcript.reset(greeting_for(subject));
                self.state.complete_analysis(result);
                self.emit_phase();
                self.emit(SessionEvent::AnalysisCompleted {
                    subject: subject.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                self.state.fail_analysis();
                self.record_failure(&err);
                self.emit_phase();
                self.emit(SessionEvent::AnalysisFailed {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Derives and renders the guardian image for the stored reading. Only
    /// reachable in `Result`; failure puts the spirit back to `Idle`.
    pub fn summon_spirit(&mut self) -> Result<(), TotemError> {
        let analysis = self.state.begin_spirit()?.clone();
        self.emit_spirit();
        match summon_spirit(&self.invoker, &analysis) {
            Ok((image_data, caption)) => {
                self.state.complete_spirit(image_data, caption);
                self.emit_spirit();
                Ok(())
            }
            Err(err) => {
                self.state.fail_spirit();
                self.record_failure(&err);
                self.emit_spirit();
                Err(err)
            }
        }
    }

    /// Follow-up question against the stored reading. No-op without a reading
    /// or with a blank question; rejected while a turn is pending.
    pub fn ask(&mut self, question: &str) -> Result<ChatOutcome, TotemError> {
        let Some(analysis) = self.state.analysis() else {
            return Ok(ChatOutcome::Ignored);
        };
        let outcome = ask(&self.invoker, &mut self.transcript, analysis, question)?;
        if let ChatOutcome::FallbackUsed(err) = &outcome {
            self.record_failure(err);
        }
        if outcome != ChatOutcome::Ignored {
            self.emit(SessionEvent::ChatTurn {
                messages: self.transcript.len(),
            });
        }
        Ok(outcome)
    }

    /// Clears every entity and returns to `Input`, from any phase.
    pub fn reset(&mut self) {
        self.state.reset();
        self.transcript.reset(IDLE_GREETING);
        self.notice = None;
        self.billing_notice = None;
        if let Ok(mut slot) = self.quota_notice.lock() {
            *slot = None;
        }
        self.emit(SessionEvent::SessionReset);
        self.emit_phase();
    }

    pub fn status(&self) -> WorkflowStatus {
        WorkflowStatus {
            phase: self.state.phase(),
            analysis: self.state.analysis().cloned(),
            spirit: self.state.spirit().clone(),
            transcript: self.transcript.messages().to_vec(),
            notice: self.notice.clone(),
            quota_notice: self.quota_notice.lock().ok().and_then(|slot| slot.clone()),
            billing_notice: self.billing_notice.clone(),
        }
    }

    /// Billing failures raise the persistent notice alongside the transient
    /// one, mirroring how the quota hook fills its slot.
    fn record_failure(&mut self, err: &TotemError) {
        if let TotemError::BillingRequired(message) = err {
            self.billing_notice = Some(message.clone());
            self.emit(SessionEvent::BillingNotice {
                message: message.clone(),
            });
        }
        self.notice = Some(err.to_string());
    }

    fn emit_phase(&self) {
        self.emit(SessionEvent::PhaseChanged {
            phase: self.state.phase(),
        });
    }

    fn emit_spirit(&self) {
        let spirit = self.state.spirit();
        self.emit(SessionEvent::SpiritStatus {
            status: spirit.status,
            caption: spirit.caption.clone(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        log_event(&self.events, event);
    }
}

// A broken event log should not take the session down with it.
fn log_event(events: &SessionEventLog, event: SessionEvent) {
    if let Err(err) = events.emit(&event) {
        eprintln!("totem: event log write failed: {err:#}");
    }
}
