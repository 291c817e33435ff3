use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use image::{imageops, DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reverie_contracts::accounts::{AccountStore, MailSettings, PollSettings, StyleSettings, TranslationSettings};
use reverie_contracts::errors::WorkflowError;
use reverie_contracts::events::{EventPayload, SessionEventWriter};
use reverie_contracts::quota::{QuotaLedger, EMAIL_COOLDOWN_MINUTES};
use reverie_contracts::session::{
    CandidateImage, GenerationJob, JobStatus, Session, SessionState, DREAM_TEXT_MAX_CHARS,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_LEONARDO_API_BASE: &str = "https://cloud.leonardo.ai/api/rest/v1";
pub const DEFAULT_TRANSLATOR_API_BASE: &str = "https://api.openai.com/v1";

/// Character-reference preprocessor id on the generation service; used when a
/// reference photo should bias the output.
pub const CHARACTER_REFERENCE_PREPROCESSOR: u32 = 133;

const PROMPT_FRAME: &str = "A vivid illustration of this dream: ";
const PROMPT_SUFFIX: &str = "Try to make it fun and interesting!";

pub const THUMBNAIL_MAX_SIZE: (u32, u32) = (300, 300);
pub const THUMBNAIL_OFFSET: (i64, i64) = (10, 10);
pub const THUMBNAIL_BORDER_PX: u32 = 2;

// ---------------------------------------------------------------------------
// Prompt building and translation
// ---------------------------------------------------------------------------

/// Expands the raw dream description into the prompt sent to the generator.
/// Input longer than the session limit is truncated defensively; the UI is
/// expected to have enforced it already.
pub fn build_prompt(raw_text: &str) -> String {
    let text = clamp_chars(raw_text.trim(), DREAM_TEXT_MAX_CHARS);
    let separator = if text.ends_with(['.', '!', '?']) {
        " "
    } else {
        ". "
    };
    format!("{PROMPT_FRAME}{text}{separator}{PROMPT_SUFFIX}")
}

pub trait Translator: Send + Sync {
    fn translate(&self, text: &str) -> Result<String, WorkflowError>;
}

/// Passes text through unchanged. Used when no translation backend is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTranslator;

impl Translator for NoopTranslator {
    fn translate(&self, text: &str) -> Result<String, WorkflowError> {
        Ok(text.to_string())
    }
}

/// Translates prompts through an OpenAI-compatible chat completion endpoint.
pub struct HttpTranslator {
    api_base: String,
    api_key: String,
    model: String,
    target_language: String,
    http: HttpClient,
}

impl HttpTranslator {
    pub fn new(api_key: String, settings: &TranslationSettings) -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_TRANSLATOR_API_BASE.to_string()),
            api_key,
            model: settings.model.clone(),
            target_language: settings.target_language.clone(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env(settings: &TranslationSettings) -> Option<Self> {
        non_empty_env("OPENAI_API_KEY").map(|key| Self::new(key, settings))
    }
}

impl Translator for HttpTranslator {
    fn translate(&self, text: &str) -> Result<String, WorkflowError> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let system = format!(
            "You translate image-generation prompts into {}. Reply with the translation only.",
            self.target_language
        );
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": text},
            ],
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|err| WorkflowError::Translation(format!("request failed: {err}")))?;
        let payload = response_json_or_error("translator", response).map_err(WorkflowError::Translation)?;
        let translated = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| WorkflowError::Translation("empty translation response".to_string()))?;
        Ok(translated.to_string())
    }
}

// ---------------------------------------------------------------------------
// Generation service contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub reference_image_id: Option<String>,
    pub style: StyleSettings,
}

pub trait GenerationClient: Send + Sync {
    fn submit(&self, request: &GenerationRequest) -> Result<String, WorkflowError>;
    fn poll(&self, job_id: &str) -> Result<JobStatus, WorkflowError>;
}

pub trait ReferencePreparer: Send + Sync {
    fn prepare(&self, bytes: &[u8], mime: &str) -> Result<String, WorkflowError>;
}

pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, WorkflowError>;
}

/// HTTP client for the Leonardo-style generation API: submit a job, poll it
/// by id, presign-and-upload reference images, download result URLs.
#[derive(Clone)]
pub struct LeonardoClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl LeonardoClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_base: env::var("LEONARDO_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_LEONARDO_API_BASE.to_string()),
            api_key,
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        non_empty_env("LEONARDO_API_KEY").map(Self::new)
    }

    fn generations_endpoint(&self) -> String {
        format!("{}/generations", self.api_base)
    }

    fn generation_endpoint(&self, job_id: &str) -> String {
        format!("{}/generations/{}", self.api_base, job_id)
    }

    fn init_image_endpoint(&self) -> String {
        format!("{}/init-image", self.api_base)
    }
}

impl GenerationClient for LeonardoClient {
    fn submit(&self, request: &GenerationRequest) -> Result<String, WorkflowError> {
        let payload = generation_payload(request);
        let response = self
            .http
            .post(self.generations_endpoint())
            .bearer_auth(&self.api_key)
            .json(&Value::Object(payload))
            .send()
            .map_err(|err| WorkflowError::Generation(format!("submit request failed: {err}")))?;
        let payload =
            response_json_or_error("generation submit", response).map_err(WorkflowError::Generation)?;
        generation_id_from_payload(&payload)
    }

    fn poll(&self, job_id: &str) -> Result<JobStatus, WorkflowError> {
        let response = self
            .http
            .get(self.generation_endpoint(job_id))
            .bearer_auth(&self.api_key)
            .send()
            .map_err(|err| WorkflowError::Generation(format!("poll request failed: {err}")))?;
        let payload =
            response_json_or_error("generation poll", response).map_err(WorkflowError::Generation)?;
        job_status_from_payload(&payload)
    }
}

impl ReferencePreparer for LeonardoClient {
    fn prepare(&self, bytes: &[u8], mime: &str) -> Result<String, WorkflowError> {
        let extension = extension_for_mime(mime)?;
        let response = self
            .http
            .post(self.init_image_endpoint())
            .bearer_auth(&self.api_key)
            .json(&json!({ "extension": extension }))
            .send()
            .map_err(|err| WorkflowError::Upload(format!("init-image request failed: {err}")))?;
        let payload = response_json_or_error("init-image", response).map_err(WorkflowError::Upload)?;
        let presigned = presigned_upload_from_payload(&payload)?;

        let mut form = MultipartForm::new();
        for (key, value) in &presigned.fields {
            form = form.text(key.clone(), value.clone());
        }
        let part = MultipartPart::bytes(bytes.to_vec())
            .file_name(format!("reference.{extension}"))
            .mime_str(mime)
            .map_err(|err| WorkflowError::Upload(format!("invalid mime type {mime}: {err}")))?;
        form = form.part("file", part);

        let response = self
            .http
            .post(&presigned.url)
            .multipart(form)
            .send()
            .map_err(|err| WorkflowError::Upload(format!("upload request failed: {err}")))?;
        let code = response.status().as_u16();
        if code != 204 {
            return Err(WorkflowError::Upload(format!(
                "upload target answered HTTP {code} instead of 204"
            )));
        }
        Ok(presigned.id)
    }
}

impl ImageFetcher for LeonardoClient {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, WorkflowError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| WorkflowError::Fetch(format!("download failed ({url}): {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkflowError::Fetch(format!(
                "download failed ({url}): HTTP {}",
                status.as_u16()
            )));
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| WorkflowError::Fetch(format!("download body read failed ({url}): {err}")))
    }
}

fn generation_payload(request: &GenerationRequest) -> Map<String, Value> {
    let style = &request.style;
    let mut payload = map_object(json!({
        "prompt": request.prompt,
        "modelId": style.model_id,
        "presetStyle": style.preset_style,
        "photoReal": style.photo_real,
        "photoRealVersion": style.photo_real_version,
        "alchemy": style.alchemy,
        "num_images": style.candidate_count,
        "enhancePrompt": style.enhance_prompt,
    }));
    if let Some(reference_id) = &request.reference_image_id {
        payload.insert(
            "controlnets".to_string(),
            json!([{
                "initImageId": reference_id,
                "initImageType": "UPLOADED",
                "preprocessorId": CHARACTER_REFERENCE_PREPROCESSOR,
                "strengthType": style.reference_strength,
            }]),
        );
    }
    payload
}

fn generation_id_from_payload(payload: &Value) -> Result<String, WorkflowError> {
    payload
        .get("sdGenerationJob")
        .and_then(|job| job.get("generationId"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            WorkflowError::Generation(
                "submit response missing sdGenerationJob.generationId".to_string(),
            )
        })
}

fn job_status_from_payload(payload: &Value) -> Result<JobStatus, WorkflowError> {
    let job = payload
        .get("generations_by_pk")
        .filter(|value| !value.is_null())
        .ok_or_else(|| {
            WorkflowError::Generation("poll response missing generations_by_pk".to_string())
        })?;
    let status = job
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();
    match status.as_str() {
        "COMPLETE" => {
            let result_urls = job
                .get("generated_images")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| row.get("url").and_then(Value::as_str))
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default();
            Ok(JobStatus::Complete { result_urls })
        }
        "FAILED" | "DECLINED" => Ok(JobStatus::Failed { reason: status }),
        _ => Ok(JobStatus::Pending),
    }
}

struct PresignedUpload {
    url: String,
    id: String,
    fields: Vec<(String, String)>,
}

/// The presign response carries the form fields either as a JSON object or as
/// a JSON-encoded string; both shapes occur in the wild.
fn presigned_upload_from_payload(payload: &Value) -> Result<PresignedUpload, WorkflowError> {
    let target = payload.get("uploadInitImage").ok_or_else(|| {
        WorkflowError::Upload("init-image response missing uploadInitImage".to_string())
    })?;
    let url = target
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| WorkflowError::Upload("presigned upload missing url".to_string()))?
        .to_string();
    let id = target
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| WorkflowError::Upload("presigned upload missing id".to_string()))?
        .to_string();
    let fields = match target.get("fields") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => form_fields(map),
        Some(Value::String(raw)) => {
            let parsed: Map<String, Value> = serde_json::from_str(raw).map_err(|_| {
                WorkflowError::Upload("presigned upload fields are not valid JSON".to_string())
            })?;
            form_fields(&parsed)
        }
        Some(other) => {
            return Err(WorkflowError::Upload(format!(
                "unexpected presigned fields payload: {other}"
            )))
        }
    };
    Ok(PresignedUpload { url, id, fields })
}

fn form_fields(map: &Map<String, Value>) -> Vec<(String, String)> {
    map.iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

fn extension_for_mime(mime: &str) -> Result<&'static str, WorkflowError> {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/png" => Ok("png"),
        "image/jpeg" | "image/jpg" => Ok("jpg"),
        other => Err(WorkflowError::UnsupportedFormat(other.to_string())),
    }
}

/// Guesses the mime type for a reference image path from its extension.
pub fn mime_for_path(path: &Path) -> Result<&'static str, WorkflowError> {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "png" => Ok("image/png"),
        "jpg" | "jpeg" => Ok("image/jpeg"),
        other => Err(WorkflowError::UnsupportedFormat(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollProgress {
    pub tick: u64,
    pub elapsed: Duration,
}

/// Polls a job to a terminal state with a bounded total wait. The inter-poll
/// delay is sliced into one-second progress ticks so the caller can animate
/// filler content at its own cadence.
pub fn poll_job(
    client: &dyn GenerationClient,
    job: &mut GenerationJob,
    polling: &PollSettings,
    on_tick: &mut dyn FnMut(PollProgress),
) -> Result<Vec<String>, WorkflowError> {
    let started = Instant::now();
    let mut tick = 0u64;
    loop {
        job.status = client.poll(&job.job_id)?;
        match &job.status {
            JobStatus::Complete { result_urls } => return Ok(result_urls.clone()),
            JobStatus::Failed { reason } => {
                return Err(WorkflowError::Generation(format!(
                    "job {} failed: {reason}",
                    job.job_id
                )))
            }
            JobStatus::Pending => {}
        }
        if started.elapsed().as_secs() >= polling.timeout_secs {
            return Err(WorkflowError::GenerationTimeout {
                elapsed_secs: started.elapsed().as_secs(),
            });
        }
        if polling.interval_secs == 0 {
            on_tick(PollProgress {
                tick,
                elapsed: started.elapsed(),
            });
            tick += 1;
            continue;
        }
        for _ in 0..polling.interval_secs {
            on_tick(PollProgress {
                tick,
                elapsed: started.elapsed(),
            });
            tick += 1;
            thread::sleep(Duration::from_secs(1));
        }
    }
}

// ---------------------------------------------------------------------------
// Image post-processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg,
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, WorkflowError> {
    image::load_from_memory(bytes).map_err(|err| WorkflowError::Decode(err.to_string()))
}

/// Composites a framed thumbnail of the reference photo onto the generated
/// image. The thumbnail is scaled to fit 300x300 preserving aspect ratio,
/// given a 2px opaque border, and alpha-blended near the top-left corner.
/// The main image keeps its dimensions.
pub fn overlay_thumbnail(main: &DynamicImage, thumbnail: &DynamicImage) -> DynamicImage {
    let scaled = thumbnail.thumbnail(THUMBNAIL_MAX_SIZE.0, THUMBNAIL_MAX_SIZE.1);
    let border = THUMBNAIL_BORDER_PX;
    let mut framed = RgbaImage::from_pixel(
        scaled.width() + border * 2,
        scaled.height() + border * 2,
        Rgba([255, 255, 255, 255]),
    );
    imageops::overlay(&mut framed, &scaled.to_rgba8(), border as i64, border as i64);

    let mut base = main.to_rgba8();
    imageops::overlay(&mut base, &framed, THUMBNAIL_OFFSET.0, THUMBNAIL_OFFSET.1);
    DynamicImage::ImageRgba8(base)
}

pub fn serialize_image(image: &DynamicImage, format: OutputFormat) -> Result<Vec<u8>, WorkflowError> {
    let mut buffer = Cursor::new(Vec::new());
    let result = match format {
        OutputFormat::Png => image.write_to(&mut buffer, ImageFormat::Png),
        OutputFormat::Jpeg => {
            DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut buffer, ImageFormat::Jpeg)
        }
    };
    result.map_err(|err| WorkflowError::Encode(err.to_string()))?;
    Ok(buffer.into_inner())
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundDelivery {
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub image_png: Vec<u8>,
}

pub trait Mailer: Send + Sync {
    fn send(&self, delivery: &OutboundDelivery) -> Result<(), WorkflowError>;
}

/// STARTTLS SMTP submission of the selected candidate: UTF-8 plain-text body
/// plus one PNG attachment, fixed recipient, optional Cc.
pub struct SmtpMailer {
    settings: MailSettings,
    password: String,
}

impl SmtpMailer {
    pub fn new(settings: MailSettings, password: String) -> Self {
        Self { settings, password }
    }

    fn build_message(&self, delivery: &OutboundDelivery) -> Result<Message, WorkflowError> {
        let from: Mailbox = self
            .settings
            .from_address
            .parse()
            .map_err(|err| WorkflowError::Delivery(format!("invalid from address: {err}")))?;
        let to: Mailbox = self
            .settings
            .recipient
            .parse()
            .map_err(|err| WorkflowError::Delivery(format!("invalid recipient: {err}")))?;
        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(delivery.subject.clone());
        if let Some(cc) = &self.settings.cc {
            let cc: Mailbox = cc
                .parse()
                .map_err(|err| WorkflowError::Delivery(format!("invalid cc address: {err}")))?;
            builder = builder.cc(cc);
        }
        let png = ContentType::parse("image/png")
            .map_err(|err| WorkflowError::Delivery(format!("attachment content type: {err}")))?;
        let attachment =
            Attachment::new(delivery.attachment_name.clone()).body(delivery.image_png.clone(), png);
        builder
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(delivery.body.clone()))
                    .singlepart(attachment),
            )
            .map_err(|err| WorkflowError::Delivery(format!("message assembly failed: {err}")))
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, delivery: &OutboundDelivery) -> Result<(), WorkflowError> {
        let message = self.build_message(delivery)?;
        let transport = SmtpTransport::starttls_relay(&self.settings.smtp_host)
            .map_err(|err| WorkflowError::Delivery(format!("SMTP relay setup failed: {err}")))?
            .port(self.settings.smtp_port)
            .credentials(Credentials::new(
                self.settings.from_address.clone(),
                self.password.clone(),
            ))
            .build();
        transport
            .send(&message)
            .map(|_| ())
            .map_err(|err| WorkflowError::Delivery(err.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Dryrun collaborators
// ---------------------------------------------------------------------------

/// Offline stand-in for the generation service. Jobs complete immediately and
/// every "download" yields a solid-color image derived from the URL, so the
/// full flow runs without credentials or network.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunStudio;

impl DryrunStudio {
    pub fn new() -> Self {
        Self
    }
}

impl GenerationClient for DryrunStudio {
    fn submit(&self, request: &GenerationRequest) -> Result<String, WorkflowError> {
        let count = request.style.candidate_count.max(1);
        Ok(format!(
            "dryrun-{count}-{}",
            short_id(&request.prompt, count as u64)
        ))
    }

    fn poll(&self, job_id: &str) -> Result<JobStatus, WorkflowError> {
        let parts = job_id
            .strip_prefix("dryrun-")
            .and_then(|tail| tail.split_once('-'));
        let Some((count, stem)) = parts else {
            return Err(WorkflowError::Generation(format!(
                "unknown dryrun job {job_id}"
            )));
        };
        let count: u8 = count
            .parse()
            .map_err(|_| WorkflowError::Generation(format!("unknown dryrun job {job_id}")))?;
        let result_urls = (0..count)
            .map(|index| format!("dryrun://{stem}/{index}"))
            .collect();
        Ok(JobStatus::Complete { result_urls })
    }
}

impl ReferencePreparer for DryrunStudio {
    fn prepare(&self, bytes: &[u8], mime: &str) -> Result<String, WorkflowError> {
        extension_for_mime(mime)?;
        Ok(format!("dryrun-ref-{}", short_id(mime, bytes.len() as u64)))
    }
}

impl ImageFetcher for DryrunStudio {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, WorkflowError> {
        if !url.starts_with("dryrun://") {
            return Err(WorkflowError::Fetch(format!(
                "dryrun fetcher cannot download {url}"
            )));
        }
        let (r, g, b) = color_from_seed(url);
        let image = RgbImage::from_pixel(768, 512, Rgb([r, g, b]));
        serialize_image(&DynamicImage::ImageRgb8(image), OutputFormat::Png)
    }
}

/// Writes deliveries to disk instead of sending them, one text file with the
/// subject and body plus the attachment alongside.
pub struct DryrunMailer {
    out_dir: PathBuf,
}

impl DryrunMailer {
    pub fn new(out_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        Ok(Self { out_dir })
    }
}

impl Mailer for DryrunMailer {
    fn send(&self, delivery: &OutboundDelivery) -> Result<(), WorkflowError> {
        let stamp = timestamp_millis();
        let text_path = self.out_dir.join(format!("email-{stamp}.txt"));
        let image_path = self.out_dir.join(format!("email-{stamp}.png"));
        fs::write(
            &text_path,
            format!("Subject: {}\n\n{}\n", delivery.subject, delivery.body),
        )
        .map_err(|err| WorkflowError::Delivery(format!("failed to write {}: {err}", text_path.display())))?;
        fs::write(&image_path, &delivery.image_png).map_err(|err| {
            WorkflowError::Delivery(format!("failed to write {}: {err}", image_path.display()))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceUpload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

pub struct WorkflowParts {
    pub accounts: AccountStore,
    pub quota: QuotaLedger,
    pub events: SessionEventWriter,
    pub translator: Option<Box<dyn Translator>>,
    pub preparer: Box<dyn ReferencePreparer>,
    pub generator: Box<dyn GenerationClient>,
    pub fetcher: Box<dyn ImageFetcher>,
    pub mailer: Box<dyn Mailer>,
    pub style: StyleSettings,
    pub mail: MailSettings,
    pub polling: PollSettings,
}

/// The session state machine. All collaborators sit behind traits; these
/// methods are the only code that moves a [`Session`] between states.
///
/// Quota rule: one unit is charged exactly once per cycle that reaches
/// `ShowCandidates`; failed pipelines and "start over" charge nothing.
pub struct Workflow {
    accounts: AccountStore,
    quota: QuotaLedger,
    events: SessionEventWriter,
    translator: Option<Box<dyn Translator>>,
    preparer: Box<dyn ReferencePreparer>,
    generator: Box<dyn GenerationClient>,
    fetcher: Box<dyn ImageFetcher>,
    mailer: Box<dyn Mailer>,
    style: StyleSettings,
    mail: MailSettings,
    polling: PollSettings,
}

impl Workflow {
    pub fn new(parts: WorkflowParts) -> Self {
        Self {
            accounts: parts.accounts,
            quota: parts.quota,
            events: parts.events,
            translator: parts.translator,
            preparer: parts.preparer,
            generator: parts.generator,
            fetcher: parts.fetcher,
            mailer: parts.mailer,
            style: parts.style,
            mail: parts.mail,
            polling: parts.polling,
        }
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn events(&self) -> &SessionEventWriter {
        &self.events
    }

    pub fn candidate_count(&self) -> u8 {
        self.style.candidate_count
    }

    pub fn login(
        &self,
        session: &mut Session,
        username: &str,
        password: &str,
    ) -> Result<(), WorkflowError> {
        if session.state() != SessionState::LoggedOut {
            return Err(WorkflowError::InvalidTransition {
                action: "login",
                state: session.state().as_str(),
            });
        }
        if !self.accounts.verify(username, password) {
            let err = WorkflowError::Auth;
            self.log_error(&err, Some(&format!("login rejected for {username}")));
            return Err(err);
        }
        session.username = username.to_string();
        session.error_message = None;
        session.transition_to(SessionState::Main)?;
        self.log_event(
            "login",
            map_object(json!({ "username": session.username })),
        );
        Ok(())
    }

    /// Runs one full generation cycle: guards, then the pipeline, then the
    /// transition to candidate selection. On any pipeline failure the session
    /// returns to `Main` with a message attached and the quota untouched.
    pub fn submit_dream(
        &self,
        session: &mut Session,
        text: &str,
        reference: Option<ReferenceUpload>,
        on_tick: &mut dyn FnMut(PollProgress),
    ) -> Result<(), WorkflowError> {
        if session.state() != SessionState::Main {
            return Err(WorkflowError::InvalidTransition {
                action: "generate",
                state: session.state().as_str(),
            });
        }
        let trimmed = text.trim();
        if trimmed.is_empty() {
            let err = WorkflowError::EmptyDream;
            session.error_message = Some(err.to_string());
            return Err(err);
        }
        if !self.quota.can_generate(&session.username) {
            let err = WorkflowError::QuotaExceeded {
                username: session.username.clone(),
            };
            session.error_message = Some(err.to_string());
            self.log_error(&err, None);
            return Err(err);
        }

        session.dream_text = clamp_chars(trimmed, DREAM_TEXT_MAX_CHARS);
        session.error_message = None;
        session.transition_to(SessionState::Loading)?;
        self.log_event(
            "generation_requested",
            map_object(json!({
                "username": session.username,
                "chars": session.dream_text.chars().count(),
            })),
        );

        match self.run_pipeline(session, reference, on_tick) {
            Ok(candidates) => {
                session.candidates = candidates;
                let image_count = self.quota.record_generation(&session.username);
                session.transition_to(SessionState::ShowCandidates)?;
                self.log_event(
                    "candidates_ready",
                    map_object(json!({
                        "count": session.candidates.len(),
                        "image_count": image_count,
                    })),
                );
                Ok(())
            }
            Err(err) => {
                self.log_error(&err, None);
                session.transition_to(SessionState::Main)?;
                session.candidates.clear();
                session.reference_image_id = None;
                session.error_message = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn select_candidate(
        &self,
        session: &mut Session,
        index: usize,
    ) -> Result<(), WorkflowError> {
        self.select_candidate_at(session, index, Utc::now())
    }

    pub fn select_candidate_at(
        &self,
        session: &mut Session,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        if session.state() != SessionState::ShowCandidates {
            return Err(WorkflowError::InvalidTransition {
                action: "select",
                state: session.state().as_str(),
            });
        }
        let count = session.candidates.len();
        let Some(candidate) = session.candidates.get(index) else {
            let err = WorkflowError::InvalidSelection { index, count };
            session.error_message = Some(err.to_string());
            return Err(err);
        };
        let (artifact_id, image_png) = (candidate.artifact_id.clone(), candidate.bytes.clone());

        if !self.quota.can_send_email(&session.username, now) {
            let err = WorkflowError::EmailRateLimited {
                cooldown_mins: EMAIL_COOLDOWN_MINUTES,
            };
            session.error_message = Some(err.to_string());
            self.log_error(&err, None);
            return Err(err);
        }

        let delivery = OutboundDelivery {
            subject: format!("New dream image for {}", session.username),
            body: format!(
                "A new dream image has been generated with the following prompt:\n\n{}",
                session.dream_text
            ),
            attachment_name: self.mail.attachment_name.clone(),
            image_png,
        };
        match self.mailer.send(&delivery) {
            Ok(()) => {
                self.quota.record_email_sent(&session.username, now);
                session.selected = Some(index);
                session.error_message = None;
                session.transition_to(SessionState::Success)?;
                self.log_event(
                    "delivered",
                    map_object(json!({ "artifact_id": artifact_id, "index": index })),
                );
                Ok(())
            }
            Err(err) => {
                self.log_error(&err, None);
                session.error_message = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn start_over(&self, session: &mut Session) -> Result<(), WorkflowError> {
        if session.state() != SessionState::ShowCandidates {
            return Err(WorkflowError::InvalidTransition {
                action: "restart",
                state: session.state().as_str(),
            });
        }
        session.transition_to(SessionState::Main)?;
        session.clear_flow_data();
        self.log_event("restarted", EventPayload::new());
        Ok(())
    }

    pub fn logout(&self, session: &mut Session) -> Result<(), WorkflowError> {
        let username = std::mem::take(&mut session.username);
        session.transition_to(SessionState::LoggedOut)?;
        session.clear_flow_data();
        self.log_event("logout", map_object(json!({ "username": username })));
        Ok(())
    }

    pub fn remaining_generations(&self, username: &str) -> Option<u32> {
        self.quota.remaining_generations(username)
    }

    fn run_pipeline(
        &self,
        session: &mut Session,
        reference: Option<ReferenceUpload>,
        on_tick: &mut dyn FnMut(PollProgress),
    ) -> Result<Vec<CandidateImage>, WorkflowError> {
        let prompt = build_prompt(&session.dream_text);
        let prompt = match &self.translator {
            Some(translator) => translator.translate(&prompt)?,
            None => prompt,
        };
        session.translated_prompt = Some(prompt.clone());

        let reference = match reference {
            Some(upload) => Some(upload),
            None => self.profile_reference(&session.username)?,
        };
        let reference_bytes = reference.as_ref().map(|upload| upload.bytes.clone());
        if let Some(upload) = &reference {
            let reference_id = self.preparer.prepare(&upload.bytes, &upload.mime)?;
            self.log_event(
                "reference_uploaded",
                map_object(json!({ "reference_id": reference_id })),
            );
            session.reference_image_id = Some(reference_id);
        }

        let request = GenerationRequest {
            prompt,
            reference_image_id: session.reference_image_id.clone(),
            style: self.style.clone(),
        };
        let mut job = GenerationJob::pending(self.generator.submit(&request)?);
        self.log_event("job_submitted", map_object(json!({ "job_id": job.job_id })));

        let urls = poll_job(self.generator.as_ref(), &mut job, &self.polling, on_tick)?;
        let requested = self.style.candidate_count as usize;
        if urls.len() < requested {
            return Err(WorkflowError::Generation(format!(
                "expected {requested} images, provider returned {}",
                urls.len()
            )));
        }

        let thumbnail = reference_bytes
            .as_deref()
            .map(decode_image)
            .transpose()?;
        let mut candidates = Vec::new();
        for url in urls.into_iter().take(requested) {
            let bytes = self.fetcher.fetch(&url)?;
            let decoded = decode_image(&bytes)?;
            let finished = match &thumbnail {
                Some(thumb) => overlay_thumbnail(&decoded, thumb),
                None => decoded,
            };
            let png = serialize_image(&finished, OutputFormat::Png)?;
            candidates.push(CandidateImage {
                artifact_id: short_id(&url, candidates.len() as u64),
                source_url: url,
                bytes: png,
            });
        }
        Ok(candidates)
    }

    /// Falls back to the account's profile photo when the user did not attach
    /// a reference image. A configured-but-unreadable profile image fails the
    /// attempt rather than silently degrading it.
    fn profile_reference(&self, username: &str) -> Result<Option<ReferenceUpload>, WorkflowError> {
        let Some(path) = self.accounts.profile_image(username) else {
            return Ok(None);
        };
        let mime = mime_for_path(path)?;
        let bytes = fs::read(path).map_err(|err| {
            WorkflowError::Upload(format!(
                "failed to read profile image {}: {err}",
                path.display()
            ))
        })?;
        Ok(Some(ReferenceUpload {
            bytes,
            mime: mime.to_string(),
        }))
    }

    fn log_event(&self, event_type: &str, payload: EventPayload) {
        // Best effort; a broken event log must not break the session.
        let _ = self.events.emit(event_type, payload);
    }

    fn log_error(&self, error: &WorkflowError, detail: Option<&str>) {
        let _ = self.events.emit_error(error, detail);
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value, String> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| format!("{label} response body read failed: {err}"))?;
    if !status.is_success() {
        return Err(format!(
            "{label} request failed ({code}): {}",
            truncate_text(&body, 512)
        ));
    }
    serde_json::from_str(&body).map_err(|_| format!("{label} returned invalid JSON payload"))
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn clamp_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn short_id(seed: &str, index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(index.to_be_bytes());
    hex::encode(&hasher.finalize()[..4])
}

fn color_from_seed(seed: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn map_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
    use serde_json::{json, Value};

    use reverie_contracts::accounts::{
        hash_password, AccountRecord, AccountStore, MailSettings, PollSettings, StyleSettings,
    };
    use reverie_contracts::errors::WorkflowError;
    use reverie_contracts::events::SessionEventWriter;
    use reverie_contracts::quota::QuotaLedger;
    use reverie_contracts::session::{GenerationJob, JobStatus, Session, SessionState};

    use super::{
        build_prompt, decode_image, extension_for_mime, generation_id_from_payload,
        generation_payload, job_status_from_payload, mime_for_path, overlay_thumbnail, poll_job,
        presigned_upload_from_payload, serialize_image, DryrunStudio, GenerationClient,
        GenerationRequest, Mailer, OutboundDelivery, OutputFormat, ReferencePreparer,
        ReferenceUpload, SmtpMailer, Translator, Workflow, WorkflowParts, PROMPT_FRAME,
        PROMPT_SUFFIX,
    };
    use super::{ImageFetcher, PollProgress};

    // -- fakes --------------------------------------------------------------

    struct PrefixTranslator;

    impl Translator for PrefixTranslator {
        fn translate(&self, text: &str) -> Result<String, WorkflowError> {
            Ok(format!("EN: {text}"))
        }
    }

    struct CountingGenerator {
        inner: Box<dyn GenerationClient>,
        submits: Arc<AtomicUsize>,
    }

    impl GenerationClient for CountingGenerator {
        fn submit(&self, request: &GenerationRequest) -> Result<String, WorkflowError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            self.inner.submit(request)
        }

        fn poll(&self, job_id: &str) -> Result<JobStatus, WorkflowError> {
            self.inner.poll(job_id)
        }
    }

    struct ScriptedGenerator {
        pending_rounds: Mutex<u64>,
        outcome: JobStatus,
    }

    impl GenerationClient for ScriptedGenerator {
        fn submit(&self, _request: &GenerationRequest) -> Result<String, WorkflowError> {
            Ok("job-scripted".to_string())
        }

        fn poll(&self, _job_id: &str) -> Result<JobStatus, WorkflowError> {
            let mut rounds = self.pending_rounds.lock().unwrap();
            if *rounds > 0 {
                *rounds -= 1;
                return Ok(JobStatus::Pending);
            }
            Ok(self.outcome.clone())
        }
    }

    struct FailingGenerator;

    impl GenerationClient for FailingGenerator {
        fn submit(&self, _request: &GenerationRequest) -> Result<String, WorkflowError> {
            Err(WorkflowError::Generation("upstream rejected".to_string()))
        }

        fn poll(&self, _job_id: &str) -> Result<JobStatus, WorkflowError> {
            Err(WorkflowError::Generation("upstream rejected".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct CapturingMailer {
        fail: bool,
        sent: Arc<Mutex<Vec<OutboundDelivery>>>,
    }

    impl CapturingMailer {
        fn deliveries(&self) -> Vec<OutboundDelivery> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Mailer for CapturingMailer {
        fn send(&self, delivery: &OutboundDelivery) -> Result<(), WorkflowError> {
            if self.fail {
                return Err(WorkflowError::Delivery("smtp down".to_string()));
            }
            self.sent.lock().unwrap().push(delivery.clone());
            Ok(())
        }
    }

    // -- harness ------------------------------------------------------------

    struct HarnessOptions {
        privileged: Vec<String>,
        candidate_count: u8,
        mailer_fails: bool,
        profile_image: Option<PathBuf>,
        polling: PollSettings,
    }

    impl Default for HarnessOptions {
        fn default() -> Self {
            Self {
                privileged: Vec::new(),
                candidate_count: 4,
                mailer_fails: false,
                profile_image: None,
                polling: PollSettings {
                    interval_secs: 0,
                    timeout_secs: 30,
                },
            }
        }
    }

    fn mail_settings() -> MailSettings {
        MailSettings {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            from_address: "dreams@example.com".to_string(),
            recipient: "inbox@example.com".to_string(),
            cc: Some("archive@example.com".to_string()),
            attachment_name: "dream_image.png".to_string(),
        }
    }

    fn build_workflow(
        temp: &tempfile::TempDir,
        generator: Box<dyn GenerationClient>,
        options: HarnessOptions,
    ) -> (Workflow, CapturingMailer, Arc<AtomicUsize>) {
        let submits = Arc::new(AtomicUsize::new(0));
        let mailer = CapturingMailer {
            fail: options.mailer_fails,
            sent: Arc::default(),
        };
        let accounts = vec![
            AccountRecord {
                username: "alice".to_string(),
                password_salt: "salt".to_string(),
                password_sha256: hash_password("salt", "dream-on"),
                profile_image: options.profile_image.clone(),
            },
            AccountRecord {
                username: "דודזלצר".to_string(),
                password_salt: "salt".to_string(),
                password_sha256: hash_password("salt", "chief"),
                profile_image: None,
            },
        ];
        let workflow = Workflow::new(WorkflowParts {
            accounts: AccountStore::new(accounts),
            quota: QuotaLedger::new(3, options.privileged),
            events: SessionEventWriter::new(temp.path().join("events.jsonl"), "sess-test"),
            translator: Some(Box::new(PrefixTranslator)),
            preparer: Box::new(DryrunStudio),
            generator: Box::new(CountingGenerator {
                inner: generator,
                submits: submits.clone(),
            }),
            fetcher: Box::new(DryrunStudio),
            mailer: Box::new(mailer.clone()),
            style: StyleSettings {
                model_id: "model-test".to_string(),
                candidate_count: options.candidate_count,
                ..Default::default()
            },
            mail: mail_settings(),
            polling: options.polling,
        });
        (workflow, mailer, submits)
    }

    fn logged_in(workflow: &Workflow, username: &str, password: &str) -> Session {
        let mut session = Session::new();
        workflow.login(&mut session, username, password).expect("login");
        session
    }

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    fn event_types(temp: &tempfile::TempDir) -> Vec<String> {
        let raw = fs::read_to_string(temp.path().join("events.jsonl")).unwrap_or_default();
        raw.lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    // -- prompt building ----------------------------------------------------

    #[test]
    fn build_prompt_frames_the_dream_text() {
        let prompt = build_prompt("I am flying over mountains");
        assert!(prompt.starts_with(PROMPT_FRAME));
        assert!(prompt.contains("I am flying over mountains"));
        assert!(prompt.ends_with(PROMPT_SUFFIX));
        assert!(prompt.contains("mountains. Try"));
    }

    #[test]
    fn build_prompt_keeps_existing_terminal_punctuation() {
        let prompt = build_prompt("I can fly!");
        assert!(prompt.contains("I can fly! Try"));
        assert!(!prompt.contains("fly!. "));
    }

    #[test]
    fn build_prompt_truncates_overlong_input() {
        let long = "x".repeat(250);
        let prompt = build_prompt(&long);
        assert!(prompt.contains(&"x".repeat(200)));
        assert!(!prompt.contains(&"x".repeat(201)));
    }

    // -- image post-processing ----------------------------------------------

    #[test]
    fn overlay_preserves_main_dimensions_and_bounds_the_thumbnail() -> anyhow::Result<()> {
        let main = solid(640, 400, [200, 30, 30]);
        let thumb = solid(900, 600, [20, 20, 220]);
        let out = overlay_thumbnail(&main, &thumb);
        assert_eq!(out.dimensions(), (640, 400));

        let rgba = out.to_rgba8();
        // 900x600 scales to 300x200; the 2px frame makes the block 304x204.
        assert_eq!(rgba.get_pixel(10, 10).0, [255, 255, 255, 255]);
        assert_eq!(rgba.get_pixel(12, 12).0, [20, 20, 220, 255]);
        assert_eq!(rgba.get_pixel(10 + 303, 10), rgba.get_pixel(10, 10));
        assert_eq!(rgba.get_pixel(10 + 304, 10).0, [200, 30, 30, 255]);

        // Round trip through PNG keeps the canvas intact.
        let bytes = serialize_image(&out, OutputFormat::Png)?;
        let decoded = decode_image(&bytes)?;
        assert_eq!(decoded.dimensions(), (640, 400));
        Ok(())
    }

    #[test]
    fn overlay_scales_tall_thumbnails_within_the_box() {
        let main = solid(640, 640, [0, 0, 0]);
        let thumb = solid(600, 900, [10, 200, 10]);
        let out = overlay_thumbnail(&main, &thumb).to_rgba8();
        // 600x900 scales to 200x300; frame is 204x304.
        assert_eq!(out.get_pixel(10 + 203, 10).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(10 + 204, 10).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(10, 10 + 304).0, [0, 0, 0, 255]);
    }

    #[test]
    fn serialize_jpeg_round_trips_dimensions() -> anyhow::Result<()> {
        let image = solid(32, 24, [120, 80, 40]);
        let bytes = serialize_image(&image, OutputFormat::Jpeg)?;
        let decoded = decode_image(&bytes)?;
        assert_eq!(decoded.dimensions(), (32, 24));
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_image(&[0, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, WorkflowError::Decode(_)));
    }

    #[test]
    fn mime_checks_accept_png_and_jpeg_only() {
        assert_eq!(extension_for_mime("image/png").unwrap(), "png");
        assert_eq!(extension_for_mime("image/jpeg").unwrap(), "jpg");
        assert!(matches!(
            extension_for_mime("image/gif"),
            Err(WorkflowError::UnsupportedFormat(_))
        ));
        assert_eq!(mime_for_path(&PathBuf::from("me.PNG")).unwrap(), "image/png");
        assert_eq!(mime_for_path(&PathBuf::from("me.jpeg")).unwrap(), "image/jpeg");
        assert!(mime_for_path(&PathBuf::from("me.webp")).is_err());
    }

    // -- provider payloads --------------------------------------------------

    #[test]
    fn generation_payload_shapes_provider_fields() {
        let request = GenerationRequest {
            prompt: "a boat".to_string(),
            reference_image_id: None,
            style: StyleSettings {
                model_id: "model-test".to_string(),
                ..Default::default()
            },
        };
        let payload = generation_payload(&request);
        assert_eq!(payload["prompt"], json!("a boat"));
        assert_eq!(payload["modelId"], json!("model-test"));
        assert_eq!(payload["presetStyle"], json!("CINEMATIC"));
        assert_eq!(payload["photoReal"], json!(true));
        assert_eq!(payload["photoRealVersion"], json!("v2"));
        assert_eq!(payload["alchemy"], json!(true));
        assert_eq!(payload["num_images"], json!(4));
        assert_eq!(payload["enhancePrompt"], json!(true));
        assert!(!payload.contains_key("controlnets"));
    }

    #[test]
    fn generation_payload_attaches_controlnets_for_references() {
        let request = GenerationRequest {
            prompt: "a boat".to_string(),
            reference_image_id: Some("ref-1".to_string()),
            style: StyleSettings {
                model_id: "model-test".to_string(),
                ..Default::default()
            },
        };
        let payload = generation_payload(&request);
        let controlnets = payload["controlnets"].as_array().expect("controlnets");
        assert_eq!(controlnets.len(), 1);
        assert_eq!(controlnets[0]["initImageId"], json!("ref-1"));
        assert_eq!(controlnets[0]["initImageType"], json!("UPLOADED"));
        assert_eq!(controlnets[0]["preprocessorId"], json!(133));
        assert_eq!(controlnets[0]["strengthType"], json!("Mid"));
    }

    #[test]
    fn submit_response_parsing() {
        let ok = json!({ "sdGenerationJob": { "generationId": "gen-123" } });
        assert_eq!(generation_id_from_payload(&ok).unwrap(), "gen-123");

        let missing = json!({ "sdGenerationJob": {} });
        assert!(matches!(
            generation_id_from_payload(&missing),
            Err(WorkflowError::Generation(_))
        ));
    }

    #[test]
    fn poll_response_parsing() {
        let complete = json!({
            "generations_by_pk": {
                "status": "COMPLETE",
                "generated_images": [
                    { "url": "https://img.example/1.png" },
                    { "url": "https://img.example/2.png" },
                ],
            }
        });
        assert_eq!(
            job_status_from_payload(&complete).unwrap(),
            JobStatus::Complete {
                result_urls: vec![
                    "https://img.example/1.png".to_string(),
                    "https://img.example/2.png".to_string(),
                ]
            }
        );

        let pending = json!({ "generations_by_pk": { "status": "PENDING" } });
        assert_eq!(job_status_from_payload(&pending).unwrap(), JobStatus::Pending);

        let failed = json!({ "generations_by_pk": { "status": "FAILED" } });
        assert!(matches!(
            job_status_from_payload(&failed).unwrap(),
            JobStatus::Failed { .. }
        ));

        let unknown_job = json!({ "generations_by_pk": null });
        assert!(job_status_from_payload(&unknown_job).is_err());
    }

    #[test]
    fn presign_parsing_accepts_object_and_string_fields() {
        let object_fields = json!({
            "uploadInitImage": {
                "url": "https://upload.example/target",
                "id": "init-9",
                "fields": { "key": "abc", "policy": "xyz" },
            }
        });
        let parsed = presigned_upload_from_payload(&object_fields).unwrap();
        assert_eq!(parsed.url, "https://upload.example/target");
        assert_eq!(parsed.id, "init-9");
        assert_eq!(parsed.fields.len(), 2);

        let string_fields = json!({
            "uploadInitImage": {
                "url": "https://upload.example/target",
                "id": "init-9",
                "fields": "{\"key\":\"abc\"}",
            }
        });
        let parsed = presigned_upload_from_payload(&string_fields).unwrap();
        assert_eq!(parsed.fields, vec![("key".to_string(), "abc".to_string())]);

        let missing_url = json!({ "uploadInitImage": { "id": "init-9" } });
        assert!(matches!(
            presigned_upload_from_payload(&missing_url),
            Err(WorkflowError::Upload(_))
        ));
    }

    // -- polling ------------------------------------------------------------

    #[test]
    fn poll_job_completes_after_pending_rounds() {
        let generator = ScriptedGenerator {
            pending_rounds: Mutex::new(2),
            outcome: JobStatus::Complete {
                result_urls: vec!["dryrun://stub/0".to_string()],
            },
        };
        let mut job = GenerationJob::pending("job-scripted");
        let mut ticks: Vec<u64> = Vec::new();
        let polling = PollSettings {
            interval_secs: 0,
            timeout_secs: 30,
        };
        let urls = poll_job(&generator, &mut job, &polling, &mut |progress: PollProgress| {
            ticks.push(progress.tick)
        })
        .unwrap();
        assert_eq!(urls, vec!["dryrun://stub/0".to_string()]);
        assert_eq!(ticks, vec![0, 1]);
        assert!(matches!(job.status, JobStatus::Complete { .. }));
    }

    #[test]
    fn poll_job_bounds_total_wait() {
        let generator = ScriptedGenerator {
            pending_rounds: Mutex::new(u64::MAX),
            outcome: JobStatus::Pending,
        };
        let mut job = GenerationJob::pending("job-scripted");
        let polling = PollSettings {
            interval_secs: 0,
            timeout_secs: 0,
        };
        let err = poll_job(&generator, &mut job, &polling, &mut |_| {}).unwrap_err();
        assert!(matches!(err, WorkflowError::GenerationTimeout { .. }));
    }

    #[test]
    fn poll_job_surfaces_provider_failure() {
        let generator = ScriptedGenerator {
            pending_rounds: Mutex::new(0),
            outcome: JobStatus::Failed {
                reason: "DECLINED".to_string(),
            },
        };
        let mut job = GenerationJob::pending("job-scripted");
        let polling = PollSettings {
            interval_secs: 0,
            timeout_secs: 30,
        };
        let err = poll_job(&generator, &mut job, &polling, &mut |_| {}).unwrap_err();
        match err {
            WorkflowError::Generation(message) => assert!(message.contains("DECLINED")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // -- dryrun collaborators ------------------------------------------------

    #[test]
    fn dryrun_round_trip_yields_decodable_candidates() -> anyhow::Result<()> {
        let studio = DryrunStudio::new();
        let request = GenerationRequest {
            prompt: "a boat".to_string(),
            reference_image_id: None,
            style: StyleSettings {
                model_id: "model-test".to_string(),
                ..Default::default()
            },
        };
        let job_id = studio.submit(&request)?;
        let JobStatus::Complete { result_urls } = studio.poll(&job_id)? else {
            panic!("dryrun jobs complete immediately");
        };
        assert_eq!(result_urls.len(), 4);
        let bytes = studio.fetch(&result_urls[0])?;
        let decoded = decode_image(&bytes)?;
        assert_eq!(decoded.dimensions(), (768, 512));
        Ok(())
    }

    #[test]
    fn dryrun_fetch_rejects_external_urls() {
        let err = DryrunStudio::new()
            .fetch("https://img.example/1.png")
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Fetch(_)));
    }

    #[test]
    fn dryrun_preparer_validates_mime() {
        let studio = DryrunStudio::new();
        assert!(studio.prepare(&[1, 2, 3], "image/png").is_ok());
        assert!(matches!(
            studio.prepare(&[1, 2, 3], "image/gif"),
            Err(WorkflowError::UnsupportedFormat(_))
        ));
    }

    // -- delivery -----------------------------------------------------------

    #[test]
    fn smtp_message_carries_body_attachment_and_recipients() -> anyhow::Result<()> {
        let mailer = SmtpMailer::new(mail_settings(), "app-password".to_string());
        let delivery = OutboundDelivery {
            subject: "New dream image for alice".to_string(),
            body: "A new dream image has been generated with the following prompt:\n\nI am flying"
                .to_string(),
            attachment_name: "dream_image.png".to_string(),
            image_png: serialize_image(&solid(8, 8, [1, 2, 3]), OutputFormat::Png)?,
        };
        let message = mailer.build_message(&delivery)?;
        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("Subject: New dream image for alice"));
        assert!(formatted.contains("inbox@example.com"));
        assert!(formatted.contains("archive@example.com"));
        assert!(formatted.contains("dream_image.png"));
        Ok(())
    }

    // -- workflow: full cycle ------------------------------------------------

    #[test]
    fn full_cycle_reaches_success_and_charges_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, mailer, submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");
        assert_eq!(session.state(), SessionState::Main);

        let mut ticks = 0u64;
        workflow.submit_dream(
            &mut session,
            "I am flying over mountains",
            None,
            &mut |_| ticks += 1,
        )?;
        assert_eq!(session.state(), SessionState::ShowCandidates);
        assert_eq!(session.candidates.len(), 4);
        assert!(session
            .translated_prompt
            .as_deref()
            .unwrap_or_default()
            .starts_with("EN: "));
        assert_eq!(workflow.quota().snapshot("alice").image_count, 1);
        assert_eq!(submits.load(Ordering::SeqCst), 1);

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        workflow.select_candidate_at(&mut session, 2, now)?;
        assert_eq!(session.state(), SessionState::Success);
        assert_eq!(session.selected, Some(2));
        assert_eq!(
            workflow.quota().snapshot("alice").last_email_sent,
            Some(now)
        );

        let deliveries = mailer.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].subject.contains("alice"));
        assert!(deliveries[0].body.contains("I am flying over mountains"));
        assert_eq!(deliveries[0].attachment_name, "dream_image.png");
        assert!(!deliveries[0].image_png.is_empty());

        let types = event_types(&temp);
        assert!(types.contains(&"login".to_string()));
        assert!(types.contains(&"generation_requested".to_string()));
        assert!(types.contains(&"job_submitted".to_string()));
        assert!(types.contains(&"candidates_ready".to_string()));
        assert!(types.contains(&"delivered".to_string()));
        Ok(())
    }

    #[test]
    fn quota_exhaustion_blocks_before_any_provider_call() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        for _ in 0..3 {
            workflow.quota().record_generation("alice");
        }

        let mut session = logged_in(&workflow, "alice", "dream-on");
        let err = workflow
            .submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, WorkflowError::QuotaExceeded { .. }));
        assert_eq!(session.state(), SessionState::Main);
        assert!(session
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("limit"));
        assert_eq!(submits.load(Ordering::SeqCst), 0);
        assert_eq!(workflow.quota().snapshot("alice").image_count, 3);
        Ok(())
    }

    #[test]
    fn privileged_user_generates_past_the_cap() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) = build_workflow(
            &temp,
            Box::new(DryrunStudio),
            HarnessOptions {
                privileged: vec!["דודזלצר".to_string()],
                ..Default::default()
            },
        );
        for _ in 0..50 {
            workflow.quota().record_generation("דודזלצר");
        }
        assert!(workflow.quota().can_generate("דודזלצר"));
        assert_eq!(workflow.remaining_generations("דודזלצר"), None);

        let mut session = logged_in(&workflow, "דודזלצר", "chief");
        workflow.submit_dream(&mut session, "גשר על הירדן", None, &mut |_| {})?;
        assert_eq!(session.state(), SessionState::ShowCandidates);
        Ok(())
    }

    #[test]
    fn empty_dream_never_leaves_main() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");

        let err = workflow
            .submit_dream(&mut session, "   ", None, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyDream));
        assert_eq!(session.state(), SessionState::Main);
        assert!(session.error_message.is_some());
        assert_eq!(submits.load(Ordering::SeqCst), 0);
        assert_eq!(workflow.quota().snapshot("alice").image_count, 0);
        Ok(())
    }

    #[test]
    fn pipeline_failure_returns_to_main_without_charging() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(FailingGenerator), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");

        let err = workflow
            .submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Generation(_)));
        assert_eq!(session.state(), SessionState::Main);
        assert!(session.error_message.is_some());
        assert!(session.candidates.is_empty());
        assert_eq!(workflow.quota().snapshot("alice").image_count, 0);
        assert!(event_types(&temp).contains(&"workflow_error".to_string()));
        Ok(())
    }

    #[test]
    fn generation_timeout_lands_back_in_main() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let generator = ScriptedGenerator {
            pending_rounds: Mutex::new(u64::MAX),
            outcome: JobStatus::Pending,
        };
        let (workflow, _mailer, _submits) = build_workflow(
            &temp,
            Box::new(generator),
            HarnessOptions {
                polling: PollSettings {
                    interval_secs: 0,
                    timeout_secs: 0,
                },
                ..Default::default()
            },
        );
        let mut session = logged_in(&workflow, "alice", "dream-on");

        let err = workflow
            .submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, WorkflowError::GenerationTimeout { .. }));
        assert_eq!(session.state(), SessionState::Main);
        assert!(session
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
        assert_eq!(workflow.quota().snapshot("alice").image_count, 0);
        Ok(())
    }

    #[test]
    fn delivery_failure_keeps_the_candidate_view() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, mailer, _submits) = build_workflow(
            &temp,
            Box::new(DryrunStudio),
            HarnessOptions {
                mailer_fails: true,
                ..Default::default()
            },
        );
        let mut session = logged_in(&workflow, "alice", "dream-on");
        workflow.submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})?;

        let err = workflow.select_candidate(&mut session, 0).unwrap_err();
        assert!(matches!(err, WorkflowError::Delivery(_)));
        assert_eq!(session.state(), SessionState::ShowCandidates);
        assert_eq!(session.selected, None);
        assert!(session.error_message.is_some());
        assert!(mailer.deliveries().is_empty());
        assert_eq!(workflow.quota().snapshot("alice").last_email_sent, None);
        Ok(())
    }

    #[test]
    fn email_cooldown_blocks_a_second_send() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");
        workflow.submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})?;

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        workflow.quota().record_email_sent("alice", start);
        let err = workflow
            .select_candidate_at(&mut session, 0, start + ChronoDuration::minutes(2))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::EmailRateLimited { .. }));
        assert_eq!(session.state(), SessionState::ShowCandidates);

        workflow.select_candidate_at(
            &mut session,
            0,
            start + ChronoDuration::minutes(5) + ChronoDuration::seconds(1),
        )?;
        assert_eq!(session.state(), SessionState::Success);
        Ok(())
    }

    #[test]
    fn start_over_discards_candidates_without_extra_charge() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");
        workflow.submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})?;
        assert_eq!(workflow.quota().snapshot("alice").image_count, 1);

        workflow.start_over(&mut session)?;
        assert_eq!(session.state(), SessionState::Main);
        assert!(session.candidates.is_empty());
        assert!(session.dream_text.is_empty());
        assert_eq!(workflow.quota().snapshot("alice").image_count, 1);

        // A fresh cycle works and charges the second unit.
        workflow.submit_dream(&mut session, "sailing through clouds", None, &mut |_| {})?;
        assert_eq!(workflow.quota().snapshot("alice").image_count, 2);
        Ok(())
    }

    #[test]
    fn selecting_out_of_range_is_rejected_in_place() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");
        workflow.submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})?;

        let err = workflow.select_candidate(&mut session, 9).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidSelection { index: 9, count: 4 }
        ));
        assert_eq!(session.state(), SessionState::ShowCandidates);
        Ok(())
    }

    #[test]
    fn transitions_outside_the_table_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());

        let mut session = Session::new();
        let err = workflow
            .submit_dream(&mut session, "a dream", None, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

        workflow.login(&mut session, "alice", "dream-on")?;
        let err = workflow.login(&mut session, "alice", "dream-on").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

        let err = workflow.select_candidate(&mut session, 0).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));

        let err = workflow.start_over(&mut session).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        Ok(())
    }

    #[test]
    fn bad_credentials_stay_logged_out() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = Session::new();
        let err = workflow
            .login(&mut session, "alice", "wrong")
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Auth));
        assert_eq!(session.state(), SessionState::LoggedOut);
        assert!(session.username.is_empty());
        Ok(())
    }

    #[test]
    fn logout_clears_the_session_from_any_state() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");
        workflow.submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})?;

        workflow.logout(&mut session)?;
        assert_eq!(session.state(), SessionState::LoggedOut);
        assert!(session.username.is_empty());
        assert!(session.candidates.is_empty());
        Ok(())
    }

    #[test]
    fn explicit_reference_upload_is_prepared_and_overlaid() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");

        let reference = ReferenceUpload {
            bytes: serialize_image(&solid(40, 40, [0, 0, 255]), OutputFormat::Png)?,
            mime: "image/png".to_string(),
        };
        workflow.submit_dream(
            &mut session,
            "I am flying over mountains",
            Some(reference),
            &mut |_| {},
        )?;
        assert_eq!(session.state(), SessionState::ShowCandidates);
        assert!(session
            .reference_image_id
            .as_deref()
            .unwrap_or_default()
            .starts_with("dryrun-ref-"));
        assert!(event_types(&temp).contains(&"reference_uploaded".to_string()));
        Ok(())
    }

    #[test]
    fn profile_photo_is_used_when_no_upload_given() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let profile_path = temp.path().join("alice.png");
        fs::write(
            &profile_path,
            serialize_image(&solid(24, 24, [9, 9, 9]), OutputFormat::Png)?,
        )?;
        let (workflow, _mailer, _submits) = build_workflow(
            &temp,
            Box::new(DryrunStudio),
            HarnessOptions {
                profile_image: Some(profile_path),
                ..Default::default()
            },
        );
        let mut session = logged_in(&workflow, "alice", "dream-on");
        workflow.submit_dream(&mut session, "I am flying over mountains", None, &mut |_| {})?;
        assert!(session.reference_image_id.is_some());
        Ok(())
    }

    #[test]
    fn unsupported_reference_format_fails_the_attempt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let (workflow, _mailer, _submits) =
            build_workflow(&temp, Box::new(DryrunStudio), HarnessOptions::default());
        let mut session = logged_in(&workflow, "alice", "dream-on");

        let reference = ReferenceUpload {
            bytes: vec![1, 2, 3],
            mime: "image/gif".to_string(),
        };
        let err = workflow
            .submit_dream(
                &mut session,
                "I am flying over mountains",
                Some(reference),
                &mut |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnsupportedFormat(_)));
        assert_eq!(session.state(), SessionState::Main);
        assert_eq!(workflow.quota().snapshot("alice").image_count, 0);
        Ok(())
    }
}
