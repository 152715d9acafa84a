//! Binary WAV transfer: streamed downloads, raw PUT uploads, and hand-built
//! multipart/form-data message uploads.
//!
//! # Design
//! Media calls bypass JSON/XML body parsing but go through the same call
//! lock, authorization, and session bookkeeping as `RestClient::send`.
//! Multipart bodies are assembled in memory: each part is preceded by
//! `--{boundary}\r\n`, carries its own `Content-Type` (and optionally
//! `Content-Disposition`), a blank line, then content; the body ends with
//! `\r\n--{boundary}--\r\n`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::client::{RestClient, JSON_CONTENT, XML_CONTENT};
use crate::codec;
use crate::error::{FailureKind, ValidationError};
use crate::http::HttpMethod;
use crate::property_list::PropertyList;
use crate::types::CallResult;

pub const WAV_CONTENT: &str = "audio/wav";

/// Chunk size used when streaming a download to disk.
pub const DOWNLOAD_CHUNK_SIZE: usize = 4096;

/// Uploads at or below this many bytes are rejected as corrupt.
pub const MIN_WAV_BYTES: usize = 10;

static LAST_TICKS: AtomicU64 = AtomicU64::new(0);

/// Boundary token from the wall clock in hex, bumped so two calls in one
/// process never repeat.
pub fn new_boundary() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default();
    let mut ticks = now;
    let _ = LAST_TICKS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        ticks = now.max(last.saturating_add(1));
        Some(ticks)
    });
    format!("Boundary_{ticks:x}")
}

/// One section of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub content_type: String,
    pub disposition: Option<String>,
    pub content: Vec<u8>,
}

impl MultipartPart {
    pub fn json(content: &str) -> Self {
        Self {
            content_type: JSON_CONTENT.to_string(),
            disposition: None,
            content: content.as_bytes().to_vec(),
        }
    }

    pub fn xml(content: &str) -> Self {
        Self {
            content_type: XML_CONTENT.to_string(),
            disposition: None,
            content: content.as_bytes().to_vec(),
        }
    }

    pub fn wav(content: Vec<u8>, file_name: &str) -> Self {
        Self {
            content_type: WAV_CONTENT.to_string(),
            disposition: Some(format!("attachment; filename=\"{file_name}\"")),
            content,
        }
    }
}

/// Encode `parts` between `boundary` markers.
pub fn encode_multipart(boundary: &str, parts: &[MultipartPart]) -> Vec<u8> {
    let size: usize = parts.iter().map(|p| p.content.len() + 128).sum();
    let mut body = Vec::with_capacity(size + boundary.len() + 8);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n", part.content_type).as_bytes());
        if let Some(disposition) = &part.disposition {
            body.extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.content);
    }
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Read a WAV file for upload, rejecting missing and trivially small files.
pub fn read_wav(path: &Path) -> Result<Vec<u8>, ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::Empty("local wav path"));
    }
    if !path.is_file() {
        return Err(ValidationError::FileNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(|source| ValidationError::FileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() <= MIN_WAV_BYTES {
        return Err(ValidationError::FileTooSmall {
            path: path.to_path_buf(),
            size: bytes.len(),
        });
    }
    Ok(bytes)
}

fn copy_in_chunks(reader: &mut dyn Read, writer: &mut impl Write) -> io::Result<u64> {
    let mut buf = [0u8; DOWNLOAD_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio.wav".to_string())
}

impl RestClient {
    /// GET `url` and stream the body to `destination`, replacing any
    /// existing file. An empty body is a failure and leaves no file behind.
    pub fn download_binary(&self, url: &str, destination: &Path) -> CallResult {
        if url.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Get, url, ValidationError::Empty("url"));
        }
        if destination.as_os_str().is_empty() {
            return CallResult::invalid(HttpMethod::Get, url, ValidationError::Empty("destination path"));
        }
        let mut res = CallResult::for_request(HttpMethod::Get, url, "");
        if let Err(e) = fs::remove_file(destination) {
            if e.kind() != io::ErrorKind::NotFound {
                res.fail(
                    FailureKind::Validation,
                    format!("could not remove existing file {}: {e}", destination.display()),
                );
                return res;
            }
        }

        let _exclusive = self.exclusive();
        let request = self.authorized(HttpMethod::Get, url);
        let Some(mut response) = self.execute(&mut res, &request) else {
            return res;
        };

        if !response.is_success() {
            match response.read_text() {
                Ok(text) => res.response_text = text,
                Err(e) => tracing::debug!(error = %e, "could not read error body"),
            }
            self.protocol_failure(&mut res);
            return res;
        }

        let written = File::create(destination)
            .and_then(|mut file| copy_in_chunks(response.body.as_mut(), &mut file));
        match written {
            Ok(0) => {
                let _ = fs::remove_file(destination);
                res.fail(FailureKind::Transport, "response stream was empty");
            }
            Ok(bytes) => {
                res.success = true;
                res.misc = format!("{bytes} bytes written to {}", destination.display());
                self.record_session(&mut res, &response);
            }
            Err(e) => {
                let _ = fs::remove_file(destination);
                res.fail(FailureKind::Transport, format!("download to {} failed: {e}", destination.display()));
            }
        }
        res
    }

    /// PUT a local WAV file as the raw request body.
    pub fn upload_binary_put(&self, url: &str, local_path: &Path) -> CallResult {
        if url.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Put, url, ValidationError::Empty("url"));
        }
        match read_wav(local_path) {
            Ok(bytes) => self.put_wav_bytes(url, bytes, local_path),
            Err(e) => CallResult::invalid(HttpMethod::Put, url, e),
        }
    }

    /// PUT already-validated WAV bytes read from `source`.
    fn put_wav_bytes(&self, url: &str, bytes: Vec<u8>, source: &Path) -> CallResult {
        let mut res = CallResult::for_request(HttpMethod::Put, url, "");
        res.misc = format!("{} bytes from {}", bytes.len(), source.display());

        let _exclusive = self.exclusive();
        let request = self
            .authorized(HttpMethod::Put, url)
            .header("Content-Type", WAV_CONTENT)
            .body(bytes);
        self.complete_exchange(&mut res, &request, None);
        res
    }

    /// POST `parts` as one multipart/form-data body.
    pub fn upload_multipart(&self, url: &str, parts: &[MultipartPart]) -> CallResult {
        if url.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Post, url, ValidationError::Empty("url"));
        }
        if parts.is_empty() {
            return CallResult::invalid(HttpMethod::Post, url, ValidationError::Empty("multipart parts"));
        }
        let boundary = new_boundary();
        let body = encode_multipart(&boundary, parts);
        let mut res = CallResult::for_request(HttpMethod::Post, url, "");
        res.misc = format!("{} parts, boundary {boundary}", parts.len());

        let _exclusive = self.exclusive();
        let request = self
            .authorized(HttpMethod::Post, url)
            .header("Accept", JSON_CONTENT)
            .header("Content-Type", format!("multipart/form-data;boundary={boundary}"))
            .body(body);
        self.complete_exchange(&mut res, &request, Some(true));
        res
    }

    pub fn voice_name_url(&self, user_id: &str) -> String {
        self.server().url(&format!("users/{user_id}/voicename"))
    }

    pub fn greeting_audio_url(&self, handler_id: &str, greeting_type: &str, language_code: u32) -> String {
        self.server().url(&format!(
            "handlers/callhandlers/{handler_id}/greetings/{greeting_type}/greetingstreamfiles/{language_code}/audio"
        ))
    }

    pub fn message_attachment_url(&self, message_id: &str, index: usize, user_id: &str) -> String {
        self.server().url(&format!(
            "messages/{message_id}/attachments/{index}?userobjectid={user_id}"
        ))
    }

    pub fn voice_file_url(&self, name: &str) -> String {
        self.server().url(&format!("voicefiles/{name}"))
    }

    pub fn download_voice_name(&self, user_id: &str, destination: &Path) -> CallResult {
        if user_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Get, "", ValidationError::Empty("user id"));
        }
        self.download_binary(&self.voice_name_url(user_id), destination)
    }

    pub fn upload_voice_name(&self, user_id: &str, local_path: &Path) -> CallResult {
        if user_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Put, "", ValidationError::Empty("user id"));
        }
        self.upload_binary_put(&self.voice_name_url(user_id), local_path)
    }

    pub fn download_greeting(
        &self,
        handler_id: &str,
        greeting_type: &str,
        language_code: u32,
        destination: &Path,
    ) -> CallResult {
        if handler_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Get, "", ValidationError::Empty("call handler id"));
        }
        let url = self.greeting_audio_url(handler_id, greeting_type, language_code);
        self.download_binary(&url, destination)
    }

    pub fn upload_greeting(
        &self,
        handler_id: &str,
        greeting_type: &str,
        language_code: u32,
        local_path: &Path,
    ) -> CallResult {
        if handler_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Put, "", ValidationError::Empty("call handler id"));
        }
        let url = self.greeting_audio_url(handler_id, greeting_type, language_code);
        self.upload_binary_put(&url, local_path)
    }

    pub fn download_message_attachment(
        &self,
        message_id: &str,
        index: usize,
        user_id: &str,
        destination: &Path,
    ) -> CallResult {
        if message_id.trim().is_empty() || user_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Get, "", ValidationError::Empty("message or user id"));
        }
        let url = self.message_attachment_url(message_id, index, user_id);
        self.download_binary(&url, destination)
    }

    /// Stage a WAV in the stream library: allocate a temporary slot, then
    /// upload into it. The slot name ends up in `returned_object_id`.
    ///
    /// A failed upload leaves the slot allocated; the server reclaims unused
    /// slots on its own.
    pub fn upload_wav_to_stream_library(&self, local_path: &Path) -> CallResult {
        let url = self.server().url("voicefiles");
        let audio = match read_wav(local_path) {
            Ok(bytes) => bytes,
            Err(e) => return CallResult::invalid(HttpMethod::Post, &url, e),
        };

        let mut slot = self.send(&url, HttpMethod::Post, "", true);
        if !slot.success {
            return slot;
        }
        let name = slot.response_text.trim().trim_matches('"').to_string();
        if name.is_empty() {
            slot.fail(FailureKind::Parse, "server returned an empty stream file name");
            return slot;
        }

        let mut res = self.put_wav_bytes(&self.voice_file_url(&name), audio, local_path);
        if res.success {
            res.returned_object_id = name;
        } else {
            tracing::debug!(slot = %name, "stream file upload failed, slot left for server cleanup");
        }
        res
    }

    /// Broadcast message: XML metadata then the recording.
    pub fn upload_broadcast_message(&self, user_id: &str, metadata_xml: &str, wav_path: &Path) -> CallResult {
        let url = self
            .server()
            .url(&format!("broadcastmessages?userobjectid={user_id}"));
        if user_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Post, &url, ValidationError::Empty("user id"));
        }
        let audio = match read_wav(wav_path) {
            Ok(bytes) => bytes,
            Err(e) => return CallResult::invalid(HttpMethod::Post, &url, e),
        };
        let parts = [
            MultipartPart::xml(metadata_xml),
            MultipartPart::wav(audio, &file_name_of(wav_path)),
        ];
        self.upload_multipart(&url, &parts)
    }

    /// New voice message: JSON metadata, JSON recipients, then the recording.
    pub fn upload_voice_message(
        &self,
        user_id: &str,
        message_json: &str,
        recipients_json: &str,
        wav_path: &Path,
    ) -> CallResult {
        let url = self.server().url(&format!("messages?userobjectid={user_id}"));
        if user_id.trim().is_empty() || recipients_json.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Post, &url, ValidationError::Empty("user id or recipients"));
        }
        let audio = match read_wav(wav_path) {
            Ok(bytes) => bytes,
            Err(e) => return CallResult::invalid(HttpMethod::Post, &url, e),
        };
        let parts = [
            MultipartPart::json(message_json),
            MultipartPart::json(recipients_json),
            MultipartPart::wav(audio, &file_name_of(wav_path)),
        ];
        self.upload_multipart(&url, &parts)
    }

    /// New voice message referencing audio already on the server (a stream
    /// file or a CUTI recording) by resource id.
    pub fn create_message_from_resource(
        &self,
        user_id: &str,
        message_json: &str,
        recipients_json: &str,
        resource_id: &str,
    ) -> CallResult {
        let url = self.server().url(&format!("messages?userobjectid={user_id}"));
        if user_id.trim().is_empty() || resource_id.trim().is_empty() {
            return CallResult::invalid(HttpMethod::Post, &url, ValidationError::Empty("user id or resource id"));
        }
        let control = match codec::to_xml_body("CallControl", &play_control(resource_id, 100, 100, 0)) {
            Ok(xml) => xml,
            Err(e) => {
                let mut res = CallResult::for_request(HttpMethod::Post, &url, "");
                res.fail(FailureKind::Validation, format!("could not build resource part: {e}"));
                return res;
            }
        };
        let parts = [
            MultipartPart::json(message_json),
            MultipartPart::json(recipients_json),
            MultipartPart::xml(&control),
        ];
        self.upload_multipart(&url, &parts)
    }
}

/// CUTI call-control properties that reference a stream resource.
pub(crate) fn play_control(resource_id: &str, volume: u32, speed: u32, start_ms: u64) -> PropertyList {
    let mut props = PropertyList::new();
    props
        .add("op", "PLAY")
        .add("resourceType", "STREAM")
        .add("resourceId", resource_id)
        .add("lastResult", "0")
        .add("speed", speed)
        .add("volume", volume)
        .add("startPosition", start_ms);
    props
}
