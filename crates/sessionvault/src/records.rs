//! Record models: sessions with their chunked arrays, notes, and tasks.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Interrupted => "interrupted",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "interrupted" => Ok(SessionStatus::Interrupted),
            other => Err(StorageError::InvalidRecord(format!("unknown session status '{}'", other))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Array fields stored as fixed-size chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkedField {
    Screenshots,
    AudioSegments,
    VideoChunks,
}

impl ChunkedField {
    pub const ALL: [ChunkedField; 3] = [
        ChunkedField::Screenshots,
        ChunkedField::AudioSegments,
        ChunkedField::VideoChunks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkedField::Screenshots => "screenshots",
            ChunkedField::AudioSegments => "audio_segments",
            ChunkedField::VideoChunks => "video_chunks",
        }
    }
}

impl fmt::Display for ChunkedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Small per-session values stored under their own keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailField {
    Summary,
    AudioInsights,
    Transcript,
    CanvasSpec,
    Video,
    Notes,
}

impl DetailField {
    pub const ALL: [DetailField; 6] = [
        DetailField::Summary,
        DetailField::AudioInsights,
        DetailField::Transcript,
        DetailField::CanvasSpec,
        DetailField::Video,
        DetailField::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetailField::Summary => "summary",
            DetailField::AudioInsights => "audio_insights",
            DetailField::Transcript => "transcript",
            DetailField::CanvasSpec => "canvas_spec",
            DetailField::Video => "video",
            DetailField::Notes => "notes",
        }
    }
}

/// `chunk_count == ceil(count / chunk_size)`; only the last chunk may be partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub count: usize,
    pub chunk_count: usize,
    pub chunk_size: usize,
}

impl ChunkManifest {
    pub fn empty(chunk_size: usize) -> Self {
        Self::for_count(0, chunk_size)
    }

    pub fn for_count(count: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            count,
            chunk_count: count.div_ceil(chunk_size),
            chunk_size,
        }
    }

    /// Chunk that receives the next appended item.
    pub fn append_target(&self) -> usize {
        self.count / self.chunk_size.max(1)
    }

    pub fn record_append(&mut self) {
        *self = Self::for_count(self.count + 1, self.chunk_size);
    }

    pub fn is_consistent(&self) -> bool {
        self.chunk_size > 0 && self.chunk_count == self.count.div_ceil(self.chunk_size)
    }

    /// Expected item count of chunk `index`.
    pub fn expected_len(&self, index: usize) -> usize {
        if index >= self.chunk_count {
            return 0;
        }
        (self.count - index * self.chunk_size).min(self.chunk_size)
    }
}

/// Session identity and search facets, shared by the metadata and the full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub topic_ids: Vec<String>,
    #[serde(default)]
    pub company_ids: Vec<String>,
    #[serde(default)]
    pub contact_ids: Vec<String>,
}

impl SessionInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            status: SessionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            category: None,
            sub_category: None,
            tags: Vec::new(),
            topic_ids: Vec::new(),
            company_ids: Vec::new(),
            contact_ids: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(StorageError::InvalidRecord(format!(
                    "session {} ends before it starts",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Always-resident summary of one session. Never holds the large arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub screenshots: ChunkManifest,
    pub audio_segments: ChunkManifest,
    pub video_chunks: ChunkManifest,
    #[serde(default)]
    pub has_summary: bool,
    #[serde(default)]
    pub has_audio_insights: bool,
    #[serde(default)]
    pub has_transcript: bool,
    #[serde(default)]
    pub has_canvas_spec: bool,
    #[serde(default)]
    pub has_video: bool,
    #[serde(default)]
    pub has_notes: bool,
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl SessionMetadata {
    pub fn new(info: SessionInfo, chunks: &crate::config::ChunkConfig) -> Self {
        Self {
            info,
            screenshots: ChunkManifest::empty(chunks.screenshots),
            audio_segments: ChunkManifest::empty(chunks.audio_segments),
            video_chunks: ChunkManifest::empty(chunks.video_chunks),
            has_summary: false,
            has_audio_insights: false,
            has_transcript: false,
            has_canvas_spec: false,
            has_video: false,
            has_notes: false,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn manifest(&self, field: ChunkedField) -> &ChunkManifest {
        match field {
            ChunkedField::Screenshots => &self.screenshots,
            ChunkedField::AudioSegments => &self.audio_segments,
            ChunkedField::VideoChunks => &self.video_chunks,
        }
    }

    pub fn manifest_mut(&mut self, field: ChunkedField) -> &mut ChunkManifest {
        match field {
            ChunkedField::Screenshots => &mut self.screenshots,
            ChunkedField::AudioSegments => &mut self.audio_segments,
            ChunkedField::VideoChunks => &mut self.video_chunks,
        }
    }

    pub fn has_detail(&self, field: DetailField) -> bool {
        match field {
            DetailField::Summary => self.has_summary,
            DetailField::AudioInsights => self.has_audio_insights,
            DetailField::Transcript => self.has_transcript,
            DetailField::CanvasSpec => self.has_canvas_spec,
            DetailField::Video => self.has_video,
            DetailField::Notes => self.has_notes,
        }
    }

    pub fn set_detail(&mut self, field: DetailField, present: bool) {
        match field {
            DetailField::Summary => self.has_summary = present,
            DetailField::AudioInsights => self.has_audio_insights = present,
            DetailField::Transcript => self.has_transcript = present,
            DetailField::CanvasSpec => self.has_canvas_spec = present,
            DetailField::Video => self.has_video = present,
            DetailField::Notes => self.has_notes = present,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.info.validate()?;
        for field in ChunkedField::ALL {
            if !self.manifest(field).is_consistent() {
                return Err(StorageError::InvalidRecord(format!(
                    "session {} has inconsistent {} manifest {:?}",
                    self.info.id,
                    field,
                    self.manifest(field)
                )));
            }
        }
        Ok(())
    }

    pub fn summary_view(&self) -> SessionSummaryView {
        SessionSummaryView {
            id: self.info.id.clone(),
            name: self.info.name.clone(),
            status: self.info.status,
            start_time: self.info.start_time,
            end_time: self.info.end_time,
            duration_secs: self
                .info
                .end_time
                .map(|end| (end - self.info.start_time).num_seconds()),
            category: self.info.category.clone(),
            screenshot_count: self.screenshots.count,
            audio_segment_count: self.audio_segments.count,
            video_chunk_count: self.video_chunks.count,
            has_video: self.has_video,
            has_notes: self.has_notes,
            has_transcript: self.has_transcript,
        }
    }
}

/// List-view projection derived from the manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummaryView {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub category: Option<String>,
    pub screenshot_count: usize,
    pub audio_segment_count: usize,
    pub video_chunk_count: usize,
    pub has_video: bool,
    pub has_notes: bool,
    pub has_transcript: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    /// Content hash of the stored image.
    #[serde(default)]
    pub attachment_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub relative_time: Option<f64>,
    #[serde(default)]
    pub ai_analysis: Option<serde_json::Value>,
    /// Inline base64 image, present only until moved into the content store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSegment {
    pub id: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub attachment_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration: f64,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub transcription: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoChunk {
    pub id: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub attachment_hash: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    #[serde(default)]
    pub full_video_attachment_id: Option<String>,
    #[serde(default)]
    pub attachment_hash: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Item of a chunked array field.
pub trait ChunkItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const FIELD: ChunkedField;

    fn item_id(&self) -> &str;

    fn attachment_hash(&self) -> Option<&str>;

    /// Drop inline binary payloads. Returns whether anything was removed.
    fn strip_payload(&mut self) -> bool {
        false
    }
}

impl ChunkItem for Screenshot {
    const FIELD: ChunkedField = ChunkedField::Screenshots;

    fn item_id(&self) -> &str {
        &self.id
    }

    fn attachment_hash(&self) -> Option<&str> {
        self.attachment_hash.as_deref()
    }

    fn strip_payload(&mut self) -> bool {
        self.data.take().is_some()
    }
}

impl ChunkItem for AudioSegment {
    const FIELD: ChunkedField = ChunkedField::AudioSegments;

    fn item_id(&self) -> &str {
        &self.id
    }

    fn attachment_hash(&self) -> Option<&str> {
        self.attachment_hash.as_deref()
    }
}

impl ChunkItem for VideoChunk {
    const FIELD: ChunkedField = ChunkedField::VideoChunks;

    fn item_id(&self) -> &str {
        &self.id
    }

    fn attachment_hash(&self) -> Option<&str> {
        self.attachment_hash.as_deref()
    }
}

/// Full session as callers see it; split into metadata, chunks and details on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub info: SessionInfo,
    #[serde(default)]
    pub screenshots: Vec<Screenshot>,
    #[serde(default)]
    pub audio_segments: Vec<AudioSegment>,
    #[serde(default)]
    pub video_chunks: Vec<VideoChunk>,
    #[serde(default)]
    pub summary: Option<serde_json::Value>,
    #[serde(default)]
    pub audio_insights: Option<serde_json::Value>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub canvas_spec: Option<serde_json::Value>,
    #[serde(default)]
    pub video: Option<Video>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Session {
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info,
            screenshots: Vec::new(),
            audio_segments: Vec::new(),
            video_chunks: Vec::new(),
            summary: None,
            audio_insights: None,
            transcript: None,
            canvas_spec: None,
            video: None,
            notes: None,
        }
    }

    /// Detail values present on this record, serialized.
    pub fn details(&self) -> Result<Vec<(DetailField, serde_json::Value)>> {
        let mut out = Vec::new();
        if let Some(v) = &self.summary {
            out.push((DetailField::Summary, v.clone()));
        }
        if let Some(v) = &self.audio_insights {
            out.push((DetailField::AudioInsights, v.clone()));
        }
        if let Some(v) = self.transcript.as_ref().filter(|t| !t.is_empty()) {
            out.push((DetailField::Transcript, serde_json::Value::String(v.clone())));
        }
        if let Some(v) = &self.canvas_spec {
            out.push((DetailField::CanvasSpec, v.clone()));
        }
        if let Some(v) = &self.video {
            out.push((DetailField::Video, serde_json::to_value(v)?));
        }
        if let Some(v) = self.notes.as_ref().filter(|n| !n.is_empty()) {
            out.push((DetailField::Notes, serde_json::Value::String(v.clone())));
        }
        Ok(out)
    }

    pub fn set_detail(&mut self, field: DetailField, value: serde_json::Value) -> Result<()> {
        match field {
            DetailField::Summary => self.summary = Some(value),
            DetailField::AudioInsights => self.audio_insights = Some(value),
            DetailField::Transcript => self.transcript = value.as_str().map(str::to_string),
            DetailField::CanvasSpec => self.canvas_spec = Some(value),
            DetailField::Video => self.video = Some(serde_json::from_value(value)?),
            DetailField::Notes => self.notes = value.as_str().map(str::to_string),
        }
        Ok(())
    }

    /// Every content hash the record points at.
    pub fn attachment_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .screenshots
            .iter()
            .filter_map(|s| s.attachment_hash().map(str::to_string))
            .chain(self.audio_segments.iter().filter_map(|a| a.attachment_hash().map(str::to_string)))
            .chain(self.video_chunks.iter().filter_map(|v| v.attachment_hash().map(str::to_string)))
            .chain(self.video.iter().filter_map(|v| v.attachment_hash.clone()))
            .collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub topic_ids: Vec<String>,
    #[serde(default)]
    pub company_ids: Vec<String>,
    #[serde(default)]
    pub contact_ids: Vec<String>,
    #[serde(default)]
    pub source_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: String::new(),
            content: content.into(),
            category: None,
            tags: Vec::new(),
            topic_ids: Vec::new(),
            company_ids: Vec::new(),
            contact_ids: Vec::new(),
            source_session_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub note_id: Option<String>,
    #[serde(default)]
    pub source_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            due_date: None,
            tags: Vec::new(),
            note_id: None,
            source_session_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Single-key record stored under `<collection>/<id>`.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn entity_id(&self) -> &str;

    fn touch(&mut self);

    fn validate(&self) -> Result<()> {
        validate_id(self.entity_id())
    }
}

impl Entity for Note {
    const COLLECTION: &'static str = "notes";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Entity for Task {
    const COLLECTION: &'static str = "tasks";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        if self.title.trim().is_empty() {
            return Err(StorageError::InvalidRecord(format!("task {} has no title", self.id)));
        }
        Ok(())
    }
}

/// Ids become key segments, so they follow the key alphabet.
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidRecord(format!("invalid id '{}'", id)))
    }
}
