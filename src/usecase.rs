//! The closed set of use cases the gateway routes between, plus the input
//! modalities callers may hint at.
//!
//! Use cases are a code-level enumeration on purpose: the routing tables,
//! classifier signals, and backend defaults are all keyed by them, and adding
//! a case is a deliberate code change rather than a config edit.

use serde::{Deserialize, Serialize};

/// A routing category. Every request resolves to exactly one of these.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum UseCase {
    /// General text generation, reasoning, and code — the safe fallback.
    Agent,
    /// Talking-head / lip-sync avatar generation.
    Avatar,
    /// Speech-to-text transcription.
    Stt,
    /// Text-to-speech synthesis.
    Tts,
    /// Image + text understanding.
    Multimodal,
    /// Video understanding and description.
    Video,
}

impl UseCase {
    /// All use cases, in lexicographic order of their wire names.
    ///
    /// The order matters: classifier ties are broken by taking the first
    /// match in this slice.
    pub const ALL: [UseCase; 6] = [
        UseCase::Agent,
        UseCase::Avatar,
        UseCase::Multimodal,
        UseCase::Stt,
        UseCase::Tts,
        UseCase::Video,
    ];

    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Avatar => "avatar",
            Self::Stt => "stt",
            Self::Tts => "tts",
            Self::Multimodal => "multimodal",
            Self::Video => "video",
        }
    }

    /// Human description surfaced by `GET /use-cases`.
    pub fn description(self) -> &'static str {
        match self {
            Self::Agent => "General text generation, code, and reasoning",
            Self::Avatar => "Talking-head avatar and lip-sync generation",
            Self::Stt => "Speech-to-text transcription",
            Self::Tts => "Text-to-speech synthesis",
            Self::Multimodal => "Image and text understanding",
            Self::Video => "Video understanding and description",
        }
    }

    /// Backend key this use case routes to when no `[use_cases.<name>]`
    /// override is configured.
    ///
    /// `avatar`, `multimodal`, and `video` intentionally share the `vision`
    /// key — they are served by the same vision-language backend in the
    /// default deployment. Splitting them is a config choice.
    pub fn default_backend_key(self) -> &'static str {
        match self {
            Self::Agent => "text-gen",
            Self::Stt => "speech",
            Self::Tts => "voice",
            Self::Avatar | Self::Multimodal | Self::Video => "vision",
        }
    }

    /// Model identifier used when the resolved backend does not name one.
    pub fn default_model_id(self) -> &'static str {
        match self {
            Self::Agent => "qwen2.5-7b-instruct",
            Self::Stt => "whisper-large-v3",
            Self::Tts => "kokoro-82m",
            Self::Avatar | Self::Multimodal | Self::Video => "qwen2.5-vl-7b-instruct",
        }
    }

    /// Input modalities that bias toward this use case.
    pub fn modality_affinity(self) -> &'static [Modality] {
        match self {
            Self::Agent => &[Modality::Text],
            Self::Avatar => &[Modality::Image, Modality::Video],
            Self::Stt => &[Modality::Audio],
            Self::Tts => &[Modality::Text, Modality::Audio],
            Self::Multimodal => &[Modality::Image],
            Self::Video => &[Modality::Video],
        }
    }
}

impl std::fmt::Display for UseCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied input modality hint. Never trusted as ground truth —
/// it only biases classification.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    /// No usable hint. Not accepted on the wire; requests omitting the
    /// field default to [`Modality::Text`].
    #[serde(skip_deserializing)]
    Unknown,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
