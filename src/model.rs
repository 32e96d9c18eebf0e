//! The documents that flow through the pipeline.
//!
//! Three of them are authoritative and may be hand-edited between runs: the
//! raw recognition response, the subtitle model, and the dub model. The
//! rest are derived and recreated whenever their phase reruns. No document
//! is ever mutated in place by a consumer.
//!
//! The recognition response is provider JSON persisted verbatim; only the
//! fields the normalizer needs are parsed out here (a narrow view over
//! `serde_json::Value`; unknown fields stay on disk for human inspection).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DubError, DubResult};

// ---------------------------------------------------------------------------
// Shared scalar types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Self::Male,
            "female" | "f" => Self::Female,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognized word with its timing and speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub speaker_id: String,
}

// ---------------------------------------------------------------------------
// Narrow view over the raw recognition response
// ---------------------------------------------------------------------------

/// A provider-level utterance: carries the punctuated text the word stream
/// lacks, plus optional per-utterance emotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUtterance {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub speaker_id: String,
    pub emotion: Option<String>,
}

/// Everything the pipeline reads out of the raw response.
#[derive(Debug, Clone)]
pub struct RecognitionDoc {
    pub words: Vec<Word>,
    pub utterances: Vec<ProviderUtterance>,
    /// Ground truth for speaker gender, taken from the response itself.
    pub speaker_genders: BTreeMap<String, Gender>,
    pub duration_ms: u64,
}

/// Normalize a provider speaker label into a stable id (`"1"` → `"spk_1"`).
#[must_use]
pub fn normalize_speaker_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "spk_0".to_owned();
    }
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("spk_{trimmed}")
    } else {
        trimmed.to_owned()
    }
}

/// Parse the fields the normalizer needs out of the raw provider JSON.
///
/// Expected shape (extra fields are ignored, not rejected):
/// ```json
/// {
///   "audio_info": { "duration": 183000 },
///   "result": {
///     "utterances": [{
///       "start_time": 0, "end_time": 1200, "text": "你好，世界。",
///       "additions": { "speaker": "1", "gender": "female", "emotion": "neutral" },
///       "words": [{ "start_time": 0, "end_time": 500, "text": "你好" }, ...]
///     }]
///   }
/// }
/// ```
pub fn parse_recognition(raw: &Value) -> DubResult<RecognitionDoc> {
    if !raw.is_object() {
        return Err(DubError::InvalidDocument {
            artifact: "source.recognition_raw".to_owned(),
            message: "root is not a JSON object".to_owned(),
        });
    }

    let raw_utterances = raw
        .pointer("/result/utterances")
        .and_then(Value::as_array)
        .ok_or_else(|| DubError::InvalidDocument {
            artifact: "source.recognition_raw".to_owned(),
            message: "missing result.utterances array".to_owned(),
        })?;

    let mut words = Vec::new();
    let mut utterances = Vec::new();
    let mut gender_votes: BTreeMap<String, BTreeMap<Gender, usize>> = BTreeMap::new();

    for utt in raw_utterances {
        let additions = utt.get("additions").cloned().unwrap_or(Value::Null);
        let speaker_id = normalize_speaker_id(
            additions
                .get("speaker")
                .map(json_as_string)
                .unwrap_or_default()
                .as_str(),
        );
        let start_ms = json_as_ms(utt.get("start_time"));
        let end_ms = json_as_ms(utt.get("end_time")).max(start_ms);
        let text = utt
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_owned();

        if let Some(gender) = additions.get("gender").and_then(Value::as_str) {
            *gender_votes
                .entry(speaker_id.clone())
                .or_default()
                .entry(Gender::parse(gender))
                .or_default() += 1;
        }

        let emotion = additions
            .get("emotion")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .filter(|e| !e.is_empty());

        if !text.is_empty() {
            utterances.push(ProviderUtterance {
                start_ms,
                end_ms,
                text,
                speaker_id: speaker_id.clone(),
                emotion,
            });
        }

        if let Some(word_list) = utt.get("words").and_then(Value::as_array) {
            for w in word_list {
                let word_text = w
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_owned();
                if word_text.is_empty() {
                    continue;
                }
                let w_start = json_as_ms(w.get("start_time"));
                let w_end = json_as_ms(w.get("end_time")).max(w_start);
                let w_speaker = w
                    .pointer("/additions/speaker")
                    .map(json_as_string)
                    .filter(|s| !s.is_empty())
                    .map(|s| normalize_speaker_id(&s))
                    .unwrap_or_else(|| speaker_id.clone());
                words.push(Word {
                    start_ms: w_start,
                    end_ms: w_end,
                    text: word_text,
                    speaker_id: w_speaker,
                });
            }
        }
    }

    if words.is_empty() {
        return Err(DubError::InvalidDocument {
            artifact: "source.recognition_raw".to_owned(),
            message: "response carries no word-level timings".to_owned(),
        });
    }

    words.sort_by_key(|w| (w.start_ms, w.end_ms));
    utterances.sort_by_key(|u| (u.start_ms, u.end_ms));

    let speaker_genders = gender_votes
        .into_iter()
        .map(|(speaker, votes)| {
            let gender = votes
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(g, _)| g)
                .unwrap_or(Gender::Unknown);
            (speaker, gender)
        })
        .collect();

    let duration_ms = raw
        .pointer("/audio_info/duration")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| words.last().map(|w| w.end_ms).unwrap_or(0));

    Ok(RecognitionDoc {
        words,
        utterances,
        speaker_genders,
        duration_ms,
    })
}

fn json_as_ms(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

fn json_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Normalized utterances (transient)
// ---------------------------------------------------------------------------

/// Output of the utterance normalizer; consumed by the subtitle builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUtterance {
    pub utt_id: String,
    pub speaker_id: String,
    pub gender: Gender,
    pub emotion: Option<String>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub words: Vec<Word>,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Subtitle model (SSOT #1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub lang: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub id: String,
    pub gender: Gender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceText {
    pub lang: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub source: SourceText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleUtterance {
    pub utt_id: String,
    pub speaker: SpeakerInfo,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub cues: Vec<Cue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleModel {
    pub schema: SchemaInfo,
    pub audio: AudioInfo,
    pub utterances: Vec<SubtitleUtterance>,
}

pub const SUBTITLE_SCHEMA_NAME: &str = "subtitle.model";
pub const SUBTITLE_SCHEMA_VERSION: &str = "1";

impl SubtitleModel {
    /// Structural invariants: ordering by start, sane spans, and no overlap
    /// within a single speaker.
    pub fn validate(&self) -> DubResult<()> {
        let invalid = |message: String| DubError::InvalidDocument {
            artifact: "source.subtitle_model".to_owned(),
            message,
        };

        let mut last_start = 0u64;
        let mut last_end_by_speaker: BTreeMap<&str, u64> = BTreeMap::new();
        for utt in &self.utterances {
            if utt.start_ms >= utt.end_ms {
                return Err(invalid(format!(
                    "{}: start_ms {} is not before end_ms {}",
                    utt.utt_id, utt.start_ms, utt.end_ms
                )));
            }
            if utt.start_ms < last_start {
                return Err(invalid(format!(
                    "{}: utterances are not ordered by start_ms",
                    utt.utt_id
                )));
            }
            last_start = utt.start_ms;

            if let Some(prev_end) = last_end_by_speaker.get(utt.speaker.id.as_str()) {
                if utt.start_ms < *prev_end {
                    return Err(invalid(format!(
                        "{}: overlaps previous utterance of speaker {}",
                        utt.utt_id, utt.speaker.id
                    )));
                }
            }
            last_end_by_speaker.insert(utt.speaker.id.as_str(), utt.end_ms);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dub model (SSOT #2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsPolicy {
    pub max_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DubUtterance {
    pub utt_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub budget_ms: u64,
    pub text_source: String,
    pub text_target: String,
    pub speaker_id: String,
    pub gender: Gender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    pub tts_policy: TtsPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DubModel {
    pub audio_duration_ms: u64,
    pub utterances: Vec<DubUtterance>,
}

impl DubModel {
    pub fn validate(&self) -> DubResult<()> {
        let invalid = |message: String| DubError::InvalidDocument {
            artifact: "source.dub_model".to_owned(),
            message,
        };

        for pair in self.utterances.windows(2) {
            if pair[0].end_ms > pair[1].start_ms {
                return Err(invalid(format!(
                    "{} ends at {} past the start of {} ({})",
                    pair[0].utt_id, pair[0].end_ms, pair[1].utt_id, pair[1].start_ms
                )));
            }
        }
        for utt in &self.utterances {
            if utt.budget_ms != utt.end_ms.saturating_sub(utt.start_ms) {
                return Err(invalid(format!(
                    "{}: budget_ms {} != end_ms - start_ms",
                    utt.utt_id, utt.budget_ms
                )));
            }
            if !(1.0..=1.5).contains(&utt.tts_policy.max_rate) {
                return Err(invalid(format!(
                    "{}: max_rate {} outside [1.0, 1.5]",
                    utt.utt_id, utt.tts_policy.max_rate
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Derived documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub utt_id: String,
    pub wav_path: String,
    pub voice_id: String,
    pub duration_ms: u64,
    pub rate: f64,
    pub content_hash: String,
    pub status: SegmentStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentIndex {
    pub segments: BTreeMap<String, SegmentRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceSource {
    Mapped,
    GenderFallback,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceChoice {
    pub role_id: String,
    pub voice_id: String,
    pub source: VoiceSource,
}

/// Persisted so later runs can audit which resolution branch was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceAssignment {
    pub speakers: BTreeMap<String, VoiceChoice>,
}

// ---------------------------------------------------------------------------
// Show-level registries
// ---------------------------------------------------------------------------

pub const SPEAKER_TO_ROLE_SCHEMA: &str = "speaker_to_role.v1";

/// `speaker_to_role.json`: per-episode speaker → role assignments plus
/// gender fallbacks. Hand-maintained; the subtitle phase only appends new
/// speakers with empty role strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerToRole {
    pub schema: String,
    pub episodes: BTreeMap<String, BTreeMap<String, String>>,
    pub default_roles: BTreeMap<String, String>,
}

impl Default for SpeakerToRole {
    fn default() -> Self {
        Self {
            schema: SPEAKER_TO_ROLE_SCHEMA.to_owned(),
            episodes: BTreeMap::new(),
            default_roles: BTreeMap::from([
                ("male".to_owned(), String::new()),
                ("female".to_owned(), String::new()),
                ("unknown".to_owned(), String::new()),
            ]),
        }
    }
}

/// `role_cast.json`: role → provider voice id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCast {
    pub roles: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Document IO
// ---------------------------------------------------------------------------

/// Read and parse a JSON document, mapping parse failures to the input
/// error taxonomy with the artifact key attached.
pub fn read_document<T: serde::de::DeserializeOwned>(path: &Path, artifact: &str) -> DubResult<T> {
    let body = std::fs::read_to_string(path).map_err(|_| DubError::MissingArtifact {
        key: artifact.to_owned(),
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&body).map_err(|e| DubError::InvalidDocument {
        artifact: artifact.to_owned(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw_response() -> Value {
        json!({
            "audio_info": { "duration": 12_000 },
            "result": {
                "utterances": [
                    {
                        "start_time": 0,
                        "end_time": 1_200,
                        "text": "你好，世界。",
                        "additions": { "speaker": "1", "gender": "female", "emotion": "happy" },
                        "words": [
                            { "start_time": 0, "end_time": 500, "text": "你好" },
                            { "start_time": 510, "end_time": 1_200, "text": "世界" },
                        ]
                    },
                    {
                        "start_time": 2_000,
                        "end_time": 2_800,
                        "text": "走吧",
                        "additions": { "speaker": "2", "gender": "male" },
                        "words": [
                            { "start_time": 2_000, "end_time": 2_800, "text": "走吧" },
                        ]
                    }
                ]
            },
            "provider_specific": { "kept": "verbatim on disk, ignored here" }
        })
    }

    #[test]
    fn parses_words_and_speakers_narrowly() {
        let doc = parse_recognition(&raw_response()).unwrap();
        assert_eq!(doc.words.len(), 3);
        assert_eq!(doc.words[0].speaker_id, "spk_1");
        assert_eq!(doc.words[2].speaker_id, "spk_2");
        assert_eq!(doc.duration_ms, 12_000);
        assert_eq!(doc.utterances.len(), 2);
        assert_eq!(doc.utterances[0].text, "你好，世界。");
        assert_eq!(doc.utterances[0].emotion.as_deref(), Some("happy"));
    }

    #[test]
    fn gender_map_comes_from_the_response() {
        let doc = parse_recognition(&raw_response()).unwrap();
        assert_eq!(doc.speaker_genders["spk_1"], Gender::Female);
        assert_eq!(doc.speaker_genders["spk_2"], Gender::Male);
    }

    #[test]
    fn gender_votes_take_the_majority() {
        let raw = json!({
            "result": { "utterances": [
                { "start_time": 0, "end_time": 100, "text": "a",
                  "additions": { "speaker": "1", "gender": "male" },
                  "words": [{ "start_time": 0, "end_time": 100, "text": "a" }] },
                { "start_time": 200, "end_time": 300, "text": "b",
                  "additions": { "speaker": "1", "gender": "female" },
                  "words": [{ "start_time": 200, "end_time": 300, "text": "b" }] },
                { "start_time": 400, "end_time": 500, "text": "c",
                  "additions": { "speaker": "1", "gender": "female" },
                  "words": [{ "start_time": 400, "end_time": 500, "text": "c" }] },
            ]}
        });
        let doc = parse_recognition(&raw).unwrap();
        assert_eq!(doc.speaker_genders["spk_1"], Gender::Female);
    }

    #[test]
    fn missing_words_is_an_input_error() {
        let raw = json!({ "result": { "utterances": [
            { "start_time": 0, "end_time": 100, "text": "no words here" }
        ]}});
        let err = parse_recognition(&raw).unwrap_err();
        assert!(matches!(err, DubError::InvalidDocument { .. }));
    }

    #[test]
    fn non_object_root_is_rejected() {
        assert!(parse_recognition(&json!([1, 2, 3])).is_err());
        assert!(parse_recognition(&json!(null)).is_err());
    }

    #[test]
    fn duration_falls_back_to_last_word_end() {
        let raw = json!({ "result": { "utterances": [
            { "start_time": 0, "end_time": 900, "text": "好",
              "additions": { "speaker": "1" },
              "words": [{ "start_time": 0, "end_time": 900, "text": "好" }] }
        ]}});
        let doc = parse_recognition(&raw).unwrap();
        assert_eq!(doc.duration_ms, 900);
    }

    #[test]
    fn speaker_ids_are_normalized() {
        assert_eq!(normalize_speaker_id("1"), "spk_1");
        assert_eq!(normalize_speaker_id("spk_7"), "spk_7");
        assert_eq!(normalize_speaker_id(""), "spk_0");
        assert_eq!(normalize_speaker_id(" 42 "), "spk_42");
    }

    #[test]
    fn subtitle_model_rejects_same_speaker_overlap() {
        let speaker = SpeakerInfo {
            id: "spk_1".to_owned(),
            gender: Gender::Female,
            speech_rate: None,
            emotion: None,
        };
        let utt = |id: &str, start: u64, end: u64| SubtitleUtterance {
            utt_id: id.to_owned(),
            speaker: speaker.clone(),
            start_ms: start,
            end_ms: end,
            text: "x".to_owned(),
            cues: vec![],
        };
        let model = SubtitleModel {
            schema: SchemaInfo {
                name: SUBTITLE_SCHEMA_NAME.to_owned(),
                version: SUBTITLE_SCHEMA_VERSION.to_owned(),
            },
            audio: AudioInfo {
                lang: "zh".to_owned(),
                duration_ms: 5_000,
            },
            utterances: vec![utt("utt_0001", 0, 1_000), utt("utt_0002", 900, 2_000)],
        };
        assert!(model.validate().is_err());
    }

    #[test]
    fn subtitle_model_allows_cross_speaker_overlap() {
        let speaker = |id: &str| SpeakerInfo {
            id: id.to_owned(),
            gender: Gender::Unknown,
            speech_rate: None,
            emotion: None,
        };
        let model = SubtitleModel {
            schema: SchemaInfo {
                name: SUBTITLE_SCHEMA_NAME.to_owned(),
                version: SUBTITLE_SCHEMA_VERSION.to_owned(),
            },
            audio: AudioInfo {
                lang: "zh".to_owned(),
                duration_ms: 5_000,
            },
            utterances: vec![
                SubtitleUtterance {
                    utt_id: "utt_0001".to_owned(),
                    speaker: speaker("spk_1"),
                    start_ms: 0,
                    end_ms: 1_000,
                    text: "a".to_owned(),
                    cues: vec![],
                },
                SubtitleUtterance {
                    utt_id: "utt_0002".to_owned(),
                    speaker: speaker("spk_2"),
                    start_ms: 800,
                    end_ms: 1_500,
                    text: "b".to_owned(),
                    cues: vec![],
                },
            ],
        };
        model.validate().expect("cross-speaker overlap is allowed");
    }

    #[test]
    fn dub_model_enforces_budget_arithmetic_and_rate_bounds() {
        let utt = DubUtterance {
            utt_id: "utt_0001".to_owned(),
            start_ms: 1_000,
            end_ms: 2_000,
            budget_ms: 999,
            text_source: "你好".to_owned(),
            text_target: "Hello".to_owned(),
            speaker_id: "spk_1".to_owned(),
            gender: Gender::Female,
            emotion: None,
            tts_policy: TtsPolicy { max_rate: 1.3 },
        };
        let model = DubModel {
            audio_duration_ms: 10_000,
            utterances: vec![utt.clone()],
        };
        assert!(model.validate().is_err(), "budget mismatch must fail");

        let model = DubModel {
            audio_duration_ms: 10_000,
            utterances: vec![DubUtterance {
                budget_ms: 1_000,
                tts_policy: TtsPolicy { max_rate: 1.8 },
                ..utt
            }],
        };
        assert!(model.validate().is_err(), "max_rate above 1.5 must fail");
    }

    #[test]
    fn dub_model_rejects_adjacent_overlap() {
        let utt = |id: &str, start: u64, end: u64| DubUtterance {
            utt_id: id.to_owned(),
            start_ms: start,
            end_ms: end,
            budget_ms: end - start,
            text_source: String::new(),
            text_target: String::new(),
            speaker_id: "spk_1".to_owned(),
            gender: Gender::Unknown,
            emotion: None,
            tts_policy: TtsPolicy { max_rate: 1.3 },
        };
        let model = DubModel {
            audio_duration_ms: 10_000,
            utterances: vec![utt("utt_0001", 0, 1_100), utt("utt_0002", 1_000, 2_000)],
        };
        assert!(model.validate().is_err());
    }

    #[test]
    fn speaker_to_role_default_has_gender_fallback_slots() {
        let registry = SpeakerToRole::default();
        assert!(registry.default_roles.contains_key("male"));
        assert!(registry.default_roles.contains_key("female"));
        assert!(registry.default_roles.contains_key("unknown"));
    }

    #[test]
    fn read_document_distinguishes_missing_from_malformed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("gone.json");
        let err = read_document::<DubModel>(&missing, "source.dub_model").unwrap_err();
        assert!(matches!(err, DubError::MissingArtifact { .. }));

        let malformed = dir.path().join("bad.json");
        std::fs::write(&malformed, "{").unwrap();
        let err = read_document::<DubModel>(&malformed, "source.dub_model").unwrap_err();
        assert!(matches!(err, DubError::InvalidDocument { .. }));
    }
}
