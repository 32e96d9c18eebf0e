//! Subtitle-model construction: normalized utterances → SSOT #1.
//!
//! A pure transformation plus one side effect: every speaker seen in the
//! episode is registered in the show-level `speaker_to_role.json` so a
//! human can assign roles between runs. Existing assignments are never
//! overwritten.

use std::path::Path;

use crate::error::DubResult;
use crate::model::{
    AudioInfo, Cue, NormalizedUtterance, SchemaInfo, SourceText, SpeakerInfo, SpeakerToRole,
    SubtitleModel, SubtitleUtterance, SUBTITLE_SCHEMA_NAME, SUBTITLE_SCHEMA_VERSION,
    read_document,
};
use crate::workspace::write_json_atomic;

/// Build the subtitle model. Each utterance starts with a single cue
/// covering its full span; downstream realignment may replace the cues.
#[must_use]
pub fn build_subtitle_model(
    utterances: &[NormalizedUtterance],
    lang: &str,
    duration_ms: u64,
) -> SubtitleModel {
    let subtitle_utterances = utterances
        .iter()
        .map(|utt| SubtitleUtterance {
            utt_id: utt.utt_id.clone(),
            speaker: SpeakerInfo {
                id: utt.speaker_id.clone(),
                gender: utt.gender,
                speech_rate: speech_rate(utt),
                emotion: utt.emotion.clone(),
            },
            start_ms: utt.start_ms,
            end_ms: utt.end_ms,
            text: utt.text.clone(),
            cues: vec![Cue {
                start_ms: utt.start_ms,
                end_ms: utt.end_ms,
                source: SourceText {
                    lang: lang.to_owned(),
                    text: utt.text.clone(),
                },
            }],
        })
        .collect();

    SubtitleModel {
        schema: SchemaInfo {
            name: SUBTITLE_SCHEMA_NAME.to_owned(),
            version: SUBTITLE_SCHEMA_VERSION.to_owned(),
        },
        audio: AudioInfo {
            lang: lang.to_owned(),
            duration_ms,
        },
        utterances: subtitle_utterances,
    }
}

/// Source-language tokens per second over the spoken span, used by the
/// translator to pick its length coefficient.
fn speech_rate(utt: &NormalizedUtterance) -> Option<f64> {
    let span_ms = utt.end_ms.saturating_sub(utt.start_ms);
    if span_ms == 0 {
        return None;
    }
    let tokens: usize = utt
        .words
        .iter()
        .map(|w| w.text.chars().filter(|c| !c.is_whitespace()).count())
        .sum();
    if tokens == 0 {
        return None;
    }
    Some(tokens as f64 * 1_000.0 / span_ms as f64)
}

/// Ensure every speaker of this episode has an entry in the show-level
/// registry, creating the file on first use. Existing role assignments are
/// preserved; new speakers get an empty role string. Returns how many
/// speakers were added.
///
/// Callers hold the workspace lock, so plain read-modify-write with an
/// atomic replace is safe here.
pub fn update_speaker_registry(
    path: &Path,
    episode_id: &str,
    speakers: &[String],
) -> DubResult<usize> {
    let mut registry: SpeakerToRole = if path.exists() {
        read_document(path, "voices.speaker_to_role")?
    } else {
        SpeakerToRole::default()
    };

    let episode = registry.episodes.entry(episode_id.to_owned()).or_default();
    let mut added = 0;
    for speaker in speakers {
        if !episode.contains_key(speaker) {
            episode.insert(speaker.clone(), String::new());
            added += 1;
        }
    }

    write_json_atomic(path, &registry)?;
    if added > 0 {
        tracing::info!(episode = episode_id, added, "registered new speakers");
    }
    Ok(added)
}
