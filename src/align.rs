//! Time alignment: subtitle model + translations → dub model (SSOT #2).
//!
//! No model calls happen here. Each utterance keeps its time skeleton;
//! `end_ms` may be extended by a bounded amount when the estimated target
//! duration overruns the budget, but never past the next utterance's
//! start. Cues are rebuilt from the target text in character-proportional
//! fragments that never cross an utterance boundary.

use std::collections::BTreeMap;

use crate::config::AlignSettings;
use crate::error::DubResult;
use crate::model::{
    Cue, DubModel, DubUtterance, SchemaInfo, SourceText, SubtitleModel, TtsPolicy,
};
use crate::translate::{TranslationRecord, estimate_duration_ms};

pub const ALIGN_SCHEMA_NAME: &str = "subtitle.align";

/// Build the dub model and the realigned subtitle document (target-language
/// cues on the same time skeleton).
pub fn build_dub_model(
    model: &SubtitleModel,
    translations: &[TranslationRecord],
    settings: &AlignSettings,
    chars_per_second: f64,
) -> DubResult<(DubModel, SubtitleModel)> {
    let by_id: BTreeMap<&str, &TranslationRecord> = translations
        .iter()
        .map(|t| (t.utt_id.as_str(), t))
        .collect();

    let max_rate = settings.max_rate.clamp(1.0, 1.5);
    let mut dub_utterances = Vec::new();
    let mut aligned_utterances = Vec::new();

    for (idx, utt) in model.utterances.iter().enumerate() {
        let Some(translation) = by_id.get(utt.utt_id.as_str()) else {
            tracing::warn!(utt_id = %utt.utt_id, "no translation, dropping from dub model");
            continue;
        };
        if translation.target.trim().is_empty() {
            tracing::warn!(utt_id = %utt.utt_id, "empty translation, dropping from dub model");
            continue;
        }

        let budget_ms = utt.end_ms.saturating_sub(utt.start_ms);
        let estimated_ms = estimate_duration_ms(&translation.target, chars_per_second);

        let next_start = model.utterances.get(idx + 1).map(|n| n.start_ms);
        let end_ms = extend_end(
            utt.end_ms,
            budget_ms,
            estimated_ms,
            next_start,
            settings.max_extend_ms,
        );

        let cues = split_cues(
            &translation.target,
            utt.start_ms,
            end_ms,
            settings.cue_chars,
            "en",
        );

        aligned_utterances.push(crate::model::SubtitleUtterance {
            utt_id: utt.utt_id.clone(),
            speaker: utt.speaker.clone(),
            start_ms: utt.start_ms,
            end_ms,
            text: translation.target.clone(),
            cues,
        });

        dub_utterances.push(DubUtterance {
            utt_id: utt.utt_id.clone(),
            start_ms: utt.start_ms,
            end_ms,
            budget_ms: end_ms.saturating_sub(utt.start_ms),
            text_source: utt.text.clone(),
            text_target: translation.target.clone(),
            speaker_id: utt.speaker.id.clone(),
            gender: utt.speaker.gender,
            emotion: utt.speaker.emotion.clone(),
            tts_policy: TtsPolicy { max_rate },
        });
    }

    let dub = DubModel {
        audio_duration_ms: model.audio.duration_ms,
        utterances: dub_utterances,
    };
    dub.validate()?;

    let aligned = SubtitleModel {
        schema: SchemaInfo {
            name: ALIGN_SCHEMA_NAME.to_owned(),
            version: model.schema.version.clone(),
        },
        audio: model.audio.clone(),
        utterances: aligned_utterances,
    };

    Ok((dub, aligned))
}

/// Extend `end_ms` by what the overrun needs, capped by the extension
/// limit and by the next utterance's start.
fn extend_end(
    end_ms: u64,
    budget_ms: u64,
    estimated_ms: u64,
    next_start_ms: Option<u64>,
    max_extend_ms: u64,
) -> u64 {
    if estimated_ms <= budget_ms {
        return end_ms;
    }
    let need = estimated_ms - budget_ms;
    let mut extend = need.min(max_extend_ms);
    if let Some(next_start) = next_start_ms {
        extend = extend.min(next_start.saturating_sub(end_ms));
    }
    end_ms + extend
}

/// Split target text into cue fragments of at most `cue_chars` characters,
/// allocated time-proportionally within `[start_ms, end_ms]`. Fragments
/// break on whitespace; a single overlong word is split hard.
#[must_use]
pub fn split_cues(
    text: &str,
    start_ms: u64,
    end_ms: u64,
    cue_chars: usize,
    lang: &str,
) -> Vec<Cue> {
    let fragments = split_fragments(text, cue_chars.max(1));
    if fragments.is_empty() {
        return Vec::new();
    }

    let span = end_ms.saturating_sub(start_ms);
    let total_chars: usize = fragments.iter().map(|f| f.chars().count()).sum();
    let mut cues = Vec::with_capacity(fragments.len());
    let mut consumed_chars = 0usize;
    let mut cursor = start_ms;

    for (idx, fragment) in fragments.iter().enumerate() {
        consumed_chars += fragment.chars().count();
        let cue_end = if idx == fragments.len() - 1 {
            end_ms
        } else {
            start_ms + (span as f64 * consumed_chars as f64 / total_chars as f64).round() as u64
        };
        cues.push(Cue {
            start_ms: cursor,
            end_ms: cue_end.max(cursor),
            source: SourceText {
                lang: lang.to_owned(),
                text: fragment.clone(),
            },
        });
        cursor = cue_end;
    }
    cues
}

fn split_fragments(text: &str, cue_chars: usize) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();

        if word_len > cue_chars {
            if !current.is_empty() {
                fragments.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for chunk in chars.chunks(cue_chars) {
                fragments.push(chunk.iter().collect());
            }
            continue;
        }

        let sep = usize::from(!current.is_empty());
        if current_len + sep + word_len > cue_chars && !current.is_empty() {
            fragments.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}
