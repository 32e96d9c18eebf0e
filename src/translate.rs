//! Per-utterance translation into the target language.
//!
//! The prompt for each utterance is built from the utterance source text,
//! optional whole-episode context, the glossary entries whose surface form
//! occurs in *this* utterance, and a domain hint injected only when a
//! trigger token occurs. Global glossary injection is deliberately absent:
//! it cross-contaminates unrelated utterances.
//!
//! Each translation is checked against its time budget (estimated at a
//! fixed characters-per-second rate); a translation that cannot fit even
//! after the aligner's bounded extension is retried with progressively
//! stronger shortening instructions.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TranslateSettings;
use crate::error::{DubError, DubResult};
use crate::model::SubtitleModel;
use crate::runner::CancellationToken;
use crate::services::{TranslationService, retry_transient};
use crate::workspace::write_atomic;

// ---------------------------------------------------------------------------
// Glossary
// ---------------------------------------------------------------------------

/// Show-level glossary: source surface form → required target rendering.
#[derive(Debug, Clone, Default)]
pub struct Glossary {
    entries: BTreeMap<String, String>,
}

impl Glossary {
    /// Load `dict/glossary.json`. A missing file is an empty glossary; a
    /// malformed one is a config error.
    pub fn load(path: &Path) -> DubResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path)?;
        let entries: BTreeMap<String, String> = serde_json::from_str(&body)
            .map_err(|e| DubError::Config(format!("malformed glossary {}: {e}", path.display())))?;
        Ok(Self { entries })
    }

    #[must_use]
    pub fn from_entries(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Only the entries whose surface form occurs in this source text.
    #[must_use]
    pub fn subset_for(&self, source: &str) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .filter(|(term, _)| source.contains(term.as_str()))
            .map(|(term, target)| (term.as_str(), target.as_str()))
            .collect()
    }

    /// Source terms that occurred but whose required rendering is absent
    /// from the output. A violation is reported, never fatal.
    #[must_use]
    pub fn violations(&self, source: &str, output: &str) -> Vec<String> {
        let output_lower = output.to_lowercase();
        self.entries
            .iter()
            .filter(|(term, target)| {
                source.contains(term.as_str()) && !output_lower.contains(&target.to_lowercase())
            })
            .map(|(term, _)| term.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Budget estimation
// ---------------------------------------------------------------------------

/// Length coefficient from the source speech rate: fast speech leaves no
/// slack, slow speech tolerates a slightly longer rendering.
#[must_use]
pub fn rate_coefficient(tokens_per_second: Option<f64>) -> f64 {
    match tokens_per_second {
        Some(tps) if tps >= 5.5 => 1.0,
        Some(tps) if tps >= 4.0 => 1.15,
        Some(_) => 1.2,
        None => 1.15,
    }
}

/// Estimated spoken duration of a target-language text: pronounceable
/// characters over a fixed characters-per-second rate.
#[must_use]
pub fn estimate_duration_ms(text: &str, chars_per_second: f64) -> u64 {
    let chars = text.chars().filter(|c| c.is_ascii_alphanumeric()).count();
    if chars == 0 || chars_per_second <= 0.0 {
        return 0;
    }
    (chars as f64 / chars_per_second * 1_000.0).round() as u64
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

/// Build the translation prompt for one utterance.
///
/// `retry_level` 0 is the initial translation; higher levels ask for
/// progressively stronger shortening of the previous concerns.
#[must_use]
pub fn build_prompt(
    source: &str,
    budget_ms: u64,
    chars_per_second: f64,
    retry_level: u32,
    episode_context: &str,
    glossary_lines: &[(&str, &str)],
    domain_hint: &str,
) -> String {
    let budget_sec = budget_ms as f64 / 1_000.0;
    let max_chars = (budget_sec * chars_per_second) as u64;

    if retry_level > 0 {
        let strength = if retry_level == 1 {
            "Shorten the translation while keeping the core meaning."
        } else {
            "Make it much shorter; you may drop filler words and minor detail, keep the core meaning."
        };
        return format!(
            "{strength}\n\
             The subtitle is displayed for {budget_sec:.2} seconds; stay under \
             approximately {max_chars} characters.\n\
             Translate this line into natural English for subtitles and output \
             ONLY the translation:\n\"{source}\""
        );
    }

    let mut parts = vec![
        "You are a professional subtitle translator.".to_owned(),
        "Translate naturally; never word by word. Output ONLY the final English text.".to_owned(),
    ];

    if !glossary_lines.is_empty() {
        parts.push("Glossary (follow EXACTLY when these phrases appear):".to_owned());
        for (term, target) in glossary_lines {
            parts.push(format!("{term} -> {target}"));
        }
    }

    if !domain_hint.is_empty() {
        parts.push(format!("Context: {domain_hint}"));
    }

    if !episode_context.is_empty() {
        parts.push(format!("Episode dialogue context:\n{episode_context}"));
    }

    parts.push(format!(
        "Constraints:\n\
         - Displayed for {budget_sec:.2} seconds; maximum length approximately {max_chars} characters.\n\
         - Natural, concise, readable. No explanations or notes."
    ));
    parts.push(format!(
        "Translate ONLY this utterance into natural English for subtitles:\n\"{source}\""
    ));

    parts.join("\n\n")
}

// ---------------------------------------------------------------------------
// Translation driver
// ---------------------------------------------------------------------------

/// One line of `mt/input.jsonl`: what was asked, for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationInput {
    pub utt_id: String,
    pub source: String,
    pub budget_ms: u64,
    pub glossary: Vec<String>,
    pub domain_hint_applied: bool,
}

/// One line of `mt/output.jsonl`: what came back, with budget accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRecord {
    pub utt_id: String,
    pub source: String,
    pub target: String,
    pub budget_ms: u64,
    pub estimated_ms: u64,
    pub retries: u32,
    pub glossary_violations: Vec<String>,
}

/// Translate every utterance of the subtitle model.
///
/// `max_extend_ms` is the aligner's extension cap: a rendering that fits
/// the rate-scaled budget plus `max_extend` is accepted without retry.
pub fn translate_model(
    model: &SubtitleModel,
    service: &dyn TranslationService,
    glossary: &Glossary,
    settings: &TranslateSettings,
    max_extend_ms: u64,
    token: &CancellationToken,
) -> DubResult<(Vec<TranslationInput>, Vec<TranslationRecord>)> {
    let episode_context = if settings.include_episode_context {
        let mut context: String = model
            .utterances
            .iter()
            .map(|u| u.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if context.chars().count() > settings.context_max_chars {
            context = context.chars().take(settings.context_max_chars).collect();
            context.push_str("...");
        }
        context
    } else {
        String::new()
    };

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    for utt in &model.utterances {
        token.checkpoint()?;

        // The speech-rate coefficient scales the budget before the prompt
        // is built, so the character target the translator sees already
        // reflects the slow/normal/fast band.
        let window_ms = utt.end_ms.saturating_sub(utt.start_ms);
        let k = rate_coefficient(utt.speaker.speech_rate);
        let budget_ms = (window_ms as f64 * k) as u64;
        let allowed_ms = budget_ms + max_extend_ms;
        let glossary_lines = glossary.subset_for(&utt.text);
        let hint_applies = !settings.domain_hint.is_empty()
            && settings
                .domain_trigger_tokens
                .iter()
                .any(|t| !t.is_empty() && utt.text.contains(t.as_str()));
        let domain_hint = if hint_applies {
            settings.domain_hint.as_str()
        } else {
            ""
        };

        inputs.push(TranslationInput {
            utt_id: utt.utt_id.clone(),
            source: utt.text.clone(),
            budget_ms,
            glossary: glossary_lines
                .iter()
                .map(|(term, target)| format!("{term} -> {target}"))
                .collect(),
            domain_hint_applied: hint_applies,
        });

        let mut target = String::new();
        let mut estimated_ms = 0;
        let mut retries = 0;
        for retry_level in 0..=settings.max_retries {
            token.checkpoint()?;
            let prompt = build_prompt(
                &utt.text,
                budget_ms,
                settings.chars_per_second,
                retry_level,
                &episode_context,
                &glossary_lines,
                domain_hint,
            );
            target = retry_transient("translation", settings.max_attempts, token, || {
                service.translate(&prompt)
            })?;
            estimated_ms = estimate_duration_ms(&target, settings.chars_per_second);
            retries = retry_level;
            if estimated_ms <= allowed_ms {
                break;
            }
            tracing::debug!(
                utt_id = %utt.utt_id,
                estimated_ms,
                allowed_ms,
                retry_level,
                "translation over budget"
            );
        }

        let violations = glossary.violations(&utt.text, &target);
        if !violations.is_empty() {
            tracing::warn!(utt_id = %utt.utt_id, ?violations, "glossary violations");
        }

        outputs.push(TranslationRecord {
            utt_id: utt.utt_id.clone(),
            source: utt.text.clone(),
            target,
            budget_ms,
            estimated_ms,
            retries,
            glossary_violations: violations,
        });
    }

    Ok((inputs, outputs))
}

/// Serialize records as JSON Lines and write atomically.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> DubResult<()> {
    let mut body = String::new();
    for record in records {
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    write_atomic(path, body.as_bytes())
}

/// Read JSON Lines back; callers index the records as needed.
pub fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path, artifact: &str) -> DubResult<Vec<T>> {
    let body = std::fs::read_to_string(path).map_err(|_| DubError::MissingArtifact {
        key: artifact.to_owned(),
        path: path.to_path_buf(),
    })?;
    let mut records = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        records.push(
            serde_json::from_str(line).map_err(|e| DubError::InvalidDocument {
                artifact: artifact.to_owned(),
                message: e.to_string(),
            })?,
        );
    }
    Ok(records)
}
