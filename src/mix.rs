//! Timeline-faithful mixing.
//!
//! Every synthesized segment is placed at its absolute start time on a
//! silent canvas the exact length of the source audio; nothing is ever
//! globally stretched. A segment may spill at most `overflow_ms` past its
//! budget; any residual overlap with the next utterance truncates the
//! earlier segment. The accompaniment is ducked while speech is active,
//! and the combined track is normalized to the loudness target under a
//! true-peak ceiling.

use std::path::Path;

use crate::audio::{ms_to_samples, read_wav};
use crate::config::{MixSettings, SAMPLE_RATE};
use crate::error::{DubError, DubResult};
use crate::model::{DubModel, SegmentIndex};

/// Mix the dubbed track. `segments_dir` holds one WAV per utterance as
/// recorded in the segment index; `accompaniment` is optional (a missing
/// separation stem mixes speech over silence).
pub fn mix_timeline(
    dub: &DubModel,
    index: &SegmentIndex,
    segments_dir: &Path,
    accompaniment: Option<&[i16]>,
    settings: &MixSettings,
) -> DubResult<Vec<i16>> {
    let total_samples = ms_to_samples(dub.audio_duration_ms, SAMPLE_RATE);
    let mut speech = vec![0i16; total_samples];
    let mut active = vec![false; total_samples];

    for (idx, utt) in dub.utterances.iter().enumerate() {
        let Some(record) = index.segments.get(&utt.utt_id) else {
            tracing::warn!(utt_id = %utt.utt_id, "no segment record, leaving silence");
            continue;
        };
        let path = segments_dir.join(format!("{}.wav", utt.utt_id));
        if !path.exists() {
            return Err(DubError::MissingArtifact {
                key: format!("tts.segments/{}", record.utt_id),
                path,
            });
        }
        let (samples, rate) = read_wav(&path)?;
        if rate != SAMPLE_RATE {
            return Err(DubError::InvalidDocument {
                artifact: path.display().to_string(),
                message: format!("expected {SAMPLE_RATE} Hz, got {rate}"),
            });
        }

        // Window: [start, start + budget + overflow], truncated at the next
        // utterance's start and at the canvas edge.
        let start = ms_to_samples(utt.start_ms, SAMPLE_RATE);
        let mut limit = ms_to_samples(
            utt.start_ms + utt.budget_ms + settings.overflow_ms,
            SAMPLE_RATE,
        );
        if let Some(next) = dub.utterances.get(idx + 1) {
            limit = limit.min(ms_to_samples(next.start_ms, SAMPLE_RATE));
        }
        limit = limit.min(total_samples);

        let take = samples.len().min(limit.saturating_sub(start));
        for (offset, sample) in samples[..take].iter().enumerate() {
            let position = start + offset;
            speech[position] = speech[position].saturating_add(*sample);
            active[position] = true;
        }
    }

    let envelope = duck_envelope(&active, settings);
    let mut mixed = Vec::with_capacity(total_samples);
    for i in 0..total_samples {
        let background = accompaniment
            .and_then(|acc| acc.get(i))
            .map(|s| f64::from(*s) * envelope[i])
            .unwrap_or(0.0);
        let value = f64::from(speech[i]) + background;
        mixed.push(value.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16);
    }

    normalize_loudness(&mut mixed, settings.target_lufs, settings.true_peak_dbtp);
    Ok(mixed)
}

/// Sidechain-style gain envelope for the accompaniment: unity in silence,
/// `duck_gain` under active speech, linear ramps of `duck_fade_ms` at the
/// transitions.
fn duck_envelope(active: &[bool], settings: &MixSettings) -> Vec<f64> {
    let fade = ms_to_samples(settings.duck_fade_ms, SAMPLE_RATE).max(1);
    let duck = settings.duck_gain.clamp(0.0, 1.0);
    let step = (1.0 - duck) / fade as f64;

    let mut envelope = vec![1.0; active.len()];
    let mut gain = 1.0;
    for (i, is_active) in active.iter().enumerate() {
        let target = if *is_active { duck } else { 1.0 };
        if gain > target {
            gain = (gain - step).max(target);
        } else if gain < target {
            gain = (gain + step).min(target);
        }
        envelope[i] = gain;
    }
    envelope
}

/// Mean-square loudness of the track in dBFS. An all-silence track
/// reports negative infinity.
#[must_use]
pub fn measure_loudness_dbfs(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return f64::NEG_INFINITY;
    }
    let full_scale = f64::from(i16::MAX);
    let mean_square: f64 = samples
        .iter()
        .map(|s| {
            let x = f64::from(*s) / full_scale;
            x * x
        })
        .sum::<f64>()
        / samples.len() as f64;
    if mean_square <= 0.0 {
        return f64::NEG_INFINITY;
    }
    10.0 * mean_square.log10()
}

/// Apply a single gain that brings the program loudness to `target_lufs`,
/// then back it off if the peak would exceed `true_peak_dbtp`.
pub fn normalize_loudness(samples: &mut [i16], target_lufs: f64, true_peak_dbtp: f64) {
    let measured = measure_loudness_dbfs(samples);
    if !measured.is_finite() {
        return;
    }
    let mut gain = 10f64.powf((target_lufs - measured) / 20.0);

    let peak = samples
        .iter()
        .map(|s| f64::from(s.saturating_abs()))
        .fold(0.0, f64::max)
        / f64::from(i16::MAX);
    let peak_ceiling = 10f64.powf(true_peak_dbtp / 20.0);
    if peak * gain > peak_ceiling && peak > 0.0 {
        gain = peak_ceiling / peak;
    }

    for sample in samples.iter_mut() {
        let scaled = f64::from(*sample) * gain;
        *sample = scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
    }
}
