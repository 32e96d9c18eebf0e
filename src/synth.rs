//! Per-utterance synthesis with a content-addressed cache.
//!
//! Each dub-model utterance is synthesized independently: cache lookup by
//! content hash, service call on miss, silence trim, budget fit (time
//! compression without pitch change, bounded by the utterance's
//! `max_rate`), and an atomic write of the final segment. A failed
//! utterance becomes a silence blob and a `failed` index entry; the phase
//! itself still succeeds.
//!
//! Up to N workers run concurrently. Each owns its output path; the cache
//! is coordinated purely by content hash: two workers may race on the
//! same blob, both writes are byte-identical, last rename wins.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audio::{
    compress_tempo, read_wav, samples_to_ms, silence, trim_silence, wav_from_bytes,
    write_wav_atomic,
};
use crate::config::{SAMPLE_RATE, SynthSettings};
use crate::error::{DubError, DubResult};
use crate::model::{DubModel, DubUtterance, SegmentIndex, SegmentRecord, SegmentStatus, VoiceAssignment};
use crate::runner::CancellationToken;
use crate::services::{SynthesisRequest, SynthesisService, retry_transient};
use crate::workspace::write_atomic;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsReportEntry {
    pub utt_id: String,
    pub status: SegmentStatus,
    pub cache_hit: bool,
    pub compressed: bool,
    pub rate: f64,
    pub duration_ms: u64,
    pub budget_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsReport {
    pub total: usize,
    pub synthesized: usize,
    pub cached: usize,
    pub compressed: usize,
    pub failed: usize,
    pub entries: Vec<TtsReportEntry>,
}

// ---------------------------------------------------------------------------
// Content hash and rate planning
// ---------------------------------------------------------------------------

/// Cache key: everything that influences the synthesized waveform.
#[must_use]
pub fn content_hash(text: &str, voice_id: &str, emotion: Option<&str>, version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"\0");
    hasher.update(voice_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(emotion.unwrap_or_default().as_bytes());
    hasher.update(b"\0");
    hasher.update(version.to_le_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// The compression rate for a segment of `duration_ms` against its budget:
/// `max(1.0, duration / budget)`, capped at `max_rate`. A capped segment
/// will overflow its budget; the mixer truncates it.
#[must_use]
pub fn plan_rate(duration_ms: u64, budget_ms: u64, max_rate: f64) -> f64 {
    if budget_ms == 0 {
        return max_rate;
    }
    let rate = (duration_ms as f64 / budget_ms as f64).max(1.0);
    rate.min(max_rate)
}

// ---------------------------------------------------------------------------
// Synthesis driver
// ---------------------------------------------------------------------------

pub fn synthesize_all(
    dub: &DubModel,
    assignment: &VoiceAssignment,
    service: &dyn SynthesisService,
    segments_dir: &Path,
    cache_dir: &Path,
    settings: &SynthSettings,
    token: &CancellationToken,
) -> DubResult<(SegmentIndex, TtsReport)> {
    std::fs::create_dir_all(segments_dir)?;
    std::fs::create_dir_all(cache_dir)?;

    let jobs: Mutex<VecDeque<&DubUtterance>> = Mutex::new(dub.utterances.iter().collect());
    let results: Mutex<Vec<(SegmentRecord, TtsReportEntry)>> = Mutex::new(Vec::new());
    let fatal: Mutex<Option<DubError>> = Mutex::new(None);

    let workers = settings.workers.clamp(1, dub.utterances.len().max(1));
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if token.is_cancelled() || fatal.lock().is_ok_and(|f| f.is_some()) {
                        return;
                    }
                    let Some(utt) = jobs.lock().ok().and_then(|mut q| q.pop_front()) else {
                        return;
                    };
                    match synthesize_one(
                        utt,
                        assignment,
                        service,
                        segments_dir,
                        cache_dir,
                        settings,
                        token,
                    ) {
                        Ok(outcome) => {
                            if let Ok(mut out) = results.lock() {
                                out.push(outcome);
                            }
                        }
                        Err(err) => {
                            if let Ok(mut slot) = fatal.lock() {
                                slot.get_or_insert(err);
                            }
                            return;
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = fatal.into_inner().ok().flatten() {
        return Err(err);
    }
    token.checkpoint()?;

    let mut outcomes = results.into_inner().unwrap_or_default();
    outcomes.sort_by(|a, b| a.0.utt_id.cmp(&b.0.utt_id));

    let mut index = SegmentIndex::default();
    let mut report = TtsReport {
        total: outcomes.len(),
        ..TtsReport::default()
    };
    for (record, entry) in outcomes {
        match entry.status {
            SegmentStatus::Failed => report.failed += 1,
            SegmentStatus::Ok if entry.cache_hit => report.cached += 1,
            SegmentStatus::Ok => report.synthesized += 1,
        }
        if entry.compressed {
            report.compressed += 1;
        }
        index.segments.insert(record.utt_id.clone(), record);
        report.entries.push(entry);
    }
    Ok((index, report))
}

/// One utterance, start to finish. Returns `Err` only for cancellation;
/// everything else degrades to a failed segment record.
fn synthesize_one(
    utt: &DubUtterance,
    assignment: &VoiceAssignment,
    service: &dyn SynthesisService,
    segments_dir: &Path,
    cache_dir: &Path,
    settings: &SynthSettings,
    token: &CancellationToken,
) -> DubResult<(SegmentRecord, TtsReportEntry)> {
    token.checkpoint()?;

    let voice_id = assignment
        .speakers
        .get(&utt.speaker_id)
        .map(|choice| choice.voice_id.clone())
        .unwrap_or_else(|| "en_neutral_plain".to_owned());
    let hash = content_hash(
        &utt.text_target,
        &voice_id,
        utt.emotion.as_deref(),
        settings.synthesizer_version,
    );
    let segment_path = segments_dir.join(format!("{}.wav", utt.utt_id));
    let wav_rel = format!("tts/segments/{}.wav", utt.utt_id);

    match fit_segment(utt, &voice_id, &hash, service, cache_dir, settings, token) {
        Ok(fitted) => {
            write_wav_atomic(&segment_path, &fitted.samples, SAMPLE_RATE)?;
            let duration_ms = samples_to_ms(fitted.samples.len(), SAMPLE_RATE);
            Ok((
                SegmentRecord {
                    utt_id: utt.utt_id.clone(),
                    wav_path: wav_rel,
                    voice_id,
                    duration_ms,
                    rate: fitted.rate,
                    content_hash: hash,
                    status: SegmentStatus::Ok,
                },
                TtsReportEntry {
                    utt_id: utt.utt_id.clone(),
                    status: SegmentStatus::Ok,
                    cache_hit: fitted.cache_hit,
                    compressed: fitted.compressed,
                    rate: fitted.rate,
                    duration_ms,
                    budget_ms: utt.budget_ms,
                    error: None,
                },
            ))
        }
        Err(err @ DubError::Cancelled(_)) => Err(err),
        Err(err) => {
            tracing::warn!(utt_id = %utt.utt_id, error = %err, "synthesis failed, substituting silence");
            let blob = silence(utt.budget_ms, SAMPLE_RATE);
            write_wav_atomic(&segment_path, &blob, SAMPLE_RATE)?;
            Ok((
                SegmentRecord {
                    utt_id: utt.utt_id.clone(),
                    wav_path: wav_rel,
                    voice_id,
                    duration_ms: utt.budget_ms,
                    rate: 1.0,
                    content_hash: hash,
                    status: SegmentStatus::Failed,
                },
                TtsReportEntry {
                    utt_id: utt.utt_id.clone(),
                    status: SegmentStatus::Failed,
                    cache_hit: false,
                    compressed: false,
                    rate: 1.0,
                    duration_ms: utt.budget_ms,
                    budget_ms: utt.budget_ms,
                    error: Some(format!("[{}] {err}", err.error_code())),
                },
            ))
        }
    }
}

struct FittedSegment {
    samples: Vec<i16>,
    rate: f64,
    cache_hit: bool,
    compressed: bool,
}

fn fit_segment(
    utt: &DubUtterance,
    voice_id: &str,
    hash: &str,
    service: &dyn SynthesisService,
    cache_dir: &Path,
    settings: &SynthSettings,
    token: &CancellationToken,
) -> DubResult<FittedSegment> {
    let cache_path = cache_dir.join(format!("{hash}.wav"));

    let (bytes, cache_hit) = if cache_path.exists() {
        (std::fs::read(&cache_path)?, true)
    } else {
        let request = SynthesisRequest {
            text: utt.text_target.clone(),
            voice_id: voice_id.to_owned(),
            emotion: utt.emotion.clone(),
        };
        let bytes = retry_transient("synthesis", settings.max_attempts, token, || {
            service.synthesize(&request)
        })?;
        write_atomic(&cache_path, &bytes)?;
        (bytes, false)
    };

    let (samples, sample_rate) = wav_from_bytes(&bytes)?;
    if sample_rate != SAMPLE_RATE {
        return Err(DubError::InvalidDocument {
            artifact: format!("synthesis blob {hash}"),
            message: format!("expected {SAMPLE_RATE} Hz, got {sample_rate}"),
        });
    }

    let trimmed = trim_silence(&samples, settings.trim_threshold);
    let duration_ms = samples_to_ms(trimmed.len(), SAMPLE_RATE);
    let rate = plan_rate(duration_ms, utt.budget_ms, utt.tts_policy.max_rate);

    if rate <= 1.0 + f64::EPSILON {
        return Ok(FittedSegment {
            samples: trimmed,
            rate: 1.0,
            cache_hit,
            compressed: false,
        });
    }

    // Time compression runs through the media toolchain so pitch stays put.
    let staging = tempfile::tempdir()?;
    let raw_path = staging.path().join("raw.wav");
    let compressed_path = staging.path().join("compressed.wav");
    write_wav_atomic(&raw_path, &trimmed, SAMPLE_RATE)?;
    compress_tempo(&raw_path, &compressed_path, rate, token)?;
    let (compressed, _) = read_wav(&compressed_path)?;

    Ok(FittedSegment {
        samples: compressed,
        rate,
        cache_hit,
        compressed: true,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::audio::wav_to_bytes;
    use crate::model::{Gender, TtsPolicy, VoiceChoice, VoiceSource};

    fn utterance(id: &str, text: &str, budget_ms: u64) -> DubUtterance {
        DubUtterance {
            utt_id: id.to_owned(),
            start_ms: 0,
            end_ms: budget_ms,
            budget_ms,
            text_source: String::new(),
            text_target: text.to_owned(),
            speaker_id: "spk_1".to_owned(),
            gender: Gender::Female,
            emotion: None,
            tts_policy: TtsPolicy { max_rate: 1.3 },
        }
    }

    fn assignment() -> VoiceAssignment {
        VoiceAssignment {
            speakers: BTreeMap::from([(
                "spk_1".to_owned(),
                VoiceChoice {
                    role_id: "Lead".to_owned(),
                    voice_id: "en_female_lead".to_owned(),
                    source: VoiceSource::Mapped,
                },
            )]),
        }
    }

    /// Returns a 400ms tone for any request and counts calls.
    struct CountingService {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingService {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl SynthesisService for CountingService {
        fn synthesize(&self, _request: &SynthesisRequest) -> DubResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DubError::Permanent {
                    service: "synthesis".to_owned(),
                    status: 400,
                    message: "rejected".to_owned(),
                });
            }
            let samples = vec![8_000i16; crate::audio::ms_to_samples(400, SAMPLE_RATE)];
            wav_to_bytes(&samples, SAMPLE_RATE)
        }
    }

    fn dirs() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let segments = dir.path().join("segments");
        let cache = dir.path().join("cache");
        (dir, segments, cache)
    }

    #[test]
    fn plan_rate_matches_the_budget_rule() {
        assert!((plan_rate(600, 1_000, 1.3) - 1.0).abs() < f64::EPSILON);
        assert!((plan_rate(1_200, 1_000, 1.3) - 1.2).abs() < 1e-9);
        // 900ms into 500ms wants 1.8 but caps at 1.3; segment will overflow.
        assert!((plan_rate(900, 500, 1.3) - 1.3).abs() < f64::EPSILON);
        assert!((plan_rate(100, 0, 1.3) - 1.3).abs() < f64::EPSILON);
    }

    #[test]
    fn content_hash_covers_every_input() {
        let base = content_hash("hi", "voice_a", None, 1);
        assert_ne!(base, content_hash("hi!", "voice_a", None, 1));
        assert_ne!(base, content_hash("hi", "voice_b", None, 1));
        assert_ne!(base, content_hash("hi", "voice_a", Some("sad"), 1));
        assert_ne!(base, content_hash("hi", "voice_a", None, 2));
        assert_eq!(base, content_hash("hi", "voice_a", None, 1));
    }

    #[test]
    fn second_synthesis_hits_the_cache_and_skips_the_service() {
        let (_dir, segments, cache) = dirs();
        let dub = DubModel {
            audio_duration_ms: 5_000,
            utterances: vec![utterance("utt_0001", "Hello there", 1_000)],
        };
        let service = CountingService::new();
        let settings = SynthSettings::default();
        let token = CancellationToken::new();

        let (index1, report1) = synthesize_all(
            &dub, &assignment(), &service, &segments, &cache, &settings, &token,
        )
        .unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report1.synthesized, 1);
        let first_bytes = std::fs::read(segments.join("utt_0001.wav")).unwrap();

        let (index2, report2) = synthesize_all(
            &dub, &assignment(), &service, &segments, &cache, &settings, &token,
        )
        .unwrap();
        assert_eq!(
            service.calls.load(Ordering::SeqCst),
            1,
            "cache hit must not contact the service"
        );
        assert_eq!(report2.cached, 1);
        let second_bytes = std::fs::read(segments.join("utt_0001.wav")).unwrap();
        assert_eq!(first_bytes, second_bytes, "byte-identical segments");
        assert_eq!(
            index1.segments["utt_0001"].content_hash,
            index2.segments["utt_0001"].content_hash
        );
    }

    #[test]
    fn failure_records_failed_and_substitutes_silence() {
        let (_dir, segments, cache) = dirs();
        let dub = DubModel {
            audio_duration_ms: 5_000,
            utterances: vec![utterance("utt_0001", "Hello", 700)],
        };
        let mut service = CountingService::new();
        service.fail = true;
        let settings = SynthSettings::default();
        let token = CancellationToken::new();

        let (index, report) = synthesize_all(
            &dub, &assignment(), &service, &segments, &cache, &settings, &token,
        )
        .expect("per-item failure must not fail the phase");

        assert_eq!(report.failed, 1);
        let record = &index.segments["utt_0001"];
        assert_eq!(record.status, SegmentStatus::Failed);
        assert_eq!(record.duration_ms, 700);

        let (samples, _) = read_wav(&segments.join("utt_0001.wav")).unwrap();
        assert_eq!(samples.len(), crate::audio::ms_to_samples(700, SAMPLE_RATE));
        assert!(samples.iter().all(|s| *s == 0), "silence blob");
    }

    #[test]
    fn fitting_segment_is_not_compressed() {
        let (_dir, segments, cache) = dirs();
        let dub = DubModel {
            audio_duration_ms: 5_000,
            // 400ms of audio against a 1s budget: no compression needed.
            utterances: vec![utterance("utt_0001", "Short", 1_000)],
        };
        let service = CountingService::new();
        let token = CancellationToken::new();

        let (index, report) = synthesize_all(
            &dub,
            &assignment(),
            &service,
            &segments,
            &cache,
            &SynthSettings::default(),
            &token,
        )
        .unwrap();
        assert_eq!(report.compressed, 0);
        let record = &index.segments["utt_0001"];
        assert!((record.rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(record.duration_ms, 400);
    }

    #[test]
    fn every_utterance_gets_an_index_entry() {
        let (_dir, segments, cache) = dirs();
        let dub = DubModel {
            audio_duration_ms: 20_000,
            utterances: (0..9)
                .map(|i| utterance(&format!("utt_{:04}", i + 1), "Line", 1_000))
                .collect(),
        };
        let service = CountingService::new();
        let token = CancellationToken::new();

        let (index, report) = synthesize_all(
            &dub,
            &assignment(),
            &service,
            &segments,
            &cache,
            &SynthSettings::default(),
            &token,
        )
        .unwrap();
        assert_eq!(index.segments.len(), 9);
        assert_eq!(report.total, 9);
        for i in 0..9 {
            let id = format!("utt_{:04}", i + 1);
            assert!(segments.join(format!("{id}.wav")).exists());
            assert!(index.segments.contains_key(&id));
        }
        // Identical text/voice/emotion share one cache blob.
        assert_eq!(std::fs::read_dir(&cache).unwrap().count(), 1);
    }

    #[test]
    fn cancellation_aborts_the_pool() {
        let (_dir, segments, cache) = dirs();
        let dub = DubModel {
            audio_duration_ms: 5_000,
            utterances: vec![utterance("utt_0001", "Hello", 1_000)],
        };
        let service = CountingService::new();
        let token = CancellationToken::new();
        token.cancel("shutdown");

        let err = synthesize_all(
            &dub,
            &assignment(),
            &service,
            &segments,
            &cache,
            &SynthSettings::default(),
            &token,
        )
        .unwrap_err();
        assert!(matches!(err, DubError::Cancelled(_)));
    }

    #[test]
    fn trimmed_edges_shorten_the_segment() {
        let (_dir, segments, cache) = dirs();

        struct PaddedService;
        impl SynthesisService for PaddedService {
            fn synthesize(&self, _request: &SynthesisRequest) -> DubResult<Vec<u8>> {
                let mut samples = vec![0i16; crate::audio::ms_to_samples(100, SAMPLE_RATE)];
                samples.extend(vec![9_000i16; crate::audio::ms_to_samples(300, SAMPLE_RATE)]);
                samples.extend(vec![0i16; crate::audio::ms_to_samples(100, SAMPLE_RATE)]);
                wav_to_bytes(&samples, SAMPLE_RATE)
            }
        }

        let dub = DubModel {
            audio_duration_ms: 5_000,
            utterances: vec![utterance("utt_0001", "Padded", 1_000)],
        };
        let token = CancellationToken::new();
        let (index, _report) = synthesize_all(
            &dub,
            &assignment(),
            &PaddedService,
            &segments,
            &cache,
            &SynthSettings::default(),
            &token,
        )
        .unwrap();
        assert_eq!(index.segments["utt_0001"].duration_ms, 300);
    }
}
