//! Shared fixtures for the integration suites: a seeded episode workspace,
//! fake services, and the recognize-downstream slice of the pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use serde_json::{Value, json};

use redub::audio::{ms_to_samples, write_wav_atomic, wav_to_bytes};
use redub::config::SAMPLE_RATE;
use redub::error::{DubError, DubResult};
use redub::phases::{AlignPhase, MixPhase, SubtitlePhase, SynthesizePhase, TranslatePhase};
use redub::runner::Phase;
use redub::services::{SynthesisRequest, SynthesisService, TranslationService};
use redub::workspace::{Workspace, write_json_atomic};

/// Two speakers, word-level timings, punctuated utterance text, and
/// per-speaker gender: the narrow shape the subtitle phase consumes.
pub fn raw_recognition_fixture() -> Value {
    json!({
        "audio_info": { "duration": 10_000 },
        "result": {
            "utterances": [
                {
                    "start_time": 0,
                    "end_time": 800,
                    "text": "你好，世界。",
                    "additions": { "speaker": "1", "gender": "female" },
                    "words": [
                        { "start_time": 0, "end_time": 400, "text": "你好" },
                        { "start_time": 420, "end_time": 800, "text": "世界" }
                    ]
                },
                {
                    "start_time": 1_300,
                    "end_time": 2_000,
                    "text": "走吧。",
                    "additions": { "speaker": "2", "gender": "male" },
                    "words": [
                        { "start_time": 1_300, "end_time": 2_000, "text": "走吧" }
                    ]
                }
            ]
        },
        "provider_specific": { "preset": "asr_spk_semantic" }
    })
}

/// Seed a workspace as if demux, separate, and recognize already ran:
/// the raw recognition response plus a quiet accompaniment bed.
pub fn seed_workspace(root: PathBuf) -> Workspace {
    let workspace = Workspace::new(root);
    let raw_path = workspace
        .prepare_artifact_path("source.recognition_raw")
        .unwrap();
    write_json_atomic(&raw_path, &raw_recognition_fixture()).unwrap();

    let accompaniment = vec![2_000i16; ms_to_samples(10_000, SAMPLE_RATE)];
    let acc_path = workspace
        .prepare_artifact_path("audio.accompaniment")
        .unwrap();
    write_wav_atomic(&acc_path, &accompaniment, SAMPLE_RATE).unwrap();
    workspace
}

/// Deterministic phrase-table translator; unknown lines echo back.
pub struct FakeTranslation {
    pub calls: AtomicUsize,
}

impl FakeTranslation {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl TranslationService for FakeTranslation {
    fn translate(&self, prompt: &str) -> DubResult<String> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let table = [
            ("你好，世界。", "Hello, world."),
            ("你好吗，世界。", "How are you, world."),
            ("走吧。", "Let's go."),
        ];
        // Every prompt ends with the quoted utterance; match on that so the
        // episode context lines can't shadow the focus utterance.
        for (source, target) in table {
            if prompt.ends_with(&format!("\"{source}\"")) {
                return Ok(target.to_owned());
            }
        }
        Ok("Untranslated line.".to_owned())
    }
}

/// Always fails with a permanent service error.
pub struct FailingTranslation;

impl TranslationService for FailingTranslation {
    fn translate(&self, _prompt: &str) -> DubResult<String> {
        Err(DubError::Permanent {
            service: "translation".to_owned(),
            status: 401,
            message: "invalid api key".to_owned(),
        })
    }
}

/// Emits a 400ms tone for every request and counts the calls.
pub struct FakeSynthesis {
    pub calls: AtomicUsize,
}

impl FakeSynthesis {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl SynthesisService for FakeSynthesis {
    fn synthesize(&self, _request: &SynthesisRequest) -> DubResult<Vec<u8>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let samples = vec![8_000i16; ms_to_samples(400, SAMPLE_RATE)];
        wav_to_bytes(&samples, SAMPLE_RATE)
    }
}

/// The pipeline slice downstream of recognition.
pub fn downstream_phases(
    translation: Arc<dyn TranslationService>,
    synthesis: Arc<dyn SynthesisService>,
) -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(SubtitlePhase),
        Box::new(TranslatePhase { translation }),
        Box::new(AlignPhase),
        Box::new(SynthesizePhase { synthesis }),
        Box::new(MixPhase),
    ]
}
