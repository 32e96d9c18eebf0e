//! The nine pipeline phases, in execution order:
//! demux → separate → recognize → subtitle → translate → align →
//! synthesize → mix → burn.
//!
//! Each phase is a thin adapter between declared artifacts and one
//! component; the interesting logic lives in the component modules.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::align::build_dub_model;
use crate::audio::{burn_video, extract_audio, read_wav, separate_vocals, write_wav_atomic};
use crate::config::SAMPLE_RATE;
use crate::error::{DubError, DubResult};
use crate::mix::mix_timeline;
use crate::model::{
    DubModel, Gender, RoleCast, SegmentIndex, SpeakerToRole, SubtitleModel, parse_recognition,
    read_document,
};
use crate::normalize::normalize_utterances;
use crate::render::render_srt;
use crate::runner::{Phase, PhaseContext};
use crate::services::{
    ObjectStore, RecognitionService, SynthesisService, TranslationService, poll_until_complete,
    retry_transient,
};
use crate::subtitle::{build_subtitle_model, update_speaker_registry};
use crate::synth::synthesize_all;
use crate::translate::{Glossary, TranslationRecord, read_jsonl, translate_model, write_jsonl};
use crate::voice::resolve_voices;
use crate::workspace::{write_atomic, write_json_atomic};

/// Everything the phases need to reach the outside world.
#[derive(Clone)]
pub struct ServiceHub {
    pub recognition: Arc<dyn RecognitionService>,
    pub translation: Arc<dyn TranslationService>,
    pub synthesis: Arc<dyn SynthesisService>,
    pub store: Arc<dyn ObjectStore>,
}

impl ServiceHub {
    /// A hub whose services refuse every call. Enough for operations that
    /// never execute a phase (bless, listings).
    #[must_use]
    pub fn unavailable() -> Self {
        struct Unavailable;
        fn not_configured<T>() -> DubResult<T> {
            Err(DubError::Config("service not configured".to_owned()))
        }
        impl RecognitionService for Unavailable {
            fn submit(&self, _: &str, _: &str) -> DubResult<String> {
                not_configured()
            }
            fn poll(&self, _: &str) -> DubResult<crate::services::PollOutcome> {
                not_configured()
            }
        }
        impl TranslationService for Unavailable {
            fn translate(&self, _: &str) -> DubResult<String> {
                not_configured()
            }
        }
        impl SynthesisService for Unavailable {
            fn synthesize(&self, _: &crate::services::SynthesisRequest) -> DubResult<Vec<u8>> {
                not_configured()
            }
        }
        impl ObjectStore for Unavailable {
            fn upload(&self, _: &std::path::Path, _: &str) -> DubResult<String> {
                not_configured()
            }
        }
        Self {
            recognition: Arc::new(Unavailable),
            translation: Arc::new(Unavailable),
            synthesis: Arc::new(Unavailable),
            store: Arc::new(Unavailable),
        }
    }
}

/// The full pipeline in dependency order.
#[must_use]
pub fn build_phases(hub: &ServiceHub) -> Vec<Box<dyn Phase>> {
    vec![
        Box::new(DemuxPhase),
        Box::new(SeparatePhase),
        Box::new(RecognizePhase {
            recognition: Arc::clone(&hub.recognition),
            store: Arc::clone(&hub.store),
        }),
        Box::new(SubtitlePhase),
        Box::new(TranslatePhase {
            translation: Arc::clone(&hub.translation),
        }),
        Box::new(AlignPhase),
        Box::new(SynthesizePhase {
            synthesis: Arc::clone(&hub.synthesis),
        }),
        Box::new(MixPhase),
        Box::new(BurnPhase),
    ]
}

/// Phase names in execution order, for CLI listings and validation.
#[must_use]
pub fn phase_names() -> Vec<&'static str> {
    vec![
        "demux",
        "separate",
        "recognize",
        "subtitle",
        "translate",
        "align",
        "synthesize",
        "mix",
        "burn",
    ]
}

// ---------------------------------------------------------------------------
// demux
// ---------------------------------------------------------------------------

pub struct DemuxPhase;

impl Phase for DemuxPhase {
    fn name(&self) -> &'static str {
        "demux"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec![]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["audio.source"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let output = ctx.workspace.prepare_artifact_path("audio.source")?;
        extract_audio(ctx.video, &output, ctx.token)
    }
}

// ---------------------------------------------------------------------------
// separate
// ---------------------------------------------------------------------------

pub struct SeparatePhase;

impl Phase for SeparatePhase {
    fn name(&self) -> &'static str {
        "separate"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["audio.source"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["audio.vocals", "audio.accompaniment"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let source = ctx.workspace.artifact_path("audio.source")?;
        let vocals = ctx.workspace.prepare_artifact_path("audio.vocals")?;
        let accompaniment = ctx.workspace.prepare_artifact_path("audio.accompaniment")?;
        separate_vocals(&source, &vocals, &accompaniment, &ctx.config.separate, ctx.token)
    }
}

// ---------------------------------------------------------------------------
// recognize
// ---------------------------------------------------------------------------

pub struct RecognizePhase {
    pub recognition: Arc<dyn RecognitionService>,
    pub store: Arc<dyn ObjectStore>,
}

impl Phase for RecognizePhase {
    fn name(&self) -> &'static str {
        "recognize"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["audio.source"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["source.recognition_raw"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let settings = &ctx.config.recognize;
        let source = ctx.workspace.artifact_path("audio.source")?;
        let output = ctx.workspace.prepare_artifact_path("source.recognition_raw")?;

        let key = format!("{}/source.wav", ctx.workspace.episode_id());
        let audio_url = self.store.upload(&source, &key)?;
        tracing::info!(url = %audio_url, "audio uploaded for recognition");

        let job_id = retry_transient("recognition", settings.max_attempts, ctx.token, || {
            self.recognition.submit(&audio_url, &settings.preset)
        })?;
        let raw: Value = poll_until_complete(&*self.recognition, &job_id, settings, ctx.token)?;

        // The provider response is the authoritative document; persist it
        // verbatim, unknown fields included.
        write_json_atomic(&output, &raw)
    }
}

// ---------------------------------------------------------------------------
// subtitle
// ---------------------------------------------------------------------------

pub struct SubtitlePhase;

impl Phase for SubtitlePhase {
    fn name(&self) -> &'static str {
        "subtitle"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["source.recognition_raw"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["source.subtitle_model", "render.zh_srt"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let raw_path = ctx.workspace.artifact_path("source.recognition_raw")?;
        let raw: Value = read_document(&raw_path, "source.recognition_raw")?;
        let doc = parse_recognition(&raw)?;

        let utterances = normalize_utterances(
            &doc.words,
            &doc.utterances,
            &doc.speaker_genders,
            &ctx.config.normalize,
        );
        let model = build_subtitle_model(
            &utterances,
            &ctx.config.recognize.language,
            doc.duration_ms,
        );
        model.validate()?;

        let model_path = ctx.workspace.prepare_artifact_path("source.subtitle_model")?;
        write_json_atomic(&model_path, &model)?;

        let srt_path = ctx.workspace.prepare_artifact_path("render.zh_srt")?;
        write_atomic(&srt_path, render_srt(&model).as_bytes())?;

        let speakers: Vec<String> = model
            .utterances
            .iter()
            .map(|u| u.speaker.id.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        update_speaker_registry(
            &ctx.workspace.speaker_to_role_path(),
            &ctx.workspace.episode_id(),
            &speakers,
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// translate
// ---------------------------------------------------------------------------

pub struct TranslatePhase {
    pub translation: Arc<dyn TranslationService>,
}

impl Phase for TranslatePhase {
    fn name(&self) -> &'static str {
        "translate"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["source.subtitle_model"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["mt.input", "mt.output"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let model_path = ctx.workspace.artifact_path("source.subtitle_model")?;
        let model: SubtitleModel = read_document(&model_path, "source.subtitle_model")?;
        model.validate()?;

        let glossary = Glossary::load(&ctx.workspace.glossary_path())?;
        let (inputs, outputs) = translate_model(
            &model,
            &*self.translation,
            &glossary,
            &ctx.config.translate,
            ctx.config.align.max_extend_ms,
            ctx.token,
        )?;

        write_jsonl(&ctx.workspace.prepare_artifact_path("mt.input")?, &inputs)?;
        write_jsonl(&ctx.workspace.prepare_artifact_path("mt.output")?, &outputs)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// align
// ---------------------------------------------------------------------------

pub struct AlignPhase;

impl Phase for AlignPhase {
    fn name(&self) -> &'static str {
        "align"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["source.subtitle_model", "mt.output"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["source.dub_model", "derive.subtitle_align", "render.en_srt"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let model_path = ctx.workspace.artifact_path("source.subtitle_model")?;
        let model: SubtitleModel = read_document(&model_path, "source.subtitle_model")?;
        model.validate()?;

        let translations: Vec<TranslationRecord> =
            read_jsonl(&ctx.workspace.artifact_path("mt.output")?, "mt.output")?;

        let (dub, aligned) = build_dub_model(
            &model,
            &translations,
            &ctx.config.align,
            ctx.config.translate.chars_per_second,
        )?;

        write_json_atomic(&ctx.workspace.prepare_artifact_path("source.dub_model")?, &dub)?;
        write_json_atomic(
            &ctx.workspace.prepare_artifact_path("derive.subtitle_align")?,
            &aligned,
        )?;
        write_atomic(
            &ctx.workspace.prepare_artifact_path("render.en_srt")?,
            render_srt(&aligned).as_bytes(),
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// synthesize
// ---------------------------------------------------------------------------

pub struct SynthesizePhase {
    pub synthesis: Arc<dyn SynthesisService>,
}

impl Phase for SynthesizePhase {
    fn name(&self) -> &'static str {
        "synthesize"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["source.dub_model"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec![
            "derive.voice_assignment",
            "tts.segments",
            "tts.segments_index",
            "tts.report",
        ]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let dub_path = ctx.workspace.artifact_path("source.dub_model")?;
        let dub: DubModel = read_document(&dub_path, "source.dub_model")?;
        dub.validate()?;

        let registry_path = ctx.workspace.speaker_to_role_path();
        let registry: SpeakerToRole = if registry_path.exists() {
            read_document(&registry_path, "voices.speaker_to_role")?
        } else {
            SpeakerToRole::default()
        };
        let cast_path = ctx.workspace.role_cast_path();
        let cast: RoleCast = if cast_path.exists() {
            read_document(&cast_path, "voices.role_cast")?
        } else {
            RoleCast::default()
        };

        let speakers: BTreeMap<String, Gender> = dub
            .utterances
            .iter()
            .map(|u| (u.speaker_id.clone(), u.gender))
            .collect();
        let assignment = resolve_voices(&registry, &cast, &ctx.workspace.episode_id(), &speakers);
        write_json_atomic(
            &ctx.workspace.prepare_artifact_path("derive.voice_assignment")?,
            &assignment,
        )?;

        let segments_dir = ctx.workspace.prepare_artifact_path("tts.segments")?;
        let (index, report) = synthesize_all(
            &dub,
            &assignment,
            &*self.synthesis,
            &segments_dir,
            &ctx.workspace.synth_cache_dir(),
            &ctx.config.synth,
            ctx.token,
        )?;

        if report.failed > 0 {
            tracing::warn!(
                failed = report.failed,
                total = report.total,
                "some utterances fell back to silence"
            );
        }
        write_json_atomic(
            &ctx.workspace.prepare_artifact_path("tts.segments_index")?,
            &index,
        )?;
        write_json_atomic(&ctx.workspace.prepare_artifact_path("tts.report")?, &report)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// mix
// ---------------------------------------------------------------------------

pub struct MixPhase;

impl Phase for MixPhase {
    fn name(&self) -> &'static str {
        "mix"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["source.dub_model", "tts.segments_index", "audio.accompaniment"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["audio.mix"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let dub: DubModel = read_document(
            &ctx.workspace.artifact_path("source.dub_model")?,
            "source.dub_model",
        )?;
        dub.validate()?;
        let index: SegmentIndex = read_document(
            &ctx.workspace.artifact_path("tts.segments_index")?,
            "tts.segments_index",
        )?;
        let (accompaniment, rate) =
            read_wav(&ctx.workspace.artifact_path("audio.accompaniment")?)?;
        if rate != SAMPLE_RATE {
            return Err(DubError::InvalidDocument {
                artifact: "audio.accompaniment".to_owned(),
                message: format!("expected {SAMPLE_RATE} Hz, got {rate}"),
            });
        }

        let mixed = mix_timeline(
            &dub,
            &index,
            &ctx.workspace.artifact_path("tts.segments")?,
            Some(&accompaniment),
            &ctx.config.mix,
        )?;
        write_wav_atomic(
            &ctx.workspace.prepare_artifact_path("audio.mix")?,
            &mixed,
            SAMPLE_RATE,
        )
    }
}

// ---------------------------------------------------------------------------
// burn
// ---------------------------------------------------------------------------

pub struct BurnPhase;

impl Phase for BurnPhase {
    fn name(&self) -> &'static str {
        "burn"
    }
    fn version(&self) -> u32 {
        1
    }
    fn requires(&self) -> Vec<&'static str> {
        vec!["audio.mix", "render.en_srt"]
    }
    fn provides(&self) -> Vec<&'static str> {
        vec!["render.dubbed"]
    }
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()> {
        let mix = ctx.workspace.artifact_path("audio.mix")?;
        let srt = ctx.workspace.artifact_path("render.en_srt")?;
        let output = ctx.workspace.prepare_artifact_path("render.dubbed")?;
        burn_video(ctx.video, &mix, &srt, &output, ctx.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_match_the_built_pipeline() {
        let phases = build_phases(&ServiceHub::unavailable());
        let names: Vec<&str> = phases.iter().map(|p| p.name()).collect();
        assert_eq!(names, phase_names());
    }

    #[test]
    fn every_required_key_is_provided_upstream() {
        let phases = build_phases(&ServiceHub::unavailable());

        let mut provided: Vec<&str> = Vec::new();
        for phase in &phases {
            for key in phase.requires() {
                assert!(
                    provided.contains(&key),
                    "phase `{}` requires `{key}` before any phase provides it",
                    phase.name()
                );
            }
            provided.extend(phase.provides());
        }
    }

    #[test]
    fn every_declared_artifact_key_resolves_in_the_layout() {
        let workspace = crate::workspace::Workspace::new(std::path::PathBuf::from("/w/ep"));
        for phase in build_phases(&ServiceHub::unavailable()) {
            for key in phase.requires().into_iter().chain(phase.provides()) {
                workspace
                    .artifact_path(key)
                    .unwrap_or_else(|_| panic!("key `{key}` of `{}` unknown", phase.name()));
            }
        }
    }
}
