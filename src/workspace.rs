//! Episode workspace layout and atomic file writes.
//!
//! All artifact paths are deterministic and workspace-relative:
//!
//! ```text
//! manifest.json
//! source/{recognition_raw, subtitle_model, dub_model}.json
//! derive/{subtitle_align, voice_assignment}.json
//! mt/{input, output}.jsonl
//! tts/segments/<utt_id>.wav
//! tts/segments.json
//! tts/report.json
//! audio/{source, vocals, accompaniment, mix}.wav
//! render/{en.srt, zh.srt, dubbed.mp4}
//! ```
//!
//! Show-level files (one directory up): `voices/speaker_to_role.json`,
//! `voices/role_cast.json`, `dict/glossary.json`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{DubError, DubResult};

/// Artifact key → workspace-relative path table. Keys use `domain.object`.
const ARTIFACT_PATHS: &[(&str, &str)] = &[
    ("audio.source", "audio/source.wav"),
    ("audio.vocals", "audio/vocals.wav"),
    ("audio.accompaniment", "audio/accompaniment.wav"),
    ("audio.mix", "audio/mix.wav"),
    ("source.recognition_raw", "source/recognition_raw.json"),
    ("source.subtitle_model", "source/subtitle_model.json"),
    ("source.dub_model", "source/dub_model.json"),
    ("derive.subtitle_align", "derive/subtitle_align.json"),
    ("derive.voice_assignment", "derive/voice_assignment.json"),
    ("mt.input", "mt/input.jsonl"),
    ("mt.output", "mt/output.jsonl"),
    ("tts.segments", "tts/segments"),
    ("tts.segments_index", "tts/segments.json"),
    ("tts.report", "tts/report.json"),
    ("render.en_srt", "render/en.srt"),
    ("render.zh_srt", "render/zh.srt"),
    ("render.dubbed", "render/dubbed.mp4"),
];

/// A per-episode workspace rooted next to its sibling episodes under a show
/// directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The episode identifier, derived from the workspace directory name.
    #[must_use]
    pub fn episode_id(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "episode".to_owned())
    }

    /// Resolve an artifact key to its absolute path.
    pub fn artifact_path(&self, key: &str) -> DubResult<PathBuf> {
        let rel = ARTIFACT_PATHS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, rel)| rel)
            .ok_or_else(|| DubError::Config(format!("unknown artifact key `{key}`")))?;
        Ok(self.root.join(rel))
    }

    /// Resolve an artifact key and create its parent directory.
    pub fn prepare_artifact_path(&self, key: &str) -> DubResult<PathBuf> {
        let path = self.artifact_path(key)?;
        let parent = if key == "tts.segments" {
            path.as_path()
        } else {
            path.parent().unwrap_or(&self.root)
        };
        fs::create_dir_all(parent)?;
        Ok(path)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    #[must_use]
    pub fn synth_cache_dir(&self) -> PathBuf {
        self.root.join("tts/cache")
    }

    /// The show directory one level above the episode workspace.
    #[must_use]
    pub fn show_dir(&self) -> PathBuf {
        self.root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone())
    }

    #[must_use]
    pub fn speaker_to_role_path(&self) -> PathBuf {
        self.show_dir().join("voices/speaker_to_role.json")
    }

    #[must_use]
    pub fn role_cast_path(&self) -> PathBuf {
        self.show_dir().join("voices/role_cast.json")
    }

    #[must_use]
    pub fn glossary_path(&self) -> PathBuf {
        self.show_dir().join("dict/glossary.json")
    }

    /// All artifact keys known to the layout, in declaration order.
    #[must_use]
    pub fn known_keys() -> Vec<&'static str> {
        ARTIFACT_PATHS.iter().map(|(k, _)| *k).collect()
    }
}

/// Write bytes atomically: temp file in the target directory, then rename.
///
/// A reader never observes a partially written artifact, and a cancelled
/// writer leaves nothing at the declared path.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> DubResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DubError::Config(format!("path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| DubError::Io(e.error))?;
    Ok(())
}

/// Serialize a value to pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> DubResult<()> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    write_atomic(path, body.as_bytes())
}
