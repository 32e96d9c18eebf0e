//! Per-episode manifest: one JSON file recording, for every phase, the
//! fingerprints it ran against and the fingerprints it produced.
//!
//! The manifest is rewritten wholly and atomically on each commit. Records
//! carry per-key fingerprint maps so the runner can point at the exact
//! artifact that invalidated a phase.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{DubError, DubResult};
use crate::workspace::write_json_atomic;

pub const MANIFEST_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    pub version: u32,
    pub config_fingerprint: String,
    /// Input artifact key → fingerprint observed when the phase ran.
    pub input_fingerprints: BTreeMap<String, String>,
    /// Output artifact key → fingerprint committed after the phase ran
    /// (or after a `bless`).
    pub output_fingerprints: BTreeMap<String, String>,
    pub started_at: String,
    pub finished_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInfo {
    pub run_id: String,
    pub video: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestData {
    schema_version: String,
    job: JobInfo,
    phases: BTreeMap<String, PhaseRecord>,
}

#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    data: ManifestData,
}

impl Manifest {
    /// Load an existing manifest or start an empty one.
    pub fn load_or_create(path: PathBuf) -> DubResult<Self> {
        let data = if path.exists() {
            let body = fs::read_to_string(&path)?;
            serde_json::from_str(&body).map_err(|e| DubError::InvalidDocument {
                artifact: "manifest".to_owned(),
                message: e.to_string(),
            })?
        } else {
            ManifestData {
                schema_version: MANIFEST_SCHEMA_VERSION.to_owned(),
                job: JobInfo {
                    run_id: uuid::Uuid::new_v4().to_string(),
                    video: String::new(),
                },
                phases: BTreeMap::new(),
            }
        };
        Ok(Self { path, data })
    }

    pub fn set_video(&mut self, video: &str) {
        self.data.job.video = video.to_owned();
    }

    #[must_use]
    pub fn job(&self) -> &JobInfo {
        &self.data.job
    }

    #[must_use]
    pub fn record(&self, phase: &str) -> Option<&PhaseRecord> {
        self.data.phases.get(phase)
    }

    #[must_use]
    pub fn phase_names(&self) -> Vec<String> {
        self.data.phases.keys().cloned().collect()
    }

    pub fn set_record(&mut self, phase: &str, record: PhaseRecord) {
        self.data.phases.insert(phase.to_owned(), record);
    }

    /// Re-baseline a phase's output fingerprints to the given on-disk
    /// state. Fails when the phase has never run: there is nothing to
    /// re-baseline.
    pub fn bless(
        &mut self,
        phase: &str,
        output_fingerprints: BTreeMap<String, String>,
    ) -> DubResult<()> {
        let record = self.data.phases.get_mut(phase).ok_or_else(|| {
            DubError::Config(format!(
                "cannot bless `{phase}`: no manifest record (phase has never run)"
            ))
        })?;
        record.output_fingerprints = output_fingerprints;
        Ok(())
    }

    /// Persist atomically (temp-then-rename).
    pub fn save(&self) -> DubResult<()> {
        write_json_atomic(&self.path, &self.data)
    }
}

/// Current wall-clock time as RFC 3339, the timestamp format used in
/// manifest records.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PhaseRecord {
        PhaseRecord {
            status: PhaseStatus::Succeeded,
            version: 1,
            config_fingerprint: "cfg".to_owned(),
            input_fingerprints: BTreeMap::from([("a.in".to_owned(), "f1".to_owned())]),
            output_fingerprints: BTreeMap::from([("a.out".to_owned(), "f2".to_owned())]),
            started_at: now_rfc3339(),
            finished_at: now_rfc3339(),
            error: None,
        }
    }

    #[test]
    fn roundtrips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("manifest.json");

        let mut manifest = Manifest::load_or_create(path.clone()).unwrap();
        manifest.set_video("ep01.mp4");
        manifest.set_record("subtitle", sample_record());
        manifest.save().unwrap();

        let reloaded = Manifest::load_or_create(path).unwrap();
        assert_eq!(reloaded.job().video, "ep01.mp4");
        let record = reloaded.record("subtitle").expect("record persisted");
        assert_eq!(record.status, PhaseStatus::Succeeded);
        assert_eq!(record.output_fingerprints["a.out"], "f2");
    }

    #[test]
    fn run_id_is_stable_across_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("manifest.json");

        let manifest = Manifest::load_or_create(path.clone()).unwrap();
        let run_id = manifest.job().run_id.clone();
        manifest.save().unwrap();

        let reloaded = Manifest::load_or_create(path).unwrap();
        assert_eq!(reloaded.job().run_id, run_id);
    }

    #[test]
    fn bless_overwrites_output_fingerprints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manifest = Manifest::load_or_create(dir.path().join("manifest.json")).unwrap();
        manifest.set_record("subtitle", sample_record());

        manifest
            .bless(
                "subtitle",
                BTreeMap::from([("a.out".to_owned(), "edited".to_owned())]),
            )
            .unwrap();

        assert_eq!(
            manifest.record("subtitle").unwrap().output_fingerprints["a.out"],
            "edited"
        );
    }

    #[test]
    fn bless_unknown_phase_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manifest = Manifest::load_or_create(dir.path().join("manifest.json")).unwrap();
        let err = manifest.bless("mix", BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("never run"));
    }

    #[test]
    fn malformed_manifest_is_an_input_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Manifest::load_or_create(path).unwrap_err();
        assert!(matches!(err, DubError::InvalidDocument { .. }));
    }
}
