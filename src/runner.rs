//! Incremental phase runner.
//!
//! Phases execute in strict linear order over an exclusive workspace. Each
//! phase declares the artifact keys it requires and provides; the runner
//! resolves paths, fingerprints inputs and outputs, and decides run-or-skip
//! from the manifest. Skipping writes nothing, so a no-change rerun leaves
//! the manifest byte-identical.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::error::{DubError, DubResult};
use crate::fingerprint::{config_fingerprint, hash_artifact};
use crate::manifest::{Manifest, PhaseRecord, PhaseStatus, now_rfc3339};
use crate::workspace::Workspace;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<String>,
    deadline: Option<Instant>,
}

/// Cooperative cancellation shared by every task inside a phase.
///
/// Tasks call [`CancellationToken::checkpoint`] at I/O boundaries; external
/// commands are polled against it and killed on trip.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(String::new()),
                deadline: None,
            }),
        }
    }

    #[must_use]
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(String::new()),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    pub fn cancel(&self, reason: &str) {
        if let Ok(mut slot) = self.inner.reason.lock() {
            if slot.is_empty() {
                *slot = reason.to_owned();
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` when the token tripped or the deadline passed.
    pub fn checkpoint(&self) -> DubResult<()> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            let reason = self
                .inner
                .reason
                .lock()
                .map(|r| r.clone())
                .unwrap_or_default();
            let reason = if reason.is_empty() {
                "cancellation requested".to_owned()
            } else {
                reason
            };
            return Err(DubError::Cancelled(reason));
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Err(DubError::Cancelled("deadline exceeded".to_owned()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workspace lock
// ---------------------------------------------------------------------------

/// The single mutual-exclusion primitive for a workspace: a lock file
/// created with `create_new`, removed on drop (failure paths included).
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(workspace: &Workspace) -> DubResult<Self> {
        let path = workspace.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(DubError::WorkspaceLocked(path))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Phase protocol
// ---------------------------------------------------------------------------

/// Everything a phase needs at run time. Services live inside the phase
/// structs themselves; the context carries only shared run state.
pub struct PhaseContext<'a> {
    pub workspace: &'a Workspace,
    pub config: &'a AppConfig,
    pub token: &'a CancellationToken,
    /// The input video this episode was created from.
    pub video: &'a Path,
}

/// One node in the pipeline: stable name, monotonic version, declared
/// inputs and outputs, and the work itself.
pub trait Phase {
    fn name(&self) -> &'static str;
    fn version(&self) -> u32;
    fn requires(&self) -> Vec<&'static str>;
    fn provides(&self) -> Vec<&'static str>;
    fn run(&self, ctx: &PhaseContext<'_>) -> DubResult<()>;
}

/// Why a phase is about to run (or why it was skipped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Run(String),
    Skip,
}

#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase: String,
    pub ran: bool,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct PhaseRunner<'a> {
    workspace: &'a Workspace,
    config: &'a AppConfig,
    manifest: Manifest,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(workspace: &'a Workspace, config: &'a AppConfig) -> DubResult<Self> {
        let manifest = Manifest::load_or_create(workspace.manifest_path())?;
        Ok(Self {
            workspace,
            config,
            manifest,
        })
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Evaluate the should-run rules in order; the first match wins.
    pub fn should_run(&self, phase: &dyn Phase, forced: bool) -> DubResult<Decision> {
        // 1. User-forced rerun.
        if forced {
            return Ok(Decision::Run("forced".to_owned()));
        }

        // 2. Never ran.
        let Some(record) = self.manifest.record(phase.name()) else {
            return Ok(Decision::Run("no manifest record".to_owned()));
        };

        // 3. Phase logic changed.
        if record.version != phase.version() {
            return Ok(Decision::Run(format!(
                "version changed: {} -> {}",
                record.version,
                phase.version()
            )));
        }

        // 4. Any input artifact changed since this phase last consumed it.
        for key in phase.requires() {
            let path = self.workspace.artifact_path(key)?;
            if !path.exists() {
                return Ok(Decision::Run(format!("input `{key}` missing on disk")));
            }
            let current = hash_artifact(&path)?;
            match record.input_fingerprints.get(key) {
                Some(recorded) if *recorded == current => {}
                _ => {
                    return Ok(Decision::Run(format!("input `{key}` changed")));
                }
            }
        }

        // 5. Effective configuration changed.
        let config_fp = config_fingerprint(&self.config.phase_section(phase.name()));
        if record.config_fingerprint != config_fp {
            return Ok(Decision::Run("config changed".to_owned()));
        }

        // 6. Any output artifact edited or deleted since it was committed.
        //    This is what lets hand-edits to authoritative documents force
        //    regeneration, unless the edit was blessed.
        for key in phase.provides() {
            let path = self.workspace.artifact_path(key)?;
            if !path.exists() {
                return Ok(Decision::Run(format!("output `{key}` missing on disk")));
            }
            let current = hash_artifact(&path)?;
            match record.output_fingerprints.get(key) {
                Some(recorded) if *recorded == current => {}
                _ => {
                    return Ok(Decision::Run(format!("output `{key}` changed on disk")));
                }
            }
        }

        // 7. Last attempt did not succeed.
        if record.status != PhaseStatus::Succeeded {
            return Ok(Decision::Run(format!("status is {:?}", record.status)));
        }

        // 8. Up to date.
        Ok(Decision::Skip)
    }

    /// Run one phase (or skip it). A skip writes nothing to the manifest.
    pub fn run_phase(
        &mut self,
        phase: &dyn Phase,
        ctx: &PhaseContext<'_>,
        forced: bool,
    ) -> DubResult<PhaseOutcome> {
        let name = phase.name();
        let reason = match self.should_run(phase, forced)? {
            Decision::Skip => {
                tracing::info!(phase = name, "skipped (up to date)");
                return Ok(PhaseOutcome {
                    phase: name.to_owned(),
                    ran: false,
                    reason: "up to date".to_owned(),
                });
            }
            Decision::Run(reason) => reason,
        };

        ctx.token.checkpoint()?;
        tracing::info!(phase = name, reason = %reason, "running");
        let started_at = now_rfc3339();

        let config_fp = config_fingerprint(&self.config.phase_section(name));
        let input_fingerprints = match self.fingerprint_keys(&phase.requires()) {
            Ok(map) => map,
            Err(err) => {
                self.manifest.set_record(
                    name,
                    PhaseRecord {
                        status: PhaseStatus::Failed,
                        version: phase.version(),
                        config_fingerprint: config_fp,
                        input_fingerprints: BTreeMap::new(),
                        output_fingerprints: BTreeMap::new(),
                        started_at,
                        finished_at: now_rfc3339(),
                        error: Some(format!("[{}] {err}", err.error_code())),
                    },
                );
                self.manifest.save()?;
                return Err(err);
            }
        };

        match phase.run(ctx) {
            Ok(()) => {
                let output_fingerprints = self.fingerprint_outputs(phase)?;
                self.manifest.set_record(
                    name,
                    PhaseRecord {
                        status: PhaseStatus::Succeeded,
                        version: phase.version(),
                        config_fingerprint: config_fp,
                        input_fingerprints,
                        output_fingerprints,
                        started_at,
                        finished_at: now_rfc3339(),
                        error: None,
                    },
                );
                self.manifest.save()?;
                tracing::info!(phase = name, "succeeded");
                Ok(PhaseOutcome {
                    phase: name.to_owned(),
                    ran: true,
                    reason,
                })
            }
            // A cancelled phase leaves no manifest update.
            Err(err @ DubError::Cancelled(_)) => Err(err),
            Err(err) => {
                tracing::error!(phase = name, error = %err, "failed");
                self.manifest.set_record(
                    name,
                    PhaseRecord {
                        status: PhaseStatus::Failed,
                        version: phase.version(),
                        config_fingerprint: config_fp,
                        input_fingerprints,
                        output_fingerprints: BTreeMap::new(),
                        started_at,
                        finished_at: now_rfc3339(),
                        error: Some(format!("[{}] {err}", err.error_code())),
                    },
                );
                self.manifest.save()?;
                Err(err)
            }
        }
    }

    /// Run phases in order. `from` forces that phase and all successors;
    /// `to` stops after the named phase. A failure halts the run.
    pub fn run_pipeline(
        &mut self,
        phases: &[&dyn Phase],
        ctx: &PhaseContext<'_>,
        from: Option<&str>,
        to: Option<&str>,
    ) -> DubResult<Vec<PhaseOutcome>> {
        let index_of = |name: &str| -> DubResult<usize> {
            phases
                .iter()
                .position(|p| p.name() == name)
                .ok_or_else(|| DubError::Config(format!("unknown phase `{name}`")))
        };

        let force_from = from.map(&index_of).transpose()?;
        let stop_after = to.map(&index_of).transpose()?;
        if let (Some(f), Some(t)) = (force_from, stop_after) {
            if f > t {
                return Err(DubError::Config(format!(
                    "--from `{}` is after --to `{}`",
                    from.unwrap_or_default(),
                    to.unwrap_or_default()
                )));
            }
        }

        let mut outcomes = Vec::new();
        for (idx, phase) in phases.iter().enumerate() {
            if let Some(stop) = stop_after {
                if idx > stop {
                    break;
                }
            }
            let forced = force_from.is_some_and(|f| idx >= f);
            let outcome = self.run_phase(*phase, ctx, forced)?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Re-baseline the named phase's output fingerprints from disk so that
    /// hand-edited authoritative files survive subsequent runs.
    pub fn bless(&mut self, phase: &dyn Phase) -> DubResult<()> {
        let fingerprints = self.fingerprint_outputs(phase)?;
        self.manifest.bless(phase.name(), fingerprints)?;
        self.manifest.save()?;
        tracing::info!(phase = phase.name(), "blessed current outputs");
        Ok(())
    }

    fn fingerprint_keys(&self, keys: &[&'static str]) -> DubResult<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for key in keys {
            let path = self.workspace.artifact_path(key)?;
            if !path.exists() {
                return Err(DubError::MissingArtifact {
                    key: (*key).to_owned(),
                    path,
                });
            }
            map.insert((*key).to_owned(), hash_artifact(&path)?);
        }
        Ok(map)
    }

    fn fingerprint_outputs(&self, phase: &dyn Phase) -> DubResult<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for key in phase.provides() {
            let path = self.workspace.artifact_path(key)?;
            if !path.exists() {
                return Err(DubError::PhaseFailed {
                    phase: phase.name().to_owned(),
                    activity: "committing outputs".to_owned(),
                    artifact: key.to_owned(),
                    message: format!("declared output was not written: {}", path.display()),
                });
            }
            map.insert(key.to_owned(), hash_artifact(&path)?);
        }
        Ok(map)
    }
}
