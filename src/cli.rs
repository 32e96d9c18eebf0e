//! Command-line surface: `run`, `bless`, `phases`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};

use crate::error::{DubError, DubResult};
use crate::workspace::Workspace;

// ---------------------------------------------------------------------------
// Graceful Ctrl+C shutdown
// ---------------------------------------------------------------------------

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Coordinates graceful Ctrl+C shutdown.
///
/// The signal handler sets a global flag and fires an optional callback
/// (used to trip the pipeline's cancellation token). Phases observe the
/// flag through the token at their next I/O boundary.
pub struct ShutdownController;

impl ShutdownController {
    /// Install the Ctrl+C handler. Errors are non-fatal; callers may log
    /// and continue.
    pub fn install(on_signal: Option<Box<dyn Fn() + Send + Sync + 'static>>) -> DubResult<()> {
        ctrlc::set_handler(move || {
            SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received (Ctrl+C)");
            if let Some(ref callback) = on_signal {
                callback();
            }
        })
        .map_err(|e| DubError::Io(std::io::Error::other(format!("ctrlc handler: {e}"))))?;
        Ok(())
    }

    #[must_use]
    pub fn is_shutting_down() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }

    /// Programmatic trigger, for tests and internal cancel paths.
    pub fn trigger_shutdown() {
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn reset() {
        SHUTDOWN_FLAG.store(false, Ordering::SeqCst);
    }

    /// Exit code when terminating due to a signal (128 + SIGINT).
    #[must_use]
    pub const fn signal_exit_code() -> i32 {
        130
    }
}

// ---------------------------------------------------------------------------
// Argument surface
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "redub")]
#[command(about = "Incremental dubbing pipeline: Chinese short-form video to English dub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline incrementally over one video.
    Run(RunArgs),
    /// Re-baseline a phase's output fingerprints after a manual edit.
    Bless(BlessArgs),
    /// List pipeline phases in execution order.
    Phases,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Input video file.
    pub video: PathBuf,

    /// Force this phase and all its successors to rerun.
    #[arg(long, value_name = "PHASE")]
    pub from: Option<String>,

    /// Stop after this phase.
    #[arg(long, value_name = "PHASE")]
    pub to: Option<String>,

    /// Episode workspace directory (default: <video dir>/dub/<video stem>).
    #[arg(long)]
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct BlessArgs {
    /// Input video file the workspace belongs to.
    pub video: PathBuf,

    /// Phase whose on-disk outputs become the new baseline.
    pub phase: String,

    /// Episode workspace directory (default: <video dir>/dub/<video stem>).
    #[arg(long)]
    pub workspace: Option<PathBuf>,
}

/// Resolve the episode workspace for a video: an explicit override, or
/// `<video dir>/dub/<video stem>` (the show directory is then
/// `<video dir>/dub`, holding `voices/` and `dict/`).
pub fn workspace_for(video: &std::path::Path, explicit: Option<&PathBuf>) -> DubResult<Workspace> {
    if let Some(root) = explicit {
        return Ok(Workspace::new(root.clone()));
    }
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| {
            DubError::Config(format!("cannot derive workspace from {}", video.display()))
        })?;
    let parent = video.parent().unwrap_or_else(|| std::path::Path::new("."));
    Ok(Workspace::new(parent.join("dub").join(stem)))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::parse_from([
            "redub", "run", "ep01.mp4", "--from", "translate", "--to", "mix",
        ]);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.video, PathBuf::from("ep01.mp4"));
                assert_eq!(args.from.as_deref(), Some("translate"));
                assert_eq!(args.to.as_deref(), Some("mix"));
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn bless_arguments_parse() {
        let cli = Cli::parse_from(["redub", "bless", "ep01.mp4", "subtitle"]);
        match cli.command {
            Command::Bless(args) => {
                assert_eq!(args.phase, "subtitle");
            }
            other => panic!("expected bless, got {other:?}"),
        }
    }

    #[test]
    fn workspace_defaults_next_to_the_video() {
        let ws = workspace_for(std::path::Path::new("/videos/show/3.mp4"), None).unwrap();
        assert_eq!(ws.root(), std::path::Path::new("/videos/show/dub/3"));
        assert_eq!(
            ws.speaker_to_role_path(),
            std::path::Path::new("/videos/show/dub/voices/speaker_to_role.json")
        );
    }

    #[test]
    fn workspace_override_wins() {
        let explicit = PathBuf::from("/elsewhere/ep");
        let ws = workspace_for(std::path::Path::new("/videos/3.mp4"), Some(&explicit)).unwrap();
        assert_eq!(ws.root(), std::path::Path::new("/elsewhere/ep"));
    }

    #[test]
    fn shutdown_flag_roundtrip() {
        ShutdownController::reset();
        assert!(!ShutdownController::is_shutting_down());
        ShutdownController::trigger_shutdown();
        assert!(ShutdownController::is_shutting_down());
        ShutdownController::reset();
    }
}
