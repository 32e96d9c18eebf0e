use std::sync::Arc;

use clap::Parser;
use redub::cli::{BlessArgs, Cli, Command, RunArgs, ShutdownController, workspace_for};
use redub::config::{AppConfig, Credentials};
use redub::phases::{ServiceHub, build_phases, phase_names};
use redub::runner::{CancellationToken, PhaseContext, PhaseRunner, WorkspaceLock};
use redub::services::{
    HttpObjectStore, HttpRecognitionService, HttpSynthesisService, HttpTranslationService,
};
use redub::{DubError, DubResult};

fn main() {
    redub::logging::init();

    if let Err(error) = run() {
        if ShutdownController::is_shutting_down() {
            eprintln!("interrupted");
            std::process::exit(ShutdownController::signal_exit_code());
        }
        eprintln!("error: {error}");
        std::process::exit(1);
    }

    if ShutdownController::is_shutting_down() {
        std::process::exit(ShutdownController::signal_exit_code());
    }
}

fn run() -> DubResult<()> {
    let cli = Cli::parse();
    let config = AppConfig::default();

    match cli.command {
        Command::Run(args) => run_pipeline(&args, &config),
        Command::Bless(args) => bless(&args, &config),
        Command::Phases => {
            for name in phase_names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn run_pipeline(args: &RunArgs, config: &AppConfig) -> DubResult<()> {
    if !args.video.exists() {
        return Err(DubError::Config(format!(
            "input video does not exist: {}",
            args.video.display()
        )));
    }

    // Credentials are validated before any phase starts.
    let credentials = Credentials::from_env()?;
    let hub = ServiceHub {
        recognition: Arc::new(HttpRecognitionService::new(
            config.recognize.endpoint.clone(),
            &credentials,
        )?),
        translation: Arc::new(HttpTranslationService::new(
            config.translate.endpoint.clone(),
            &credentials,
        )?),
        synthesis: Arc::new(HttpSynthesisService::new(
            config.synth.endpoint.clone(),
            &credentials,
        )?),
        store: Arc::new(HttpObjectStore::new(
            config.recognize.store_endpoint.clone(),
            &credentials,
        )?),
    };

    let workspace = workspace_for(&args.video, args.workspace.as_ref())?;
    let _lock = WorkspaceLock::acquire(&workspace)?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    if let Err(error) = ShutdownController::install(Some(Box::new(move || {
        signal_token.cancel("interrupted by Ctrl+C");
    }))) {
        tracing::warn!("failed to install Ctrl+C handler: {error}");
    }

    let phases = build_phases(&hub);
    let phase_refs: Vec<&dyn redub::Phase> = phases.iter().map(AsRef::as_ref).collect();

    let mut runner = PhaseRunner::new(&workspace, config)?;
    let ctx = PhaseContext {
        workspace: &workspace,
        config,
        token: &token,
        video: &args.video,
    };
    let outcomes = runner.run_pipeline(&phase_refs, &ctx, args.from.as_deref(), args.to.as_deref())?;

    for outcome in &outcomes {
        let state = if outcome.ran { "ran" } else { "skipped" };
        println!("{:<12} {state:<8} {}", outcome.phase, outcome.reason);
    }
    print_synthesis_summary(&workspace);
    Ok(())
}

fn bless(args: &BlessArgs, config: &AppConfig) -> DubResult<()> {
    let workspace = workspace_for(&args.video, args.workspace.as_ref())?;
    let _lock = WorkspaceLock::acquire(&workspace)?;

    let hub = ServiceHub::unavailable();
    let phases = build_phases(&hub);
    let phase = phases
        .iter()
        .find(|p| p.name() == args.phase)
        .ok_or_else(|| DubError::Config(format!("unknown phase `{}`", args.phase)))?;

    let mut runner = PhaseRunner::new(&workspace, config)?;
    runner.bless(phase.as_ref())?;
    println!("blessed `{}`: current outputs are the new baseline", args.phase);
    Ok(())
}

fn print_synthesis_summary(workspace: &redub::Workspace) {
    let Ok(report_path) = workspace.artifact_path("tts.report") else {
        return;
    };
    if !report_path.exists() {
        return;
    }
    let Ok(report) =
        redub::model::read_document::<redub::synth::TtsReport>(&report_path, "tts.report")
    else {
        return;
    };
    if report.failed > 0 {
        println!(
            "warning: {} of {} utterances fell back to silence (see tts/report.json)",
            report.failed, report.total
        );
    }
}
