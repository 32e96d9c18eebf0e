//! Audio plumbing: WAV io, PCM helpers, and the ffmpeg/separator command
//! wrappers.
//!
//! Everything in the pipeline is 16 kHz mono s16le. Decoding from the
//! source container, tempo compression, and subtitle burning go through
//! ffmpeg; vocal separation is an opaque external process. Sample-level
//! work (trimming, placement, ducking, loudness) is done natively so the
//! timeline invariants stay testable.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{SAMPLE_RATE, SeparateSettings, duration_from_env};
use crate::error::{DubError, DubResult};
use crate::process::{run_command_cancellable, run_command_with_timeout};
use crate::runner::CancellationToken;

// ---------------------------------------------------------------------------
// WAV io
// ---------------------------------------------------------------------------

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

pub fn read_wav(path: &Path) -> DubResult<(Vec<i16>, u32)> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| DubError::InvalidDocument {
            artifact: path.display().to_string(),
            message: format!("not a readable wav: {e}"),
        })?;
    collect_samples(reader, &path.display().to_string())
}

pub fn wav_from_bytes(bytes: &[u8]) -> DubResult<(Vec<i16>, u32)> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| DubError::InvalidDocument {
        artifact: "wav bytes".to_owned(),
        message: format!("not a readable wav: {e}"),
    })?;
    collect_samples(reader, "wav bytes")
}

fn collect_samples<R: std::io::Read>(
    mut reader: hound::WavReader<R>,
    what: &str,
) -> DubResult<(Vec<i16>, u32)> {
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(DubError::InvalidDocument {
            artifact: what.to_owned(),
            message: format!(
                "expected 16-bit integer pcm, got {:?}/{} bits",
                spec.sample_format, spec.bits_per_sample
            ),
        });
    }
    let channels = spec.channels.max(1) as usize;
    let raw: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    let raw = raw.map_err(|e| DubError::InvalidDocument {
        artifact: what.to_owned(),
        message: format!("wav decode: {e}"),
    })?;

    // Downmix interleaved channels by averaging.
    let samples = if channels == 1 {
        raw
    } else {
        raw.chunks(channels)
            .map(|frame| {
                let sum: i64 = frame.iter().map(|s| i64::from(*s)).sum();
                (sum / frame.len() as i64) as i16
            })
            .collect()
    };
    Ok((samples, spec.sample_rate))
}

/// Serialize samples as a WAV byte blob.
pub fn wav_to_bytes(samples: &[i16], sample_rate: u32) -> DubResult<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(sample_rate))
            .map_err(|e| DubError::Config(format!("wav encode: {e}")))?;
        for sample in samples {
            writer
                .write_sample(*sample)
                .map_err(|e| DubError::Config(format!("wav encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| DubError::Config(format!("wav encode: {e}")))?;
    }
    Ok(cursor.into_inner())
}

/// Write a WAV atomically (encode to bytes, temp-then-rename).
pub fn write_wav_atomic(path: &Path, samples: &[i16], sample_rate: u32) -> DubResult<()> {
    let bytes = wav_to_bytes(samples, sample_rate)?;
    crate::workspace::write_atomic(path, &bytes)
}

// ---------------------------------------------------------------------------
// PCM helpers
// ---------------------------------------------------------------------------

#[must_use]
pub fn ms_to_samples(ms: u64, sample_rate: u32) -> usize {
    (ms as u128 * sample_rate as u128 / 1_000) as usize
}

#[must_use]
pub fn samples_to_ms(samples: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (samples as u128 * 1_000 / sample_rate as u128) as u64
}

#[must_use]
pub fn silence(ms: u64, sample_rate: u32) -> Vec<i16> {
    vec![0; ms_to_samples(ms, sample_rate)]
}

/// Strip leading and trailing samples whose amplitude is below
/// `threshold` (a fraction of full scale).
#[must_use]
pub fn trim_silence(samples: &[i16], threshold: f64) -> Vec<i16> {
    let floor = (threshold.clamp(0.0, 1.0) * f64::from(i16::MAX)) as i16;
    let is_loud = |s: &i16| s.saturating_abs() > floor;

    let Some(first) = samples.iter().position(is_loud) else {
        return Vec::new();
    };
    let last = samples.iter().rposition(is_loud).unwrap_or(first);
    samples[first..=last].to_vec()
}

// ---------------------------------------------------------------------------
// ffmpeg wrappers
// ---------------------------------------------------------------------------

fn ffmpeg_timeout() -> Duration {
    duration_from_env("REDUB_FFMPEG_TIMEOUT_MS", Duration::from_secs(300))
}

fn ffprobe_timeout() -> Duration {
    duration_from_env("REDUB_FFPROBE_TIMEOUT_MS", Duration::from_secs(10))
}

/// Demux the source audio track into a 16 kHz mono WAV.
pub fn extract_audio(video: &Path, output: &Path, token: &CancellationToken) -> DubResult<()> {
    let args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        video.display().to_string(),
        "-vn".to_owned(),
        "-ac".to_owned(),
        "1".to_owned(),
        "-ar".to_owned(),
        SAMPLE_RATE.to_string(),
        "-c:a".to_owned(),
        "pcm_s16le".to_owned(),
        output.display().to_string(),
    ];
    run_command_cancellable("ffmpeg", &args, None, token, Some(ffmpeg_timeout()))?;
    Ok(())
}

/// Time-compress a WAV by `rate` without pitch change (ffmpeg `atempo`).
pub fn compress_tempo(
    input: &Path,
    output: &Path,
    rate: f64,
    token: &CancellationToken,
) -> DubResult<()> {
    let args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        input.display().to_string(),
        "-filter:a".to_owned(),
        format!("atempo={rate:.4}"),
        "-ar".to_owned(),
        SAMPLE_RATE.to_string(),
        "-ac".to_owned(),
        "1".to_owned(),
        "-c:a".to_owned(),
        "pcm_s16le".to_owned(),
        output.display().to_string(),
    ];
    run_command_cancellable("ffmpeg", &args, None, token, Some(ffmpeg_timeout()))?;
    Ok(())
}

/// Container duration in milliseconds via ffprobe.
pub fn probe_duration_ms(input: &Path) -> Option<u64> {
    let args = vec![
        "-v".to_owned(),
        "error".to_owned(),
        "-show_entries".to_owned(),
        "format=duration".to_owned(),
        "-of".to_owned(),
        "default=nokey=1:noprint_wrappers=1".to_owned(),
        input.display().to_string(),
    ];
    let output = run_command_with_timeout("ffprobe", &args, None, Some(ffprobe_timeout())).ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let secs = stdout.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some((secs * 1_000.0).round() as u64)
}

/// Mux the mixed track back under the video and burn the subtitles in.
pub fn burn_video(
    video: &Path,
    mix: &Path,
    subtitles: &Path,
    output: &Path,
    token: &CancellationToken,
) -> DubResult<()> {
    let args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        video.display().to_string(),
        "-i".to_owned(),
        mix.display().to_string(),
        "-map".to_owned(),
        "0:v:0".to_owned(),
        "-map".to_owned(),
        "1:a:0".to_owned(),
        "-vf".to_owned(),
        format!("subtitles={}", subtitles.display()),
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-c:a".to_owned(),
        "aac".to_owned(),
        output.display().to_string(),
    ];
    run_command_cancellable("ffmpeg", &args, None, token, Some(ffmpeg_timeout()))?;
    Ok(())
}

/// Run the external vocal separator, then normalize its two stems into the
/// declared artifact paths.
pub fn separate_vocals(
    audio: &Path,
    vocals_out: &Path,
    accompaniment_out: &Path,
    settings: &SeparateSettings,
    token: &CancellationToken,
) -> DubResult<()> {
    let staging = tempfile::tempdir()?;
    let args = vec![
        "--two-stems=vocals".to_owned(),
        "-n".to_owned(),
        settings.model.clone(),
        "-d".to_owned(),
        settings.device.clone(),
        "-o".to_owned(),
        staging.path().display().to_string(),
        audio.display().to_string(),
    ];
    run_command_cancellable(
        "demucs",
        &args,
        None,
        token,
        Some(duration_from_env(
            "REDUB_SEPARATE_TIMEOUT_MS",
            Duration::from_secs(1_800),
        )),
    )?;

    let stem_name = audio
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_owned());
    let stem_dir = staging.path().join(&settings.model).join(stem_name);
    resample_stem(&stem_dir.join("vocals.wav"), vocals_out, token)?;
    resample_stem(&stem_dir.join("no_vocals.wav"), accompaniment_out, token)?;
    Ok(())
}

fn resample_stem(stem: &Path, output: &Path, token: &CancellationToken) -> DubResult<PathBuf> {
    if !stem.exists() {
        return Err(DubError::MissingArtifact {
            key: "separator stem".to_owned(),
            path: stem.to_path_buf(),
        });
    }
    let args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        stem.display().to_string(),
        "-ac".to_owned(),
        "1".to_owned(),
        "-ar".to_owned(),
        SAMPLE_RATE.to_string(),
        "-c:a".to_owned(),
        "pcm_s16le".to_owned(),
        output.display().to_string(),
    ];
    run_command_cancellable("ffmpeg", &args, None, token, Some(ffmpeg_timeout()))?;
    Ok(output.to_path_buf())
}
