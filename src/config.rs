//! Pipeline configuration and provider credentials.
//!
//! Every phase reads its parameters from one section of [`AppConfig`]; the
//! runner fingerprints the section (canonical JSON) so that changing a knob
//! invalidates exactly the phases that consume it.
//!
//! Credentials are environment-only and are validated before any phase
//! runs; a missing variable is a configuration error, never a mid-run
//! surprise.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{DubError, DubResult};

// ---------------------------------------------------------------------------
// Per-phase settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizeSettings {
    /// Recognition service base URL.
    pub endpoint: String,
    /// Object-store base URL the audio is uploaded to for the provider.
    pub store_endpoint: String,
    /// Provider preset requested at submit time.
    pub preset: String,
    /// Source language of the episode audio.
    pub language: String,
    /// Initial delay between poll attempts.
    pub poll_initial_ms: u64,
    /// Ceiling for the exponential poll backoff.
    pub poll_max_ms: u64,
    /// Total budget for the submit/poll cycle; exceeding it fails the phase.
    pub poll_deadline_ms: u64,
    /// Retry budget for transient submit failures.
    pub max_attempts: u32,
}

impl Default for RecognizeSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://asr.volcapi.example/v1".to_owned(),
            store_endpoint: "https://media-store.volcapi.example/redub".to_owned(),
            preset: "asr_spk_semantic".to_owned(),
            language: "zh".to_owned(),
            poll_initial_ms: 500,
            poll_max_ms: 8_000,
            poll_deadline_ms: 600_000,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeSettings {
    /// Inter-word silence at or above this opens a new utterance.
    pub silence_gap_ms: u64,
    /// A candidate never spans more than this.
    pub max_utterance_ms: u64,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            silence_gap_ms: 450,
            max_utterance_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateSettings {
    /// Translation service URL.
    pub endpoint: String,
    pub target_lang: String,
    /// English characters per second used to estimate spoken duration.
    pub chars_per_second: f64,
    /// Whole-episode context offered to the translator, truncated to this.
    pub context_max_chars: usize,
    /// Include the episode transcript as context.
    pub include_episode_context: bool,
    /// Extra instruction injected only when a trigger token occurs in the
    /// utterance source text.
    pub domain_hint: String,
    pub domain_trigger_tokens: Vec<String>,
    /// Shorten-and-retry budget when a translation blows its time budget.
    pub max_retries: u32,
    /// Retry budget for transient service failures.
    pub max_attempts: u32,
}

impl Default for TranslateSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://mt.volcapi.example/v1/translate".to_owned(),
            target_lang: "en".to_owned(),
            chars_per_second: 14.0,
            context_max_chars: 5_000,
            include_episode_context: true,
            domain_hint: String::new(),
            domain_trigger_tokens: Vec::new(),
            max_retries: 3,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignSettings {
    /// Maximum end_ms extension; never crosses the next utterance's start.
    pub max_extend_ms: u64,
    /// Cue fragment length ceiling in characters.
    pub cue_chars: usize,
    /// Default per-utterance synthesis rate ceiling.
    pub max_rate: f64,
}

impl Default for AlignSettings {
    fn default() -> Self {
        Self {
            max_extend_ms: 200,
            cue_chars: 42,
            max_rate: 1.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthSettings {
    /// Synthesis service URL.
    pub endpoint: String,
    /// Concurrent per-utterance synthesis workers.
    pub workers: usize,
    /// Amplitude below this fraction of full scale counts as silence when
    /// trimming segment edges.
    pub trim_threshold: f64,
    /// Bumped when synthesis logic changes; part of the cache content hash.
    pub synthesizer_version: u32,
    /// Retry budget for transient service failures, per utterance.
    pub max_attempts: u32,
}

impl Default for SynthSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://tts.volcapi.example/v1/synthesize".to_owned(),
            workers: 4,
            trim_threshold: 0.01,
            synthesizer_version: 1,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixSettings {
    /// Integrated loudness target for the final track.
    pub target_lufs: f64,
    /// True-peak ceiling in dBTP.
    pub true_peak_dbtp: f64,
    /// Accompaniment gain while speech is active (linear).
    pub duck_gain: f64,
    /// Duck envelope attack/release.
    pub duck_fade_ms: u64,
    /// Permitted segment overflow past its budget.
    pub overflow_ms: u64,
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            target_lufs: -16.0,
            true_peak_dbtp: -1.5,
            duck_gain: 0.3,
            duck_fade_ms: 50,
            overflow_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparateSettings {
    /// Separation model handed to the external separator process.
    pub model: String,
    pub device: String,
}

impl Default for SeparateSettings {
    fn default() -> Self {
        Self {
            model: "htdemucs".to_owned(),
            device: "cpu".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Sample rate every intermediate WAV is normalized to.
pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub recognize: RecognizeSettings,
    pub normalize: NormalizeSettings,
    pub translate: TranslateSettings,
    pub align: AlignSettings,
    pub synth: SynthSettings,
    pub mix: MixSettings,
    pub separate: SeparateSettings,
}

impl AppConfig {
    /// The effective configuration section for a phase, as a JSON value
    /// suitable for fingerprinting. Phases without knobs fingerprint an
    /// empty object.
    #[must_use]
    pub fn phase_section(&self, phase: &str) -> Value {
        match phase {
            "recognize" => json!(self.recognize),
            "subtitle" => json!(self.normalize),
            "translate" => json!(self.translate),
            "align" => json!(self.align),
            "synthesize" => json!(self.synth),
            "mix" => json!(self.mix),
            "separate" => json!(self.separate),
            _ => json!({}),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Provider authentication, environment-only.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub asr_app_id: String,
    pub asr_token: String,
    pub mt_api_key: String,
    pub tts_app_id: String,
    pub tts_token: String,
    pub store_access_key: String,
    pub store_secret_key: String,
}

const REQUIRED_VARS: &[&str] = &[
    "REDUB_ASR_APP_ID",
    "REDUB_ASR_TOKEN",
    "REDUB_MT_API_KEY",
    "REDUB_TTS_APP_ID",
    "REDUB_TTS_TOKEN",
    "REDUB_STORE_ACCESS_KEY",
    "REDUB_STORE_SECRET_KEY",
];

impl Credentials {
    /// Read all provider credentials, reporting every missing variable at
    /// once so the user fixes the environment in a single pass.
    pub fn from_env() -> DubResult<Self> {
        let mut missing = Vec::new();
        let mut read = |name: &str| -> String {
            match std::env::var(name) {
                Ok(value) if !value.trim().is_empty() => value,
                _ => {
                    missing.push(name.to_owned());
                    String::new()
                }
            }
        };

        let creds = Self {
            asr_app_id: read(REQUIRED_VARS[0]),
            asr_token: read(REQUIRED_VARS[1]),
            mt_api_key: read(REQUIRED_VARS[2]),
            tts_app_id: read(REQUIRED_VARS[3]),
            tts_token: read(REQUIRED_VARS[4]),
            store_access_key: read(REQUIRED_VARS[5]),
            store_secret_key: read(REQUIRED_VARS[6]),
        };

        if missing.is_empty() {
            Ok(creds)
        } else {
            Err(DubError::Config(format!(
                "missing environment variables: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Parse a duration override from the environment, falling back on parse
/// failure or absence.
#[must_use]
pub fn duration_from_env(key: &str, fallback: Duration) -> Duration {
    let Ok(raw) = std::env::var(key) else {
        return fallback;
    };
    let Ok(parsed) = raw.parse::<u64>() else {
        return fallback;
    };
    Duration::from_millis(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::config_fingerprint;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.normalize.silence_gap_ms, 450);
        assert_eq!(config.normalize.max_utterance_ms, 8_000);
        assert_eq!(config.align.max_extend_ms, 200);
        assert_eq!(config.align.cue_chars, 42);
        assert!((config.align.max_rate - 1.3).abs() < f64::EPSILON);
        assert_eq!(config.synth.workers, 4);
        assert!((config.mix.target_lufs - -16.0).abs() < f64::EPSILON);
        assert!((config.mix.true_peak_dbtp - -1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn phase_sections_fingerprint_independently() {
        let mut config = AppConfig::default();
        let align_before = config_fingerprint(&config.phase_section("align"));
        let synth_before = config_fingerprint(&config.phase_section("synthesize"));

        config.align.cue_chars = 30;

        assert_ne!(
            align_before,
            config_fingerprint(&config.phase_section("align")),
            "align section must change"
        );
        assert_eq!(
            synth_before,
            config_fingerprint(&config.phase_section("synthesize")),
            "unrelated sections must not change"
        );
    }

    #[test]
    fn knobless_phases_get_empty_sections() {
        let config = AppConfig::default();
        assert_eq!(config.phase_section("demux"), serde_json::json!({}));
        assert_eq!(config.phase_section("burn"), serde_json::json!({}));
    }

    #[test]
    fn missing_credentials_name_every_variable() {
        // Run against a scrubbed environment by pointing at variables that
        // cannot exist.
        for var in REQUIRED_VARS {
            std::env::remove_var(var);
        }
        let err = Credentials::from_env().expect_err("must fail without env");
        let text = err.to_string();
        for var in REQUIRED_VARS {
            assert!(text.contains(var), "error should name {var}: {text}");
        }
    }

    #[test]
    fn duration_from_env_falls_back() {
        std::env::remove_var("REDUB_TEST_TIMEOUT_MS");
        assert_eq!(
            duration_from_env("REDUB_TEST_TIMEOUT_MS", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        std::env::set_var("REDUB_TEST_TIMEOUT_MS", "250");
        assert_eq!(
            duration_from_env("REDUB_TEST_TIMEOUT_MS", Duration::from_secs(3)),
            Duration::from_millis(250)
        );
        std::env::set_var("REDUB_TEST_TIMEOUT_MS", "not-a-number");
        assert_eq!(
            duration_from_env("REDUB_TEST_TIMEOUT_MS", Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        std::env::remove_var("REDUB_TEST_TIMEOUT_MS");
    }
}
