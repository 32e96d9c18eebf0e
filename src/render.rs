//! Deterministic textual outputs: SRT subtitles from cue lists.

use crate::model::SubtitleModel;

/// `HH:MM:SS,mmm`, the SRT timecode format.
#[must_use]
pub fn format_timecode(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02},{millis:03}")
}

/// Render a subtitle document's cues as an SRT file. Cues are emitted in
/// start order; empty cue texts are dropped. Output ends with a trailing
/// newline and is byte-stable for identical input.
#[must_use]
pub fn render_srt(model: &SubtitleModel) -> String {
    let mut cues: Vec<(u64, u64, &str)> = model
        .utterances
        .iter()
        .flat_map(|utt| {
            utt.cues
                .iter()
                .map(|cue| (cue.start_ms, cue.end_ms, cue.source.text.as_str()))
        })
        .filter(|(_, _, text)| !text.trim().is_empty())
        .collect();
    cues.sort_by_key(|(start, end, _)| (*start, *end));

    let mut out = String::new();
    for (number, (start, end, text)) in cues.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            number + 1,
            format_timecode(*start),
            format_timecode(*end),
            text.trim()
        ));
    }
    out
}
