//! Utterance normalization: rebuild utterance boundaries from the word
//! stream instead of trusting the provider's own segmentation.
//!
//! Boundary rules, applied while walking words in time order:
//! 1. inter-word silence at or above `silence_gap_ms` opens a new
//!    candidate;
//! 2. a speaker change is a hard boundary and overrides everything else;
//! 3. a candidate never spans more than `max_utterance_ms`; the split
//!    lands on the last word boundary inside the limit.
//!
//! The provider's word stream carries no punctuation, but its
//! utterance-level text strings do. After grouping, each candidate is
//! matched (by best time overlap) against a provider utterance and
//! trailing punctuation is reattached to the words it follows.

use std::collections::BTreeMap;

use crate::config::NormalizeSettings;
use crate::model::{Gender, NormalizedUtterance, ProviderUtterance, Word};

/// Punctuation recognized when matching words against provider text.
/// Covers ASCII plus the CJK marks the recognition provider emits.
const PUNCTUATION: &str = "，。！？、；：…—·“”‘’（）《》【】";

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation() || PUNCTUATION.contains(c)
}

/// Rebuild normalized utterances from the flat word stream.
///
/// `genders` maps speakers to the gender the recognition response
/// reported; speakers absent from the map come out as `unknown`.
#[must_use]
pub fn normalize_utterances(
    words: &[Word],
    provider_utterances: &[ProviderUtterance],
    genders: &BTreeMap<String, Gender>,
    settings: &NormalizeSettings,
) -> Vec<NormalizedUtterance> {
    let mut sorted: Vec<Word> = words.to_vec();
    sorted.sort_by_key(|w| (w.start_ms, w.end_ms));

    let candidates = group_words(&sorted, settings);

    let mut utterances = Vec::new();
    for chunk in candidates {
        if chunk.is_empty() {
            continue;
        }
        let mut chunk = chunk;
        let matched = best_overlap(&chunk, provider_utterances);
        if let Some(provider) = matched {
            reattach_punctuation(&mut chunk, &provider.text);
        }

        let speaker_id = chunk[0].speaker_id.clone();
        let gender = genders.get(&speaker_id).copied().unwrap_or(Gender::Unknown);
        let emotion = matched.and_then(|p| p.emotion.clone());
        let start_ms = chunk[0].start_ms;
        let end_ms = chunk.last().map(|w| w.end_ms).unwrap_or(start_ms);
        let text: String = chunk.iter().map(|w| w.text.as_str()).collect();

        utterances.push(NormalizedUtterance {
            utt_id: String::new(),
            speaker_id,
            gender,
            emotion,
            start_ms,
            end_ms,
            words: chunk,
            text,
        });
    }

    // Identifiers are positional and only meaningful within one run.
    for (idx, utt) in utterances.iter_mut().enumerate() {
        utt.utt_id = format!("utt_{:04}", idx + 1);
    }
    utterances
}

fn group_words(words: &[Word], settings: &NormalizeSettings) -> Vec<Vec<Word>> {
    let mut chunks: Vec<Vec<Word>> = Vec::new();
    let mut current: Vec<Word> = Vec::new();

    for word in words {
        if let Some(prev) = current.last() {
            let gap = word.start_ms.saturating_sub(prev.end_ms);
            let speaker_changed = word.speaker_id != prev.speaker_id;
            let span_after = word.end_ms.saturating_sub(current[0].start_ms);
            if speaker_changed
                || gap >= settings.silence_gap_ms
                || span_after > settings.max_utterance_ms
            {
                chunks.push(std::mem::take(&mut current));
            }
        }
        current.push(word.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// The provider utterance whose time range overlaps the candidate most.
fn best_overlap<'a>(
    chunk: &[Word],
    provider_utterances: &'a [ProviderUtterance],
) -> Option<&'a ProviderUtterance> {
    let start = chunk.first()?.start_ms;
    let end = chunk.last()?.end_ms;

    provider_utterances
        .iter()
        .filter_map(|p| {
            let overlap = p.end_ms.min(end).saturating_sub(p.start_ms.max(start));
            if overlap == 0 { None } else { Some((overlap, p)) }
        })
        .max_by_key(|(overlap, _)| *overlap)
        .map(|(_, p)| p)
}

/// Plain text (punctuation and whitespace removed) plus a map from plain
/// index back to the original character index.
fn plain_with_map(s: &str) -> (Vec<char>, Vec<usize>) {
    let mut plain = Vec::new();
    let mut map = Vec::new();
    for (idx, c) in s.chars().enumerate() {
        if is_punctuation(c) || c.is_whitespace() {
            continue;
        }
        plain.push(c);
        map.push(idx);
    }
    (plain, map)
}

/// Locate the candidate's words inside the provider text (ignoring
/// punctuation and whitespace) and append any punctuation found
/// immediately after each word back onto that word. No match leaves the
/// words untouched.
fn reattach_punctuation(chunk: &mut [Word], provider_text: &str) {
    let full_chars: Vec<char> = provider_text.chars().collect();
    let (plain_full, plain_to_orig) = plain_with_map(provider_text);

    let words_plain: Vec<Vec<char>> = chunk
        .iter()
        .map(|w| {
            w.text
                .chars()
                .filter(|c| !is_punctuation(*c) && !c.is_whitespace())
                .collect()
        })
        .collect();
    let flat: Vec<char> = words_plain.iter().flatten().copied().collect();
    if flat.is_empty() {
        return;
    }

    let Some(pos) = find_subsequence(&plain_full, &flat) else {
        return;
    };

    let mut cursor = pos;
    for (word, plain) in chunk.iter_mut().zip(&words_plain) {
        if plain.is_empty() {
            continue;
        }
        let last_plain_idx = cursor + plain.len() - 1;
        cursor += plain.len();
        let Some(orig_idx) = plain_to_orig.get(last_plain_idx) else {
            return;
        };

        let mut trailing = String::new();
        let mut scan = orig_idx + 1;
        while scan < full_chars.len() && is_punctuation(full_chars[scan]) {
            trailing.push(full_chars[scan]);
            scan += 1;
        }
        if !trailing.is_empty() {
            word.text.push_str(&trailing);
        }
    }
}

fn find_subsequence(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}
