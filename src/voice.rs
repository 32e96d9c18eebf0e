//! Voice resolution: speaker → role → voice id, with gender fallback.
//!
//! Two-level lookup against the show-level registries: the episode's
//! speaker→role table, then role→voice casting. Any miss falls back to the
//! role configured for the speaker's gender (`unknown` maps to a neutral
//! voice). The snapshot records which branch was taken so later runs can
//! audit the decision.

use std::collections::BTreeMap;

use crate::model::{Gender, RoleCast, SpeakerToRole, VoiceAssignment, VoiceChoice, VoiceSource};

/// Last-resort voices when the registries resolve nothing.
const FALLBACK_VOICES: &[(Gender, &str)] = &[
    (Gender::Male, "en_male_plain"),
    (Gender::Female, "en_female_plain"),
    (Gender::Unknown, "en_neutral_plain"),
];

fn builtin_voice(gender: Gender) -> &'static str {
    FALLBACK_VOICES
        .iter()
        .find(|(g, _)| *g == gender)
        .map(|(_, v)| *v)
        .unwrap_or("en_neutral_plain")
}

/// Resolve every speaker of the episode to a voice.
#[must_use]
pub fn resolve_voices(
    registry: &SpeakerToRole,
    cast: &RoleCast,
    episode_id: &str,
    speakers: &BTreeMap<String, Gender>,
) -> VoiceAssignment {
    let episode_roles = registry.episodes.get(episode_id);
    let mut assignment = VoiceAssignment::default();

    for (speaker_id, gender) in speakers {
        // Level 1+2: explicit speaker → role → voice.
        let mapped = episode_roles
            .and_then(|roles| roles.get(speaker_id))
            .filter(|role| !role.is_empty())
            .and_then(|role| {
                cast.roles
                    .get(role)
                    .filter(|voice| !voice.is_empty())
                    .map(|voice| (role.clone(), voice.clone()))
            });
        if let Some((role_id, voice_id)) = mapped {
            assignment.speakers.insert(
                speaker_id.clone(),
                VoiceChoice {
                    role_id,
                    voice_id,
                    source: VoiceSource::Mapped,
                },
            );
            continue;
        }

        // Gender fallback: default_roles[gender] → voice.
        let fallback = registry
            .default_roles
            .get(gender.as_str())
            .filter(|role| !role.is_empty())
            .and_then(|role| {
                cast.roles
                    .get(role)
                    .filter(|voice| !voice.is_empty())
                    .map(|voice| (role.clone(), voice.clone()))
            });
        if let Some((role_id, voice_id)) = fallback {
            assignment.speakers.insert(
                speaker_id.clone(),
                VoiceChoice {
                    role_id,
                    voice_id,
                    source: VoiceSource::GenderFallback,
                },
            );
            continue;
        }

        assignment.speakers.insert(
            speaker_id.clone(),
            VoiceChoice {
                role_id: String::new(),
                voice_id: builtin_voice(*gender).to_owned(),
                source: VoiceSource::Default,
            },
        );
    }

    assignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SpeakerToRole {
        let mut registry = SpeakerToRole::default();
        registry.episodes.insert(
            "ep01".to_owned(),
            BTreeMap::from([
                ("spk_1".to_owned(), "Ping_An".to_owned()),
                ("spk_2".to_owned(), String::new()),
            ]),
        );
        registry
            .default_roles
            .insert("male".to_owned(), "Generic_Man".to_owned());
        registry
            .default_roles
            .insert("unknown".to_owned(), "Narrator".to_owned());
        registry
    }

    fn cast() -> RoleCast {
        RoleCast {
            roles: BTreeMap::from([
                ("Ping_An".to_owned(), "en_male_adam".to_owned()),
                ("Generic_Man".to_owned(), "en_male_basic".to_owned()),
                ("Narrator".to_owned(), "en_neutral_soft".to_owned()),
            ]),
        }
    }

    #[test]
    fn assigned_speaker_resolves_through_both_levels() {
        let speakers = BTreeMap::from([("spk_1".to_owned(), Gender::Male)]);
        let assignment = resolve_voices(&registry(), &cast(), "ep01", &speakers);
        let choice = &assignment.speakers["spk_1"];
        assert_eq!(choice.voice_id, "en_male_adam");
        assert_eq!(choice.role_id, "Ping_An");
        assert_eq!(choice.source, VoiceSource::Mapped);
    }

    #[test]
    fn unassigned_speaker_falls_back_by_gender() {
        let speakers = BTreeMap::from([("spk_2".to_owned(), Gender::Male)]);
        let assignment = resolve_voices(&registry(), &cast(), "ep01", &speakers);
        let choice = &assignment.speakers["spk_2"];
        assert_eq!(choice.voice_id, "en_male_basic");
        assert_eq!(choice.role_id, "Generic_Man");
        assert_eq!(choice.source, VoiceSource::GenderFallback);
    }

    #[test]
    fn unknown_gender_uses_the_neutral_role() {
        let speakers = BTreeMap::from([("spk_9".to_owned(), Gender::Unknown)]);
        let assignment = resolve_voices(&registry(), &cast(), "ep01", &speakers);
        let choice = &assignment.speakers["spk_9"];
        assert_eq!(choice.voice_id, "en_neutral_soft");
        assert_eq!(choice.source, VoiceSource::GenderFallback);
    }

    #[test]
    fn role_without_casting_falls_through_to_gender() {
        let mut reg = registry();
        reg.episodes
            .get_mut("ep01")
            .unwrap()
            .insert("spk_3".to_owned(), "Uncast_Role".to_owned());
        let speakers = BTreeMap::from([("spk_3".to_owned(), Gender::Male)]);
        let assignment = resolve_voices(&reg, &cast(), "ep01", &speakers);
        assert_eq!(
            assignment.speakers["spk_3"].source,
            VoiceSource::GenderFallback
        );
    }

    #[test]
    fn empty_registries_yield_builtin_defaults() {
        let speakers = BTreeMap::from([
            ("spk_1".to_owned(), Gender::Female),
            ("spk_2".to_owned(), Gender::Unknown),
        ]);
        let assignment = resolve_voices(
            &SpeakerToRole::default(),
            &RoleCast::default(),
            "ep01",
            &speakers,
        );
        assert_eq!(assignment.speakers["spk_1"].voice_id, "en_female_plain");
        assert_eq!(assignment.speakers["spk_1"].source, VoiceSource::Default);
        assert_eq!(assignment.speakers["spk_2"].voice_id, "en_neutral_plain");
    }

    #[test]
    fn unknown_episode_behaves_like_unassigned() {
        let speakers = BTreeMap::from([("spk_1".to_owned(), Gender::Male)]);
        let assignment = resolve_voices(&registry(), &cast(), "ep99", &speakers);
        assert_eq!(
            assignment.speakers["spk_1"].source,
            VoiceSource::GenderFallback
        );
    }

    #[test]
    fn snapshot_serializes_with_branch_labels() {
        let speakers = BTreeMap::from([("spk_1".to_owned(), Gender::Male)]);
        let assignment = resolve_voices(&registry(), &cast(), "ep01", &speakers);
        let json = serde_json::to_string(&assignment).unwrap();
        assert!(json.contains("\"mapped\""));
    }
}
