use crate::audio::features::SectionType;

pub fn embedded_patterns() -> &'static [(SectionType, &'static str)] {
    &[
        (SectionType::Intro, include_str!("../../patterns/intro.json")),
        (SectionType::Verse, include_str!("../../patterns/verse.json")),
        (SectionType::Chorus, include_str!("../../patterns/chorus.json")),
        (SectionType::Drop, include_str!("../../patterns/drop.json")),
        (SectionType::Bridge, include_str!("../../patterns/bridge.json")),
        (SectionType::Interlude, include_str!("../../patterns/interlude.json")),
        (SectionType::Outro, include_str!("../../patterns/outro.json")),
    ]
}
