use crate::book::{ChapterPlan, SectionKey};
use crate::config::OutputConfig;
use crate::error::BookError;
use crate::state::{GenerationState, SectionStatus};

/// Joins a settled GenerationState into the final book text. Failed sections are
/// replaced by the configured placeholder so the gap stays visible.
pub fn assemble(
    plan: &ChapterPlan,
    state: &GenerationState,
    options: &OutputConfig,
) -> Result<String, BookError> {
    if !state.matches_plan(plan) {
        return Err(BookError::InvalidSpec(
            "generation state does not belong to this outline".to_string(),
        ));
    }
    let pending = state.unsettled();
    if pending > 0 {
        return Err(BookError::Incomplete { pending });
    }

    let spec = &state.spec;
    let mut blocks: Vec<String> = Vec::new();

    if options.include_header {
        let mut header = format!(
            "{}\nGenre: {}\nChapters: {}",
            spec.title,
            spec.genre_list(),
            plan.chapters.len()
        );
        for (label, notes) in [
            ("CHARACTER NOTES", &spec.character_notes),
            ("WORLD NOTES", &spec.world_notes),
        ] {
            if let Some(notes) = notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                header.push_str(&format!("\n\n----- {} -----\n\n{}", label, notes));
            }
        }
        blocks.push(header);
    }
    if options.include_outline {
        blocks.push(format!("----- OUTLINE -----\n\n{}", plan.render()));
    }

    for (i, chapter) in plan.chapters.iter().enumerate() {
        let sections: Vec<String> = (0..chapter.sub_chapters.len())
            .map(|j| {
                let key = SectionKey::new(i, j);
                match state.status(key) {
                    Some(SectionStatus::Done { text, .. }) => text.trim().to_string(),
                    _ => placeholder(&options.failed_placeholder, key),
                }
            })
            .collect();

        blocks.push(format!(
            "Chapter {}: {}\n\n{}",
            i + 1,
            chapter.title,
            sections.join(&options.sub_chapter_separator)
        ));
    }

    let mut manuscript = blocks.join(&options.chapter_separator);
    manuscript.push('\n');
    Ok(manuscript)
}

fn placeholder(template: &str, key: SectionKey) -> String {
    template
        .replace("{chapter}", &(key.chapter + 1).to_string())
        .replace("{sub_chapter}", &(key.sub_chapter + 1).to_string())
}
