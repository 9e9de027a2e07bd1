use crate::book::{BookSpec, ChapterPlan, GENRES};
use crate::config::Config;
use anyhow::{Context, Result};
use inquire::validator::Validation;
use inquire::{Confirm, CustomType, MultiSelect, Text};
use log::info;
use std::fs;
use std::path::Path;

const OUTLINE_PREVIEW_CHARS: usize = 1500;

/// Reads the book description from `path` (or the configured book file), asking
/// for it interactively when the file is missing.
pub fn load_or_prompt_book(config: &Config, path: Option<&Path>) -> Result<BookSpec> {
    let path = path.unwrap_or_else(|| Path::new(&config.book_file));
    if path.exists() {
        info!("Loading book description from {}", path.display());
        return load_book(path);
    }

    if config.unattended {
        anyhow::bail!(
            "{} not found and unattended mode is on; cannot ask for the book details",
            path.display()
        );
    }

    let spec = prompt_book(config)?;
    if Confirm::new(&format!("Save these details to {}?", path.display()))
        .with_default(true)
        .prompt()?
    {
        save_book(path, &spec)?;
        println!("Book details saved.");
    }
    Ok(spec)
}

pub fn load_book(path: &Path) -> Result<BookSpec> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml_ng::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn save_book(path: &Path, spec: &BookSpec) -> Result<()> {
    let content = serde_yaml_ng::to_string(spec)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn prompt_book(config: &Config) -> Result<BookSpec> {
    let max_chapters = config.generation.max_chapters;
    let max_sub_chapters = config.generation.max_sub_chapters;

    let title = Text::new("Book title:")
        .with_validator(inquire::required!("The title can't be empty"))
        .prompt()?;

    let genres: Vec<String> = MultiSelect::new("Genres:", GENRES.to_vec())
        .prompt()?
        .into_iter()
        .map(str::to_string)
        .collect();

    let premise = Text::new("Premise:")
        .with_help_message("Overall plot, main characters, setting and tone")
        .with_validator(inquire::required!("The premise can't be empty"))
        .prompt()?;

    let character_notes = optional_text(
        "Add character notes?",
        "Character notes:",
        "Names, roles, personalities, goals, appearance",
    )?;
    let world_notes = optional_text(
        "Add world-building notes?",
        "World notes:",
        "Locations, rules, history, technology or magic",
    )?;

    let chapters = CustomType::<usize>::new("Number of chapters:")
        .with_default(10)
        .with_error_message("Please enter a whole number")
        .with_validator(move |n: &usize| {
            if (1..=max_chapters).contains(n) {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid(
                    format!("Choose between 1 and {} chapters", max_chapters).into(),
                ))
            }
        })
        .prompt()?;

    let mut chapter_notes = Vec::with_capacity(chapters);
    if Confirm::new("Describe what happens in each chapter?")
        .with_default(false)
        .prompt()?
    {
        for i in 1..=chapters {
            chapter_notes.push(Text::new(&format!("Chapter {}:", i)).prompt()?);
        }
    }

    let words_per_chapter = CustomType::<usize>::new("Target words per chapter:")
        .with_default(2000)
        .with_error_message("Please enter a whole number")
        .with_validator(|n: &usize| {
            if (100..=15000).contains(n) {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid("Choose between 100 and 15000 words".into()))
            }
        })
        .prompt()?;

    let sub_chapters_per_chapter = CustomType::<usize>::new("Sub-chapters per chapter:")
        .with_default(BookSpec::suggested_sub_chapters(words_per_chapter).min(max_sub_chapters))
        .with_help_message("Each sub-chapter is written by a single request")
        .with_validator(move |n: &usize| {
            if (1..=max_sub_chapters).contains(n) {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid(
                    format!("Choose between 1 and {}", max_sub_chapters).into(),
                ))
            }
        })
        .prompt()?;

    let spec = BookSpec {
        title: title.trim().to_string(),
        genres,
        premise: premise.trim().to_string(),
        target_total_words: words_per_chapter * chapters,
        chapters,
        sub_chapters_per_chapter,
        chapter_notes,
        character_notes,
        world_notes,
    };

    println!("\n--- Book settings ---");
    println!(" - Title: {}", spec.title);
    println!(" - Genre: {}", spec.genre_list());
    println!(" - Chapters: {}", spec.chapters);
    println!(
        " - Sub-chapters per chapter: {} (~{} words each)",
        spec.sub_chapters_per_chapter,
        words_per_chapter.div_ceil(spec.sub_chapters_per_chapter)
    );
    println!(" - Total target words: {}", spec.target_total_words);
    println!(" - Requests for prose: {}", spec.total_sub_chapters());

    if !Confirm::new("Proceed with these settings?")
        .with_default(true)
        .prompt()?
    {
        anyhow::bail!("Cancelled by user");
    }
    Ok(spec)
}

fn optional_text(question: &str, prompt: &str, help: &str) -> Result<Option<String>> {
    if !Confirm::new(question).with_default(false).prompt()? {
        return Ok(None);
    }
    let text = Text::new(prompt).with_help_message(help).prompt()?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

/// Shows the start of the outline; returns true when the user keeps it.
pub fn review_outline(plan: &ChapterPlan) -> Result<bool> {
    let rendered = plan.render();
    let preview: String = rendered.chars().take(OUTLINE_PREVIEW_CHARS).collect();
    println!("\n--- Outline preview ---\n{}", preview);
    if preview.len() < rendered.len() {
        println!("...");
    }
    println!("--- End of preview ---\n");

    let regenerate = Confirm::new("Regenerate the outline?")
        .with_default(false)
        .prompt()?;
    Ok(!regenerate)
}

pub fn confirm_overwrite(path: &Path) -> Result<bool> {
    Ok(Confirm::new(&format!("{} already exists. Overwrite it?", path.display()))
        .with_default(false)
        .prompt()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::tests::sample_spec;

    fn unattended_config() -> Config {
        serde_yaml_ng::from_str("unattended: true\nllm:\n  provider: gemini\n").unwrap()
    }

    #[test]
    fn test_book_file_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("book.yml");
        let mut spec = sample_spec(3, 2, 6000);
        spec.world_notes = Some("Tides obey the moon's debts.".into());

        save_book(&path, &spec)?;
        let config = unattended_config();
        let loaded = load_or_prompt_book(&config, Some(&path))?;
        assert_eq!(loaded, spec);
        Ok(())
    }

    #[test]
    fn test_minimal_book_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("book.yml");
        fs::write(
            &path,
            "title: Salt\npremise: A lighthouse keeper finds a door in the sea.\n\
             target_total_words: 6000\nchapters: 3\nsub_chapters_per_chapter: 2\n",
        )?;
        let spec = load_book(&path)?;
        assert!(spec.genres.is_empty());
        assert!(spec.chapter_notes.is_empty());
        assert_eq!(spec.total_sub_chapters(), 6);
        Ok(())
    }

    #[test]
    fn test_missing_book_file_unattended_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = unattended_config();
        let err = load_or_prompt_book(&config, Some(&dir.path().join("none.yml"))).unwrap_err();
        assert!(err.to_string().contains("unattended"));
    }
}
