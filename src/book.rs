use crate::config::GenerationConfig;
use crate::error::BookError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GENRES: &[&str] = &[
    "Fantasy",
    "Action/Adventure",
    "Literary Fiction",
    "Non-Fiction",
    "Dystopian",
    "Mystery",
    "Horror",
    "Thriller/Suspense",
    "Romance",
    "Childrens",
    "Memoir",
    "Sci-Fi",
    "Historical Fiction",
];

const SUB_CHAPTER_THRESHOLD: usize = 1500;
const WORDS_PER_SUB_CHAPTER_HINT: usize = 500;

/// What the user asked for. Frozen once generation starts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BookSpec {
    pub title: String,
    #[serde(default)]
    pub genres: Vec<String>,
    pub premise: String,
    pub target_total_words: usize,
    pub chapters: usize,
    pub sub_chapters_per_chapter: usize,
    /// One entry per chapter, may be shorter than `chapters`.
    #[serde(default)]
    pub chapter_notes: Vec<String>,
    #[serde(default)]
    pub character_notes: Option<String>,
    #[serde(default)]
    pub world_notes: Option<String>,
}

impl BookSpec {
    pub fn total_sub_chapters(&self) -> usize {
        self.chapters * self.sub_chapters_per_chapter
    }

    pub fn genre_list(&self) -> String {
        if self.genres.is_empty() {
            "General Fiction".to_string()
        } else {
            self.genres.join(", ")
        }
    }

    /// Short chapters are written in one piece, long ones split into ~500 word parts.
    pub fn suggested_sub_chapters(words_per_chapter: usize) -> usize {
        if words_per_chapter <= SUB_CHAPTER_THRESHOLD {
            1
        } else {
            words_per_chapter
                .div_ceil(WORDS_PER_SUB_CHAPTER_HINT)
                .max(3)
        }
    }

    /// File-system friendly name used for the build folder and the manuscript.
    pub fn slug(&self) -> String {
        let cleaned: String = self
            .title
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '_')
            .collect();
        let slug = cleaned.trim().replace(' ', "_");
        if slug.is_empty() {
            "untitled".to_string()
        } else {
            slug
        }
    }

    pub fn validate(&self, cfg: &GenerationConfig) -> Result<(), BookError> {
        if self.title.trim().is_empty() {
            return Err(BookError::InvalidSpec("title must not be empty".into()));
        }
        if self.premise.trim().is_empty() {
            return Err(BookError::InvalidSpec("premise must not be empty".into()));
        }
        if self.chapters == 0 || self.chapters > cfg.max_chapters {
            return Err(BookError::InvalidSpec(format!(
                "chapter count {} outside 1..={}",
                self.chapters, cfg.max_chapters
            )));
        }
        if self.sub_chapters_per_chapter == 0
            || self.sub_chapters_per_chapter > cfg.max_sub_chapters
        {
            return Err(BookError::InvalidSpec(format!(
                "sub-chapters per chapter {} outside 1..={}",
                self.sub_chapters_per_chapter, cfg.max_sub_chapters
            )));
        }
        if self.target_total_words < self.total_sub_chapters() {
            return Err(BookError::InvalidSpec(format!(
                "target of {} words is too small for {} sub-chapters",
                self.target_total_words,
                self.total_sub_chapters()
            )));
        }
        Ok(())
    }
}

/// Position of a sub-chapter in the book, zero-based. Ordering is narrative order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionKey {
    pub chapter: usize,
    pub sub_chapter: usize,
}

impl SectionKey {
    pub fn new(chapter: usize, sub_chapter: usize) -> Self {
        Self {
            chapter,
            sub_chapter,
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.chapter + 1, self.sub_chapter + 1)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubChapterOutline {
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChapterOutline {
    pub title: String,
    pub summary: String,
    pub sub_chapters: Vec<SubChapterOutline>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ChapterPlan {
    pub chapters: Vec<ChapterOutline>,
}

impl ChapterPlan {
    /// Every sub-chapter position, in narrative order.
    pub fn keys(&self) -> Vec<SectionKey> {
        self.chapters
            .iter()
            .enumerate()
            .flat_map(|(i, chapter)| {
                (0..chapter.sub_chapters.len()).map(move |j| SectionKey::new(i, j))
            })
            .collect()
    }

    pub fn chapter(&self, key: SectionKey) -> Option<&ChapterOutline> {
        self.chapters.get(key.chapter)
    }

    pub fn sub_chapter(&self, key: SectionKey) -> Option<&SubChapterOutline> {
        self.chapter(key)
            .and_then(|c| c.sub_chapters.get(key.sub_chapter))
    }

    pub fn total_sub_chapters(&self) -> usize {
        self.chapters.iter().map(|c| c.sub_chapters.len()).sum()
    }

    /// Plain-text rendering used in manuscript headers and previews.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, chapter) in self.chapters.iter().enumerate() {
            out.push_str(&format!("Chapter {}: {}\n{}\n", i + 1, chapter.title, chapter.summary));
            for (j, sub) in chapter.sub_chapters.iter().enumerate() {
                out.push_str(&format!("  - Sub-Chapter {}: {}\n    {}\n", j + 1, sub.title, sub.summary));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_spec(chapters: usize, subs: usize, words: usize) -> BookSpec {
        BookSpec {
            title: "Test".to_string(),
            genres: vec!["Fantasy".to_string()],
            premise: "A cartographer maps a city that rearranges itself every night.".to_string(),
            target_total_words: words,
            chapters,
            sub_chapters_per_chapter: subs,
            chapter_notes: vec![],
            character_notes: None,
            world_notes: None,
        }
    }

    pub(crate) fn sample_plan(chapters: usize, subs: usize) -> ChapterPlan {
        ChapterPlan {
            chapters: (0..chapters)
                .map(|i| ChapterOutline {
                    title: format!("Chapter title {}", i + 1),
                    summary: format!("Chapter summary {}", i + 1),
                    sub_chapters: (0..subs)
                        .map(|j| SubChapterOutline {
                            title: format!("Part {}.{}", i + 1, j + 1),
                            summary: format!("Events of {}.{}", i + 1, j + 1),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_keys_in_narrative_order() {
        let plan = sample_plan(2, 2);
        assert_eq!(
            plan.keys(),
            vec![
                SectionKey::new(0, 0),
                SectionKey::new(0, 1),
                SectionKey::new(1, 0),
                SectionKey::new(1, 1),
            ]
        );
        let mut sorted = plan.keys();
        sorted.sort();
        assert_eq!(sorted, plan.keys());
    }

    #[test]
    fn test_suggested_sub_chapters() {
        assert_eq!(BookSpec::suggested_sub_chapters(800), 1);
        assert_eq!(BookSpec::suggested_sub_chapters(1500), 1);
        assert_eq!(BookSpec::suggested_sub_chapters(1600), 4);
        assert_eq!(BookSpec::suggested_sub_chapters(1200 * 2), 5);
    }

    #[test]
    fn test_slug() {
        let mut spec = sample_spec(1, 1, 100);
        spec.title = "The Sea: A Tale!".to_string();
        assert_eq!(spec.slug(), "The_Sea_A_Tale");
        spec.title = "???".to_string();
        assert_eq!(spec.slug(), "untitled");
    }

    #[test]
    fn test_validate_bounds() {
        let cfg = GenerationConfig::default();
        assert!(sample_spec(2, 2, 4000).validate(&cfg).is_ok());
        assert!(sample_spec(0, 2, 4000).validate(&cfg).is_err());
        assert!(sample_spec(2, 0, 4000).validate(&cfg).is_err());
        assert!(sample_spec(cfg.max_chapters + 1, 1, 1_000_000).validate(&cfg).is_err());
        assert!(sample_spec(2, 2, 3).validate(&cfg).is_err());
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count("  one two\nthree\tfour "), 4);
        assert_eq!(word_count(""), 0);
    }
}
