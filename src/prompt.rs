use crate::book::{BookSpec, ChapterOutline, ChapterPlan, SectionKey};
use std::ops::Range;

const JSON_ONLY_SYSTEM: &str = "You are a meticulous story architect. \
    Respond with valid JSON only. Do not wrap it in markdown code fences \
    and do not add any text outside the JSON object.";

const PROSE_SYSTEM: &str = "You are a skilled novelist. \
    Write immersive, coherent prose and output only the story text itself.";

const STYLE_GUIDELINES: &str = "\
WRITING STYLE:
- Show, don't tell: reveal emotion and fact through action, dialogue, sensation and thought.
- Use concrete sensory detail that fits the scene.
- Keep character voices consistent and motivations clear.
- Vary sentence length to control pacing.
- Keep the tone consistent with the genre.
- Write natural dialogue that moves the plot; avoid exposition dumps.
- Expand the outline into living scenes instead of restating its points.";

/// A system/user prompt pair sent in a single request.
pub trait Prompt {
    fn system(&self) -> &'static str;
    fn render(&self) -> String;
}

/// Asks for the outline of `chapters` (zero-based range) as JSON.
pub struct OutlinePrompt<'a> {
    pub spec: &'a BookSpec,
    pub chapters: Range<usize>,
    /// Already planned chapters, for chunked outlining.
    pub previous: &'a [ChapterOutline],
    /// Why the last answer was rejected; set on the restated attempt.
    pub correction: Option<&'a str>,
}

impl<'a> OutlinePrompt<'a> {
    pub fn full(spec: &'a BookSpec) -> Self {
        Self {
            spec,
            chapters: 0..spec.chapters,
            previous: &[],
            correction: None,
        }
    }

    fn is_chunk(&self) -> bool {
        self.chapters.start > 0 || self.chapters.end < self.spec.chapters
    }
}

impl Prompt for OutlinePrompt<'_> {
    fn system(&self) -> &'static str {
        JSON_ONLY_SYSTEM
    }

    fn render(&self) -> String {
        let spec = self.spec;
        let count = self.chapters.len();
        let first = self.chapters.start + 1;
        let last = self.chapters.end;

        let task = if self.is_chunk() {
            format!(
                "Write PART of the outline for the book below: chapters {} to {} inclusive, \
                 exactly {} chapter(s). Do not outline any other chapter.",
                first, last, count
            )
        } else {
            format!(
                "Write the complete outline for the book below: exactly {} chapter(s).",
                count
            )
        };

        let mut out = format!(
            "{}\n\
             Every chapter has exactly {} sub-chapter(s). Each summary is 100-150 words and names \
             the key events, character choices, reveals and the purpose of the section in the \
             larger story. Chapters and sub-chapters must follow on from each other logically \
             and never repeat.\n\n\
             Return only this JSON shape:\n\
             {{ \"chapters\": [ {{ \"title\": \"...\", \"summary\": \"...\", \
             \"sub_chapters\": [ {{ \"title\": \"...\", \"summary\": \"...\" }} ] }} ] }}\n\n",
            task, spec.sub_chapters_per_chapter
        );

        out.push_str(&book_context(spec));

        let notes: Vec<String> = spec
            .chapter_notes
            .iter()
            .enumerate()
            .filter(|(i, note)| self.chapters.contains(i) && !note.trim().is_empty())
            .map(|(i, note)| format!("- Chapter {}: {}", i + 1, note.trim()))
            .collect();
        if !notes.is_empty() {
            out.push_str("\nRequested chapter contents:\n");
            out.push_str(&notes.join("\n"));
            out.push('\n');
        }

        if !self.previous.is_empty() {
            out.push_str("\nThe outline so far ends with these chapters; continue from them:\n");
            let offset = self.chapters.start.saturating_sub(self.previous.len());
            for (i, chapter) in self.previous.iter().enumerate() {
                out.push_str(&format!(
                    "- Chapter {}: {}. {}\n",
                    offset + i + 1,
                    chapter.title,
                    chapter.summary
                ));
            }
        }

        if let Some(correction) = self.correction {
            out.push_str(&format!(
                "\nYour previous answer could not be used: {}. \
                 Follow the JSON shape and the chapter counts exactly.\n",
                correction
            ));
        }
        out
    }
}

/// Asks for the prose of one sub-chapter.
pub struct SectionPrompt<'a> {
    pub spec: &'a BookSpec,
    pub plan: &'a ChapterPlan,
    pub key: SectionKey,
    /// Preceding sub-chapter texts, oldest first.
    pub context: Vec<&'a str>,
    pub context_chars: usize,
    pub target_words: usize,
    /// Word count of a too-short earlier answer; turns this into the length re-request.
    pub shortfall: Option<usize>,
}

impl Prompt for SectionPrompt<'_> {
    fn system(&self) -> &'static str {
        PROSE_SYSTEM
    }

    fn render(&self) -> String {
        let spec = self.spec;
        let key = self.key;
        let min_words = self.target_words * 85 / 100;

        let mut out = format!(
            "Write sub-chapter {} of the book \"{}\".\n\n{}\n\n\
             REQUIREMENTS:\n\
             - About {} words; no fewer than {}.\n\
             - Cover every event in this sub-chapter's outline, and nothing from later sections.\n\
             - Continue smoothly from the previous text.\n\
             - Output only the prose: no headings, no \"Chapter\" labels, no markdown.\n\n",
            key, spec.title, STYLE_GUIDELINES, self.target_words, min_words
        );

        out.push_str(&book_context(spec));

        let earlier: Vec<String> = self
            .plan
            .chapters
            .iter()
            .take(key.chapter)
            .enumerate()
            .map(|(i, c)| format!("- Chapter {} ({}): {}", i + 1, c.title, c.summary))
            .collect();
        if !earlier.is_empty() {
            out.push_str("\nStory so far, by chapter:\n");
            out.push_str(&earlier.join("\n"));
            out.push('\n');
        }

        if let Some(chapter) = self.plan.chapter(key) {
            out.push_str(&format!(
                "\nCurrent chapter {}: {}\n{}\n",
                key.chapter + 1,
                chapter.title,
                chapter.summary
            ));
        }
        if let Some(sub) = self.plan.sub_chapter(key) {
            out.push_str(&format!(
                "\nOutline of sub-chapter {}: {}\n{}\n",
                key, sub.title, sub.summary
            ));
        }

        let tails: Vec<&str> = self
            .context
            .iter()
            .map(|text| tail_chars(text, self.context_chars))
            .filter(|tail| !tail.is_empty())
            .collect();
        if !tails.is_empty() {
            out.push_str("\nPrevious text (most recent last):\n");
            for tail in tails {
                out.push_str(&format!("... {}\n", tail));
            }
        } else if key == SectionKey::new(0, 0) {
            out.push_str("\nPrevious text: none, this is the opening of the book.\n");
        }

        if let Some(words) = self.shortfall {
            out.push_str(&format!(
                "\nIMPORTANT: a previous draft of this sub-chapter was only {} words long. \
                 This version must reach at least {} words. Develop the scenes more fully \
                 with dialogue, description and inner thought.\n",
                words, self.target_words
            ));
        }
        out
    }
}

fn book_context(spec: &BookSpec) -> String {
    let mut out = format!(
        "BOOK:\n- Title: {}\n- Genre: {}\n- Chapters: {}\n- Premise: {}\n",
        spec.title,
        spec.genre_list(),
        spec.chapters,
        spec.premise.trim()
    );
    if let Some(notes) = spec.character_notes.as_deref().filter(|n| !n.trim().is_empty()) {
        out.push_str(&format!("- Characters: {}\n", notes.trim()));
    }
    if let Some(notes) = spec.world_notes.as_deref().filter(|n| !n.trim().is_empty()) {
        out.push_str(&format!("- World and setting: {}\n", notes.trim()));
    }
    out
}

/// Last `max` characters of `text`, cut on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let (idx, _) = text
        .char_indices()
        .nth(count - max)
        .unwrap_or((0, ' '));
    &text[idx..]
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}
