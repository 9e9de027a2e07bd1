use crate::book::{BookSpec, ChapterOutline, ChapterPlan};
use crate::config::GenerationConfig;
use crate::error::BookError;
use crate::llm::LlmClient;
use crate::prompt::{strip_code_blocks, OutlinePrompt, Prompt};
use crate::retry::{RetryOutcome, RetryPolicy};
use anyhow::Result;
use log::{info, warn};
use serde::Deserialize;
use std::ops::Range;
use std::time::Duration;

/// Turns a BookSpec into a ChapterPlan with exactly the requested shape.
pub struct OutlinePlanner<'a> {
    llm: &'a dyn LlmClient,
    retry: RetryPolicy,
    config: &'a GenerationConfig,
    request_delay: Duration,
}

impl<'a> OutlinePlanner<'a> {
    pub fn new(llm: &'a dyn LlmClient, retry: RetryPolicy, config: &'a GenerationConfig) -> Self {
        Self {
            llm,
            retry,
            config,
            request_delay: Duration::from_secs(config.request_delay_seconds),
        }
    }

    pub async fn plan(&self, spec: &BookSpec) -> Result<ChapterPlan> {
        let ranges = chunk_ranges(spec, self.config);
        if ranges.len() > 1 {
            info!(
                "Outline has {} sub-chapters, planning in {} chunks",
                spec.total_sub_chapters(),
                ranges.len()
            );
        }

        let mut chapters: Vec<ChapterOutline> = Vec::with_capacity(spec.chapters);
        for (i, range) in ranges.into_iter().enumerate() {
            if i > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
            let context_start = chapters
                .len()
                .saturating_sub(self.config.chapters_per_outline_chunk);
            let part = self
                .plan_range(spec, range, &chapters[context_start..])
                .await?;
            chapters.extend(part);
        }

        info!("Outline ready: {} chapters", chapters.len());
        Ok(ChapterPlan { chapters })
    }

    /// One chunk: a first prompt, then at most one restated prompt if the answer is unusable.
    async fn plan_range(
        &self,
        spec: &BookSpec,
        range: Range<usize>,
        previous: &[ChapterOutline],
    ) -> Result<Vec<ChapterOutline>> {
        let label = format!("outline chapters {}-{}", range.start + 1, range.end);
        let first = OutlinePrompt {
            spec,
            chapters: range.clone(),
            previous,
            correction: None,
        };
        let problem = match self.parse_reply(&label, &first, spec).await? {
            Ok(chapters) => return Ok(chapters),
            Err(problem) => problem,
        };

        warn!("{}: unusable outline ({}), restating the prompt", label, problem);
        let restated = OutlinePrompt {
            correction: Some(&problem),
            ..first
        };
        match self.parse_reply(&label, &restated, spec).await? {
            Ok(chapters) => Ok(chapters),
            Err(problem) => Err(BookError::Planning(format!("{}: {}", label, problem)).into()),
        }
    }

    /// Outer error: the API gave up. Inner error: the reply did not describe a valid outline.
    async fn parse_reply(
        &self,
        label: &str,
        prompt: &OutlinePrompt<'_>,
        spec: &BookSpec,
    ) -> Result<Result<Vec<ChapterOutline>, String>> {
        let llm = self.llm;
        let system = prompt.system();
        let user = prompt.render();
        let user = user.as_str();

        match self.retry.run(label, move |_| llm.chat(system, user)).await {
            RetryOutcome::Done { value, .. } => Ok(parse_outline(
                &value,
                prompt.chapters.len(),
                spec.sub_chapters_per_chapter,
            )),
            RetryOutcome::Failed { attempts, error } => Err(BookError::Planning(format!(
                "{}: request failed after {} attempt(s): {:#}",
                label, attempts, error
            ))
            .into()),
        }
    }
}

fn chunk_ranges(spec: &BookSpec, config: &GenerationConfig) -> Vec<Range<usize>> {
    if spec.total_sub_chapters() <= config.outline_chunk_threshold {
        return vec![0..spec.chapters];
    }
    let step = config.chapters_per_outline_chunk.max(1);
    (0..spec.chapters)
        .step_by(step)
        .map(|start| start..(start + step).min(spec.chapters))
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OutlineReply {
    Wrapped { chapters: Vec<ChapterOutline> },
    Bare(Vec<ChapterOutline>),
}

/// Checks the reply against the requested shape. Surplus entries are dropped,
/// anything missing or blank is an error.
pub fn parse_outline(
    response: &str,
    expected_chapters: usize,
    expected_sub_chapters: usize,
) -> Result<Vec<ChapterOutline>, String> {
    let json = strip_code_blocks(response);
    if json.is_empty() {
        return Err("the response was empty".to_string());
    }

    let mut chapters = match serde_json::from_str::<OutlineReply>(&json) {
        Ok(OutlineReply::Wrapped { chapters }) | Ok(OutlineReply::Bare(chapters)) => chapters,
        Err(e) => return Err(format!("the response was not valid outline JSON ({})", e)),
    };

    if chapters.len() < expected_chapters {
        return Err(format!(
            "expected {} chapters, got {}",
            expected_chapters,
            chapters.len()
        ));
    }
    if chapters.len() > expected_chapters {
        warn!(
            "Outline returned {} chapters, keeping the first {}",
            chapters.len(),
            expected_chapters
        );
        chapters.truncate(expected_chapters);
    }

    for (i, chapter) in chapters.iter_mut().enumerate() {
        if chapter.title.trim().is_empty() || chapter.summary.trim().is_empty() {
            return Err(format!("chapter {} has no title or summary", i + 1));
        }
        if chapter.sub_chapters.len() < expected_sub_chapters {
            return Err(format!(
                "chapter {} has {} sub-chapters, expected {}",
                i + 1,
                chapter.sub_chapters.len(),
                expected_sub_chapters
            ));
        }
        if chapter.sub_chapters.len() > expected_sub_chapters {
            warn!(
                "Chapter {} returned {} sub-chapters, keeping the first {}",
                i + 1,
                chapter.sub_chapters.len(),
                expected_sub_chapters
            );
            chapter.sub_chapters.truncate(expected_sub_chapters);
        }
        if let Some(j) = chapter
            .sub_chapters
            .iter()
            .position(|s| s.title.trim().is_empty() || s.summary.trim().is_empty())
        {
            return Err(format!("sub-chapter {}.{} has no title or summary", i + 1, j + 1));
        }
    }
    Ok(chapters)
}
