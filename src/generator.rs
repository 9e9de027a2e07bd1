use crate::book::{word_count, BookSpec, ChapterPlan, SectionKey};
use crate::config::{FailurePolicy, GenerationConfig};
use crate::error::{BookError, LengthShortfallWarning};
use crate::llm::LlmClient;
use crate::prompt::{Prompt, SectionPrompt};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::state::{GenerationState, SectionStatus};
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::time::Duration;

/// What happened during one pass of the loop.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub generated: usize,
    pub failed: Vec<SectionKey>,
    pub regenerated: usize,
    pub shortfalls: Vec<LengthShortfallWarning>,
}

enum SectionResult {
    Done {
        text: String,
        attempts: u32,
        regenerated: bool,
    },
    Failed {
        attempts: u32,
        error: anyhow::Error,
    },
}

/// Writes sub-chapters one at a time in narrative order.
pub struct ChapterGenerator<'a> {
    llm: &'a dyn LlmClient,
    retry: RetryPolicy,
    config: &'a GenerationConfig,
    request_delay: Duration,
}

impl<'a> ChapterGenerator<'a> {
    pub fn new(llm: &'a dyn LlmClient, retry: RetryPolicy, config: &'a GenerationConfig) -> Self {
        Self {
            llm,
            retry,
            config,
            request_delay: Duration::from_secs(config.request_delay_seconds),
        }
    }

    /// Per-sub-chapter word target before the prompt multiplier.
    pub fn target_words(&self, spec: &BookSpec, plan: &ChapterPlan) -> usize {
        self.config.words_per_sub_chapter.unwrap_or_else(|| {
            spec.target_total_words
                .div_ceil(plan.total_sub_chapters().max(1))
        })
    }

    /// Drives every pending section to Done or Failed. `checkpoint` is called after
    /// each state change so an interrupted run can resume.
    pub async fn run<F>(
        &self,
        plan: &ChapterPlan,
        state: &mut GenerationState,
        mut checkpoint: F,
    ) -> Result<RunSummary>
    where
        F: FnMut(&GenerationState) -> Result<()>,
    {
        let spec = state.spec.clone();
        let target = self.target_words(&spec, plan);
        let keys = plan.keys();
        let mut summary = RunSummary::default();

        let settled = keys
            .iter()
            .filter(|k| state.status(**k).is_some_and(SectionStatus::is_settled))
            .count();
        if settled > 0 {
            info!("Resuming: {} of {} sub-chapters already finished", settled, keys.len());
        }

        let pb = ProgressBar::new(keys.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_position(settled as u64);

        let mut requests_sent = false;
        for key in keys {
            if state.status(key).is_some_and(SectionStatus::is_settled) {
                continue;
            }

            // Anything other than Pending here is rejected by the state machine.
            state.begin(key)?;
            checkpoint(&*state)?;
            pb.set_message(format!("sub-chapter {}", key));

            if requests_sent {
                self.pause().await;
            }
            requests_sent = true;

            match self
                .generate_section(&spec, plan, state, key, target, &mut summary)
                .await
            {
                SectionResult::Done {
                    text,
                    attempts,
                    regenerated,
                } => {
                    let words = word_count(&text);
                    state.complete(key, text, attempts, regenerated)?;
                    summary.generated += 1;
                    info!(
                        "Sub-chapter {} done: {} words ({} total)",
                        key, words, state.total_words
                    );
                }
                SectionResult::Failed { attempts, error } => {
                    let message = format!("{:#}", error);
                    state.fail(key, attempts, message.clone())?;
                    summary.failed.push(key);

                    match self.config.failure_policy {
                        FailurePolicy::Skip => {
                            warn!(
                                "Sub-chapter {} failed after {} attempt(s), flagged for manual fill: {}",
                                key, attempts, message
                            );
                        }
                        FailurePolicy::Abort => {
                            checkpoint(&*state)?;
                            pb.abandon();
                            return Err(BookError::Generation {
                                key,
                                attempts,
                                message,
                            }
                            .into());
                        }
                    }
                }
            }
            checkpoint(&*state)?;
            pb.inc(1);
        }

        pb.finish_with_message("done");
        Ok(summary)
    }

    async fn generate_section(
        &self,
        spec: &BookSpec,
        plan: &ChapterPlan,
        state: &GenerationState,
        key: SectionKey,
        target: usize,
        summary: &mut RunSummary,
    ) -> SectionResult {
        let prompt_target =
            ((target as f64) * self.config.prompt_length_multiplier).round() as usize;
        let mut prompt = SectionPrompt {
            spec,
            plan,
            key,
            context: state.context_before(key, self.config.context_window),
            context_chars: self.config.context_chars,
            target_words: prompt_target.max(1),
            shortfall: None,
        };

        let label = format!("sub-chapter {}", key);
        let (mut text, mut attempts) = match self.request(&label, &prompt).await {
            RetryOutcome::Done { value, attempts } => (value.trim().to_string(), attempts),
            RetryOutcome::Failed { attempts, error } => {
                return SectionResult::Failed { attempts, error }
            }
        };

        let mut words = word_count(&text);
        debug!("{}: first draft {} words, target {}", label, words, target);

        let mut regenerated = false;
        if self.config.regenerate_short && self.is_short(words, target) {
            info!(
                "{}: {} words is below the {} word target, asking once for a longer version",
                label, words, target
            );
            regenerated = true;
            summary.regenerated += 1;
            prompt.shortfall = Some(words);
            self.pause().await;

            match self.request(&format!("{} (length)", label), &prompt).await {
                RetryOutcome::Done {
                    value,
                    attempts: extra,
                } => {
                    attempts += extra;
                    let longer = value.trim().to_string();
                    let longer_words = word_count(&longer);
                    if longer_words > words {
                        text = longer;
                        words = longer_words;
                    }
                }
                RetryOutcome::Failed {
                    attempts: extra,
                    error,
                } => {
                    attempts += extra;
                    warn!("{}: length re-request failed, keeping first draft: {:#}", label, error);
                }
            }
        }

        if self.is_short(words, target) {
            let warning = LengthShortfallWarning { key, words, target };
            warn!("{}", warning);
            summary.shortfalls.push(warning);
        }

        SectionResult::Done {
            text,
            attempts,
            regenerated,
        }
    }

    async fn request(&self, label: &str, prompt: &SectionPrompt<'_>) -> RetryOutcome<String> {
        let llm = self.llm;
        let system = prompt.system();
        let user = prompt.render();
        let user = user.as_str();
        self.retry
            .run(label, move |_| async move {
                let text = llm.chat(system, user).await?;
                if text.trim().is_empty() {
                    anyhow::bail!("the model returned no text");
                }
                Ok(text)
            })
            .await
    }

    fn is_short(&self, words: usize, target: usize) -> bool {
        (words as f64) < (target as f64) * (1.0 - self.config.undershoot_margin)
    }

    async fn pause(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }
}
