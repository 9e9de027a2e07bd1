use crate::assembler::assemble;
use crate::book::{BookSpec, ChapterPlan};
use crate::config::{Config, FailurePolicy};
use crate::generator::{ChapterGenerator, RunSummary};
use crate::llm::LlmClient;
use crate::planner::OutlinePlanner;
use crate::setup;
use crate::state::GenerationState;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub struct WorkflowManager {
    config: Config,
    llm: Box<dyn LlmClient>,
}

impl WorkflowManager {
    pub fn new(config: Config, llm: Box<dyn LlmClient>) -> Self {
        Self { config, llm }
    }

    pub fn book_dir(&self, spec: &BookSpec) -> PathBuf {
        Path::new(&self.config.build_folder).join(spec.slug())
    }

    pub fn output_path(&self, spec: &BookSpec) -> PathBuf {
        Path::new(&self.config.output_folder).join(format!("{}.txt", spec.slug()))
    }

    fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn save_state(dir: &Path, state: &GenerationState) -> Result<()> {
        Self::save_json(&dir.join("state.json"), state)
    }

    /// Plans (or reloads) the outline, writes every pending sub-chapter and
    /// assembles the manuscript. Returns the path of the written book.
    pub async fn run(&self, spec: &BookSpec) -> Result<PathBuf> {
        spec.validate(&self.config.generation)?;

        let dir = self.book_dir(spec);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let saved: Option<GenerationState> = Self::load_json(&dir.join("state.json"))?;
        if let Some(saved) = &saved {
            if saved.spec != *spec {
                anyhow::bail!(
                    "{} holds progress for a different version of \"{}\". \
                     Remove that folder to start over with the new settings.",
                    dir.display(),
                    spec.title
                );
            }
        }

        let plan = self.obtain_plan(spec, &dir).await?;

        let mut state = match saved {
            Some(state) if state.matches_plan(&plan) => {
                info!(
                    "Loaded progress: {} of {} sub-chapters settled",
                    state.len() - state.unsettled(),
                    state.len()
                );
                state
            }
            Some(_) => anyhow::bail!(
                "Saved progress in {} does not match the outline in plan.json",
                dir.display()
            ),
            None => GenerationState::new(spec.clone(), &plan),
        };

        let reset = state.reset_interrupted();
        if reset > 0 {
            warn!("{} interrupted sub-chapter(s) will be written again", reset);
        }
        // Under abort, failed sections are retried rather than assembled as placeholders.
        if self.config.generation.failure_policy == FailurePolicy::Abort {
            let retried = state.retry_failed();
            if retried > 0 {
                info!("Retrying {} sub-chapter(s) that stopped the last run", retried);
            }
        }
        Self::save_state(&dir, &state)?;

        let summary = if state.is_complete() {
            info!("All sub-chapters already settled, assembling");
            RunSummary::default()
        } else {
            let generator = ChapterGenerator::new(
                self.llm.as_ref(),
                self.config.retry_policy(),
                &self.config.generation,
            );
            generator
                .run(&plan, &mut state, |s| Self::save_state(&dir, s))
                .await?
        };

        let manuscript = assemble(&plan, &state, &self.config.output)?;
        let path = self.output_path(spec);
        self.write_manuscript(&path, &manuscript)?;

        self.log_summary(&state, &summary, &path);
        Ok(path)
    }

    async fn obtain_plan(&self, spec: &BookSpec, dir: &Path) -> Result<ChapterPlan> {
        let plan_path = dir.join("plan.json");
        if let Some(plan) = Self::load_json::<ChapterPlan>(&plan_path)? {
            if fits(&plan, spec) {
                info!("Loading cached outline from {}", plan_path.display());
                return Ok(plan);
            }
            warn!("Cached outline does not fit the book settings, planning again");
        }

        let planner = OutlinePlanner::new(
            self.llm.as_ref(),
            self.config.retry_policy(),
            &self.config.generation,
        );
        let plan = loop {
            println!("Planning the outline of \"{}\"...", spec.title);
            let plan = planner.plan(spec).await?;
            if self.config.unattended || setup::review_outline(&plan)? {
                break plan;
            }
        };

        Self::save_json(&plan_path, &plan)?;
        Ok(plan)
    }

    fn write_manuscript(&self, path: &Path, manuscript: &str) -> Result<()> {
        if path.exists() {
            if self.config.unattended {
                warn!("Overwriting existing manuscript {}", path.display());
            } else if !setup::confirm_overwrite(path)? {
                anyhow::bail!(
                    "Kept the existing {}; the finished text is still in the build folder",
                    path.display()
                );
            }
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, manuscript)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn log_summary(&self, state: &GenerationState, summary: &RunSummary, path: &Path) {
        info!(
            "Finished \"{}\": {} sub-chapter(s) written this run, {} re-requested for length",
            state.spec.title, summary.generated, summary.regenerated
        );
        if !summary.shortfalls.is_empty() {
            warn!(
                "{} sub-chapter(s) stayed below their word target",
                summary.shortfalls.len()
            );
        }
        let failed = state.failed_keys();
        if !failed.is_empty() {
            let keys: Vec<String> = failed.iter().map(ToString::to_string).collect();
            warn!(
                "{} sub-chapter(s) need to be written by hand: {}",
                failed.len(),
                keys.join(", ")
            );
        }
        info!(
            "{} of {} sub-chapters done, {} words in total. Saved to {}",
            state.done_count(),
            state.len(),
            state.total_words,
            path.display()
        );
    }
}

fn fits(plan: &ChapterPlan, spec: &BookSpec) -> bool {
    plan.chapters.len() == spec.chapters
        && plan
            .chapters
            .iter()
            .all(|c| c.sub_chapters.len() == spec.sub_chapters_per_chapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::tests::sample_spec;
    use crate::book::SectionKey;
    use crate::planner::tests::outline_json;
    use crate::state::SectionStatus;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Calls {
        outline: usize,
        sections: Vec<String>,
    }

    #[derive(Debug)]
    struct MockLlmClient {
        calls: Arc<Mutex<Calls>>,
        fail_section: Option<String>,
    }

    impl MockLlmClient {
        fn new(calls: Arc<Mutex<Calls>>) -> Self {
            Self {
                calls,
                fail_section: None,
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, _system: &str, user: &str) -> Result<String> {
            let mut calls = self.calls.lock().unwrap();
            if user.contains("outline for the book below") {
                calls.outline += 1;
                return Ok(outline_json(0..2, 2));
            }
            let key = user
                .strip_prefix("Write sub-chapter ")
                .and_then(|rest| rest.split_whitespace().next())
                .unwrap_or("?")
                .to_string();
            calls.sections.push(key.clone());
            if self.fail_section.as_deref() == Some(key.as_str()) {
                anyhow::bail!("scripted failure for {}", key);
            }
            Ok(format!("Prose for {}. {}", key, "word ".repeat(120)))
        }
    }

    fn test_config(root: &Path) -> Config {
        let mut config: Config = serde_yaml_ng::from_str(
            "unattended: true\nllm:\n  provider: gemini\n  retry_count: 2\n  retry_delay_seconds: 0\n",
        )
        .unwrap();
        config.build_folder = root.join("build").to_string_lossy().to_string();
        config.output_folder = root.join("books").to_string_lossy().to_string();
        config
    }

    #[tokio::test]
    async fn test_full_run_writes_manuscript() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let calls = Arc::new(Mutex::new(Calls::default()));
        let manager = WorkflowManager::new(
            test_config(dir.path()),
            Box::new(MockLlmClient::new(calls.clone())),
        );
        let spec = sample_spec(2, 2, 400);

        let path = manager.run(&spec).await?;
        assert_eq!(path, dir.path().join("books").join("Test.txt"));

        let text = fs::read_to_string(&path)?;
        let order: Vec<usize> = ["Prose for 1.1", "Prose for 1.2", "Prose for 2.1", "Prose for 2.2"]
            .iter()
            .map(|s| text.find(s).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.outline, 1);
        assert_eq!(calls.sections, vec!["1.1", "1.2", "2.1", "2.2"]);

        let book_dir = dir.path().join("build").join("Test");
        assert!(book_dir.join("plan.json").exists());
        let state: GenerationState =
            serde_json::from_str(&fs::read_to_string(book_dir.join("state.json"))?)?;
        assert!(state.is_complete());
        assert_eq!(state.done_count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_hit_skips_llm() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = sample_spec(2, 2, 400);

        let first = Arc::new(Mutex::new(Calls::default()));
        WorkflowManager::new(test_config(dir.path()), Box::new(MockLlmClient::new(first)))
            .run(&spec)
            .await?;

        let second = Arc::new(Mutex::new(Calls::default()));
        WorkflowManager::new(
            test_config(dir.path()),
            Box::new(MockLlmClient::new(second.clone())),
        )
        .run(&spec)
        .await?;

        let calls = second.lock().unwrap();
        assert_eq!(calls.outline, 0);
        assert!(calls.sections.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_after_interruption() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let spec = sample_spec(2, 2, 400);
        let plan: ChapterPlan = ChapterPlan {
            chapters: crate::planner::parse_outline(&outline_json(0..2, 2), 2, 2).unwrap(),
        };

        // Two sections finished, the third was in flight when the process stopped.
        let mut state = GenerationState::new(spec.clone(), &plan);
        for key in [SectionKey::new(0, 0), SectionKey::new(0, 1)] {
            state.begin(key)?;
            state.complete(key, format!("Saved prose {}.", key), 1, false)?;
        }
        state.begin(SectionKey::new(1, 0))?;

        let book_dir = dir.path().join("build").join("Test");
        fs::create_dir_all(&book_dir)?;
        fs::write(book_dir.join("plan.json"), serde_json::to_string(&plan)?)?;
        fs::write(book_dir.join("state.json"), serde_json::to_string(&state)?)?;

        let calls = Arc::new(Mutex::new(Calls::default()));
        let path = WorkflowManager::new(config, Box::new(MockLlmClient::new(calls.clone())))
            .run(&spec)
            .await?;

        assert_eq!(calls.lock().unwrap().sections, vec!["2.1", "2.2"]);
        let text = fs::read_to_string(path)?;
        assert!(text.contains("Saved prose 1.1."));
        assert!(text.contains("Saved prose 1.2."));
        assert!(text.contains("Prose for 2.2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_changed_book_settings_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = sample_spec(2, 2, 400);
        let calls = Arc::new(Mutex::new(Calls::default()));
        WorkflowManager::new(test_config(dir.path()), Box::new(MockLlmClient::new(calls)))
            .run(&spec)
            .await?;

        let mut changed = spec.clone();
        changed.premise = "An entirely different story.".into();
        let calls = Arc::new(Mutex::new(Calls::default()));
        let err = WorkflowManager::new(
            test_config(dir.path()),
            Box::new(MockLlmClient::new(calls.clone())),
        )
        .run(&changed)
        .await
        .unwrap_err();

        assert!(err.to_string().contains("different version"));
        assert_eq!(calls.lock().unwrap().outline, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_section_left_for_manual_fill() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = test_config(dir.path());
        config.generation.failure_policy = FailurePolicy::Skip;
        let calls = Arc::new(Mutex::new(Calls::default()));
        let llm = MockLlmClient {
            calls: calls.clone(),
            fail_section: Some("1.2".into()),
        };
        let spec = sample_spec(2, 2, 400);

        let path = WorkflowManager::new(config, Box::new(llm)).run(&spec).await?;
        let text = fs::read_to_string(path)?;
        assert!(text.contains("[Sub-chapter 1.2 could not be generated"));
        assert!(text.contains("Prose for 2.1"));

        let state: GenerationState = serde_json::from_str(&fs::read_to_string(
            dir.path().join("build").join("Test").join("state.json"),
        )?)?;
        assert!(matches!(
            state.status(SectionKey::new(0, 1)),
            Some(SectionStatus::Failed { attempts: 2, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_aborted_section_is_retried_on_next_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = sample_spec(2, 2, 400);
        let abort_config = || {
            let mut config = test_config(dir.path());
            config.generation.failure_policy = FailurePolicy::Abort;
            config
        };

        let first = Arc::new(Mutex::new(Calls::default()));
        let failing = MockLlmClient {
            calls: first.clone(),
            fail_section: Some("1.2".into()),
        };
        let err = WorkflowManager::new(abort_config(), Box::new(failing))
            .run(&spec)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::BookError>(),
            Some(crate::error::BookError::Generation { .. })
        ));
        assert!(!dir.path().join("books").join("Test.txt").exists());

        let second = Arc::new(Mutex::new(Calls::default()));
        let path = WorkflowManager::new(
            abort_config(),
            Box::new(MockLlmClient::new(second.clone())),
        )
        .run(&spec)
        .await?;

        assert_eq!(second.lock().unwrap().sections, vec!["1.2", "2.1", "2.2"]);
        let text = fs::read_to_string(path)?;
        assert!(text.contains("Prose for 1.2"));
        assert!(!text.contains("could not be generated"));
        Ok(())
    }
}
