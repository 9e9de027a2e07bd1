use crate::book::{BookSpec, ChapterPlan, SectionKey};
use crate::error::BookError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SectionStatus {
    Pending,
    Generating,
    Done {
        text: String,
        words: usize,
        attempts: u32,
        /// The single length re-request was issued for this section.
        #[serde(default)]
        regenerated: bool,
    },
    Failed {
        attempts: u32,
        error: String,
    },
}

impl SectionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SectionStatus::Pending => "pending",
            SectionStatus::Generating => "generating",
            SectionStatus::Done { .. } => "done",
            SectionStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, SectionStatus::Done { .. } | SectionStatus::Failed { .. })
    }
}

/// Progress of one book. Keys come from the plan and never change afterwards;
/// the BTreeMap keeps them in narrative order.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GenerationState {
    pub spec: BookSpec,
    #[serde(with = "entries_as_list")]
    entries: BTreeMap<SectionKey, SectionStatus>,
    pub total_words: usize,
}

impl GenerationState {
    pub fn new(spec: BookSpec, plan: &ChapterPlan) -> Self {
        let entries = plan
            .keys()
            .into_iter()
            .map(|key| (key, SectionStatus::Pending))
            .collect();
        Self {
            spec,
            entries,
            total_words: 0,
        }
    }

    pub fn status(&self, key: SectionKey) -> Option<&SectionStatus> {
        self.entries.get(&key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (SectionKey, &SectionStatus)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the state was built from this exact plan layout.
    pub fn matches_plan(&self, plan: &ChapterPlan) -> bool {
        self.entries.keys().copied().eq(plan.keys())
    }

    pub fn next_pending(&self) -> Option<SectionKey> {
        self.entries
            .iter()
            .find(|(_, status)| matches!(status, SectionStatus::Pending))
            .map(|(key, _)| *key)
    }

    pub fn is_complete(&self) -> bool {
        self.entries.values().all(SectionStatus::is_settled)
    }

    pub fn unsettled(&self) -> usize {
        self.entries.values().filter(|s| !s.is_settled()).count()
    }

    pub fn done_count(&self) -> usize {
        self.entries
            .values()
            .filter(|s| matches!(s, SectionStatus::Done { .. }))
            .count()
    }

    pub fn failed_keys(&self) -> Vec<SectionKey> {
        self.entries
            .iter()
            .filter(|(_, s)| matches!(s, SectionStatus::Failed { .. }))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Texts of the last `n` finished sections before `key`, oldest first.
    pub fn context_before(&self, key: SectionKey, n: usize) -> Vec<&str> {
        let mut texts: Vec<&str> = self
            .entries
            .range(..key)
            .rev()
            .filter_map(|(_, status)| match status {
                SectionStatus::Done { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .take(n)
            .collect();
        texts.reverse();
        texts
    }

    /// Pending -> Generating. Refuses any key that is not pending, or that has an
    /// unsettled section before it.
    pub fn begin(&mut self, key: SectionKey) -> Result<(), BookError> {
        self.transition(key, "generating", |status| {
            matches!(status, SectionStatus::Pending)
        })?;
        if let Some((earlier, _)) = self
            .entries
            .range(..key)
            .find(|(_, status)| !status.is_settled())
        {
            return Err(BookError::OutOfOrder {
                key,
                blocked_by: *earlier,
            });
        }
        self.entries.insert(key, SectionStatus::Generating);
        Ok(())
    }

    /// Generating -> Done.
    pub fn complete(
        &mut self,
        key: SectionKey,
        text: String,
        attempts: u32,
        regenerated: bool,
    ) -> Result<(), BookError> {
        self.transition(key, "done", |status| {
            matches!(status, SectionStatus::Generating)
        })?;
        let words = crate::book::word_count(&text);
        self.total_words += words;
        self.entries.insert(
            key,
            SectionStatus::Done {
                text,
                words,
                attempts,
                regenerated,
            },
        );
        Ok(())
    }

    /// Generating -> Failed.
    pub fn fail(&mut self, key: SectionKey, attempts: u32, error: String) -> Result<(), BookError> {
        self.transition(key, "failed", |status| {
            matches!(status, SectionStatus::Generating)
        })?;
        self.entries
            .insert(key, SectionStatus::Failed { attempts, error });
        Ok(())
    }

    /// A run killed mid-request leaves its section in Generating; put it back.
    pub fn reset_interrupted(&mut self) -> usize {
        let mut reset = 0;
        for status in self.entries.values_mut() {
            if matches!(status, SectionStatus::Generating) {
                *status = SectionStatus::Pending;
                reset += 1;
            }
        }
        reset
    }

    /// Failed -> Pending, so the next run asks for those sections again.
    pub fn retry_failed(&mut self) -> usize {
        let mut reset = 0;
        for status in self.entries.values_mut() {
            if matches!(status, SectionStatus::Failed { .. }) {
                *status = SectionStatus::Pending;
                reset += 1;
            }
        }
        reset
    }

    fn transition<F>(&self, key: SectionKey, to: &'static str, allowed: F) -> Result<(), BookError>
    where
        F: Fn(&SectionStatus) -> bool,
    {
        match self.entries.get(&key) {
            Some(status) if allowed(status) => Ok(()),
            Some(status) => Err(BookError::InvalidTransition {
                key,
                from: status.name(),
                to,
            }),
            None => Err(BookError::InvalidTransition {
                key,
                from: "unplanned",
                to,
            }),
        }
    }
}

/// JSON objects need string keys, so the map is stored as an ordered list.
mod entries_as_list {
    use super::{SectionKey, SectionStatus};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        key: SectionKey,
        #[serde(flatten)]
        status: SectionStatus,
    }

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<SectionKey, SectionStatus>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<Entry> = map
            .iter()
            .map(|(key, status)| Entry {
                key: *key,
                status: status.clone(),
            })
            .collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<SectionKey, SectionStatus>, D::Error> {
        let list = Vec::<Entry>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for entry in list {
            if map.insert(entry.key, entry.status).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "duplicate sub-chapter {} in state file",
                    entry.key
                )));
            }
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::tests::{sample_plan, sample_spec};

    fn state_2x2() -> GenerationState {
        GenerationState::new(sample_spec(2, 2, 4000), &sample_plan(2, 2))
    }

    #[test]
    fn test_new_state_is_all_pending() {
        let state = state_2x2();
        assert_eq!(state.len(), 4);
        assert_eq!(state.next_pending(), Some(SectionKey::new(0, 0)));
        assert!(!state.is_complete());
        assert_eq!(state.unsettled(), 4);
    }

    #[test]
    fn test_transitions() {
        let mut state = state_2x2();
        let key = SectionKey::new(0, 0);
        state.begin(key).unwrap();
        assert_eq!(state.status(key), Some(&SectionStatus::Generating));
        state.complete(key, "one two three".into(), 1, false).unwrap();
        assert_eq!(state.total_words, 3);
        assert_eq!(state.next_pending(), Some(SectionKey::new(0, 1)));
    }

    #[test]
    fn test_done_section_cannot_restart() {
        let mut state = state_2x2();
        let key = SectionKey::new(0, 0);
        state.begin(key).unwrap();
        state.complete(key, "text".into(), 1, false).unwrap();

        let err = state.begin(key).unwrap_err();
        assert!(matches!(
            err,
            BookError::InvalidTransition { from: "done", to: "generating", .. }
        ));
        let err = state.complete(key, "again".into(), 1, false).unwrap_err();
        assert!(matches!(err, BookError::InvalidTransition { from: "done", .. }));
    }

    #[test]
    fn test_cannot_skip_ahead() {
        let mut state = state_2x2();
        let err = state.begin(SectionKey::new(1, 0)).unwrap_err();
        assert!(matches!(err, BookError::OutOfOrder { blocked_by, .. } if blocked_by == SectionKey::new(0, 0)));
        assert_eq!(state.status(SectionKey::new(1, 0)), Some(&SectionStatus::Pending));
    }

    #[test]
    fn test_unplanned_key_rejected() {
        let mut state = state_2x2();
        state.begin(SectionKey::new(0, 0)).unwrap();
        state.fail(SectionKey::new(0, 0), 3, "down".into()).unwrap();
        state.begin(SectionKey::new(0, 1)).unwrap();
        state.complete(SectionKey::new(0, 1), "x".into(), 1, false).unwrap();
        let err = state.begin(SectionKey::new(5, 0)).unwrap_err();
        assert!(err.to_string().contains("unplanned"));
    }

    #[test]
    fn test_context_before_skips_failed() {
        let mut state = state_2x2();
        let keys = [
            SectionKey::new(0, 0),
            SectionKey::new(0, 1),
            SectionKey::new(1, 0),
        ];
        state.begin(keys[0]).unwrap();
        state.complete(keys[0], "first".into(), 1, false).unwrap();
        state.begin(keys[1]).unwrap();
        state.fail(keys[1], 3, "down".into()).unwrap();
        state.begin(keys[2]).unwrap();
        state.complete(keys[2], "third".into(), 1, false).unwrap();

        let ctx = state.context_before(SectionKey::new(1, 1), 2);
        assert_eq!(ctx, vec!["first", "third"]);
        let ctx = state.context_before(SectionKey::new(1, 1), 1);
        assert_eq!(ctx, vec!["third"]);
        assert!(state.context_before(SectionKey::new(0, 0), 2).is_empty());
        assert_eq!(state.failed_keys(), vec![keys[1]]);
    }

    #[test]
    fn test_reset_interrupted() {
        let mut state = state_2x2();
        state.begin(SectionKey::new(0, 0)).unwrap();
        assert_eq!(state.reset_interrupted(), 1);
        assert_eq!(state.next_pending(), Some(SectionKey::new(0, 0)));
    }

    #[test]
    fn test_retry_failed_keeps_done_sections() {
        let mut state = state_2x2();
        state.begin(SectionKey::new(0, 0)).unwrap();
        state.complete(SectionKey::new(0, 0), "kept".into(), 1, false).unwrap();
        state.begin(SectionKey::new(0, 1)).unwrap();
        state.fail(SectionKey::new(0, 1), 3, "503".into()).unwrap();

        assert_eq!(state.retry_failed(), 1);
        assert!(state.failed_keys().is_empty());
        assert_eq!(state.next_pending(), Some(SectionKey::new(0, 1)));
        assert!(matches!(
            state.status(SectionKey::new(0, 0)),
            Some(SectionStatus::Done { .. })
        ));
        assert_eq!(state.retry_failed(), 0);
    }

    #[test]
    fn test_state_survives_json() {
        let mut state = state_2x2();
        state.begin(SectionKey::new(0, 0)).unwrap();
        state.complete(SectionKey::new(0, 0), "saved text".into(), 2, true).unwrap();

        let json = serde_json::to_string_pretty(&state).unwrap();
        let loaded: GenerationState = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.status(SectionKey::new(0, 0)), state.status(SectionKey::new(0, 0)));
        assert!(loaded.matches_plan(&sample_plan(2, 2)));
        assert!(!loaded.matches_plan(&sample_plan(2, 3)));
        assert_eq!(loaded.total_words, 2);
    }

    #[test]
    fn test_duplicate_keys_in_file_rejected() {
        let json = r#"{
            "spec": {
                "title": "Test", "premise": "p", "target_total_words": 10,
                "chapters": 1, "sub_chapters_per_chapter": 1
            },
            "entries": [
                { "key": { "chapter": 0, "sub_chapter": 0 }, "status": "pending" },
                { "key": { "chapter": 0, "sub_chapter": 0 }, "status": "pending" }
            ],
            "total_words": 0
        }"#;
        let err = serde_json::from_str::<GenerationState>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
