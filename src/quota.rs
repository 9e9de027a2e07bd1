use crate::error::LlmError;
use crate::llm::LlmClient;
use anyhow::Result;
use async_trait::async_trait;
use inquire::{Password, Select};
use log::{info, warn};
use std::fmt::Debug;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaAction {
    /// Retry the same request with this credential.
    NewKey(String),
    Wait(Duration),
    GiveUp,
}

/// Decides how to continue after the API reports an exhausted quota.
pub trait QuotaPolicy: Send + Sync + Debug {
    /// `waits` is how many times the current request already waited.
    fn decide(&self, waits: u32, message: &str) -> Result<QuotaAction>;
}

/// Unattended runs sleep through the quota window a bounded number of times.
#[derive(Debug)]
pub struct WaitForQuota {
    pub wait: Duration,
    pub max_waits: u32,
}

impl QuotaPolicy for WaitForQuota {
    fn decide(&self, waits: u32, _message: &str) -> Result<QuotaAction> {
        if waits < self.max_waits {
            Ok(QuotaAction::Wait(self.wait))
        } else {
            Ok(QuotaAction::GiveUp)
        }
    }
}

/// Interactive runs ask the user for a replacement key.
#[derive(Debug)]
pub struct AskForKey {
    pub wait: Duration,
}

impl QuotaPolicy for AskForKey {
    fn decide(&self, _waits: u32, message: &str) -> Result<QuotaAction> {
        println!("\n--- API quota limit reached ---\n{}", message);
        let wait_label = format!("Wait {} seconds and try again", self.wait.as_secs());
        let options = vec!["Enter a new API key", wait_label.as_str(), "Stop"];
        let choice = Select::new("How do you want to continue?", options).raw_prompt()?;

        match choice.index {
            0 => {
                let key = Password::new("New API key:")
                    .without_confirmation()
                    .with_help_message("Press Enter without a key to stop")
                    .prompt()?;
                let key = key.trim();
                if key.is_empty() {
                    Ok(QuotaAction::GiveUp)
                } else {
                    Ok(QuotaAction::NewKey(key.to_string()))
                }
            }
            1 => Ok(QuotaAction::Wait(self.wait)),
            _ => Ok(QuotaAction::GiveUp),
        }
    }
}

/// Wraps a client so quota errors pause the request instead of burning the retry budget.
#[derive(Debug)]
pub struct QuotaGuard {
    inner: Box<dyn LlmClient>,
    policy: Box<dyn QuotaPolicy>,
}

impl QuotaGuard {
    pub fn new(inner: Box<dyn LlmClient>, policy: Box<dyn QuotaPolicy>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl LlmClient for QuotaGuard {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let mut waits = 0;
        loop {
            let err = match self.inner.chat(system, user).await {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };
            let message = match err.downcast_ref::<LlmError>() {
                Some(LlmError::RateLimited(message)) => message.clone(),
                _ => return Err(err),
            };

            match self.policy.decide(waits, &message)? {
                QuotaAction::NewKey(key) => {
                    if !self.inner.set_api_key(&key) {
                        return Err(LlmError::QuotaExhausted(format!(
                            "{} (this provider cannot switch keys)",
                            message
                        ))
                        .into());
                    }
                    info!("API key replaced, sending the request again");
                    waits = 0;
                }
                QuotaAction::Wait(delay) => {
                    waits += 1;
                    warn!("API quota reached, waiting {:?} before trying again", delay);
                    tokio::time::sleep(delay).await;
                }
                QuotaAction::GiveUp => return Err(LlmError::QuotaExhausted(message).into()),
            }
        }
    }

    fn set_api_key(&self, key: &str) -> bool {
        self.inner.set_api_key(key)
    }
}
