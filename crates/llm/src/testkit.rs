//! Scripted model for tests.
//!
//! Pipelines are exercised against a queue of canned outcomes: each call
//! pops the next step.  The queue records every `(system, user)` pair it
//! saw so assertions can inspect the prompts that were actually sent.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{LlmError, LlmResponse, TextModel, Usage, estimate_tokens};

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    ReplyWithUsage(String, Usage),
    Fail(LlmError),
}

#[derive(Debug, Clone)]
pub struct SeenCall {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<SeenCall>>,
}

impl ScriptedModel {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A model that answers every call with the same text.
    pub fn always(reply: impl Into<String>) -> Self {
        let model = Self::default();
        model
            .steps
            .lock()
            .unwrap()
            .push_back(Step::Reply(reply.into()));
        model
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> Vec<SeenCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TextModel for ScriptedModel {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<LlmResponse, LlmError> {
        self.calls.lock().unwrap().push(SeenCall {
            system: system.to_string(),
            user: user.to_string(),
            max_tokens,
        });

        let step = {
            let mut steps = self.steps.lock().unwrap();
            match steps.len() {
                0 => None,
                // A single remaining step is sticky so `always` keeps working.
                1 => steps.front().cloned(),
                _ => steps.pop_front(),
            }
        };

        match step {
            Some(Step::Reply(content)) => {
                let usage = Usage {
                    input_tokens: estimate_tokens(system) + estimate_tokens(user),
                    output_tokens: estimate_tokens(&content),
                };
                Ok(LlmResponse { content, usage })
            }
            Some(Step::ReplyWithUsage(content, usage)) => Ok(LlmResponse { content, usage }),
            Some(Step::Fail(err)) => Err(err),
            None => Err(LlmError::Empty),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
