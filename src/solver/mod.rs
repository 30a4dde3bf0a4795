//! The answer solver: an iterative tool-calling loop over the chat model.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::{Answer, ChallengeLink, PageContext, TaskDescription, TriedAnswer};
use crate::errors::SolveError;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient, ToolCall, ToolSpec};
use crate::page::{PageVisitor, ScratchDirs};
use crate::sandbox::{RESULT_NAME, Sandbox};

/// Default number of model turns per solve.
pub const DEFAULT_MAX_STEPS: u32 = 12;

/// Tool output longer than this is cut before it goes back to the model.
const MAX_TOOL_OUTPUT_CHARS: usize = 20_000;

#[async_trait]
pub trait AnswerSolver: Send + Sync {
    /// Produce one answer. `tried` holds the wrong answers already submitted
    /// for this link, oldest first.
    async fn solve(
        &self,
        task: &TaskDescription,
        page: &PageContext,
        tried: &[TriedAnswer],
    ) -> Result<Answer, SolveError>;
}

pub struct ToolLoopSolver {
    llm: Arc<dyn LlmClient>,
    sandbox: Sandbox,
    visitor: Arc<dyn PageVisitor>,
    max_steps: u32,
}

#[derive(Deserialize)]
struct RunJavascriptArgs {
    code: String,
}

#[derive(Deserialize)]
struct VisitPageArgs {
    url: String,
}

impl ToolLoopSolver {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sandbox: Sandbox,
        visitor: Arc<dyn PageVisitor>,
        max_steps: u32,
    ) -> Self {
        Self {
            llm,
            sandbox,
            visitor,
            max_steps: max_steps.max(1),
        }
    }

    fn tools() -> Vec<ToolSpec> {
        vec![
            ToolSpec::function(
                "run_javascript",
                format!(
                    "Run a JavaScript fragment in a sandbox and get back the value assigned to `{}` as text. \
                     Errors come back as text starting with 'Error:'.",
                    RESULT_NAME
                ),
                json!({
                    "type": "object",
                    "properties": {"code": {"type": "string", "description": "JavaScript source"}},
                    "required": ["code"]
                }),
            ),
            ToolSpec::function(
                "visit_page",
                "Visit a URL and get its text, downloaded files and transcripts.",
                json!({
                    "type": "object",
                    "properties": {"url": {"type": "string"}},
                    "required": ["url"]
                }),
            ),
        ]
    }

    fn system_prompt(&self) -> String {
        format!(
            "You solve data quiz tasks. Work things out with the tools instead of guessing.\n\
             \n\
             run_javascript executes plain JavaScript. Assign the final value to `{result}`. \
             Modules cannot be loaded; these functions are already available by name:\n\
             {capabilities}\n\
             Downloaded files are on local disk at the paths listed in DOWNLOADED FILES.\n\
             \n\
             When you are done, reply with ONLY the answer value: a number, string, boolean \
             or JSON. No explanation, no submission.",
            result = RESULT_NAME,
            capabilities = self.sandbox.capabilities().describe()
        )
    }

    /// Run one tool call. Pages fetched by `visit_page` stay on disk in
    /// `scratch` so later code in the same solve can read their downloads.
    async fn dispatch(&self, call: &ToolCall, scratch: &mut ScratchDirs) -> String {
        let output = match call.function.name.as_str() {
            "run_javascript" => match serde_json::from_str::<RunJavascriptArgs>(&call.function.arguments) {
                Ok(args) => self.sandbox.run(&args.code).await,
                Err(e) => format!("Error: invalid arguments for run_javascript: {}", e),
            },
            "visit_page" => match serde_json::from_str::<VisitPageArgs>(&call.function.arguments) {
                Ok(args) => {
                    let page = self.visitor.visit(&ChallengeLink::start(args.url)).await;
                    scratch.track(&page);
                    page.render()
                }
                Err(e) => format!("Error: invalid arguments for visit_page: {}", e),
            },
            other => format!("Error: unknown tool '{}'", other),
        };
        truncate(output)
    }
}

/// The first user message: task, page context and rejected answers.
pub fn task_prompt(task: &TaskDescription, page: &PageContext, tried: &[TriedAnswer]) -> String {
    let mut prompt = format!(
        "Task: {}\n\nExpected payload shape: {}\n\nContext:\n{}",
        task.question,
        task.payload_shape,
        page.render()
    );
    if !tried.is_empty() {
        prompt.push_str("\nThese answers were already submitted and rejected. Do not repeat them:\n");
        for t in tried {
            match &t.reason {
                Some(reason) => prompt.push_str(&format!("- {} (server said: {})\n", t.answer, reason)),
                None => prompt.push_str(&format!("- {}\n", t.answer)),
            }
        }
    }
    prompt
}

fn truncate(mut text: String) -> String {
    if let Some((cut, _)) = text.char_indices().nth(MAX_TOOL_OUTPUT_CHARS) {
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

#[async_trait]
impl AnswerSolver for ToolLoopSolver {
    async fn solve(
        &self,
        task: &TaskDescription,
        page: &PageContext,
        tried: &[TriedAnswer],
    ) -> Result<Answer, SolveError> {
        let mut messages = vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(task_prompt(task, page, tried)),
        ];
        let tools = Self::tools();
        let mut last_text = String::new();
        let mut scratch = ScratchDirs::default();

        for step in 1..=self.max_steps {
            let reply = self
                .llm
                .complete(CompletionRequest {
                    messages: messages.clone(),
                    tools: tools.clone(),
                    json_mode: false,
                })
                .await?;
            last_text = reply.text().to_string();

            if reply.tool_calls.is_empty() {
                info!(step, answer = %last_text, "solver produced an answer");
                return Ok(Answer::from_model_output(&last_text));
            }

            let calls = reply.tool_calls.clone();
            messages.push(reply);
            for call in &calls {
                debug!(step, tool = %call.function.name, "solver tool call");
                let output = self.dispatch(call, &mut scratch).await;
                messages.push(ChatMessage::tool_result(&call.id, output));
            }
        }

        warn!(steps = self.max_steps, "solver step budget exhausted");
        if last_text.trim().is_empty() {
            Err(SolveError::StepBudgetExhausted {
                steps: self.max_steps,
            })
        } else {
            Ok(Answer::from_model_output(&last_text))
        }
    }
}
