//! The tool-calling loop behind every user turn.
//!
//! Each turn runs a small state machine: ask the model, execute whatever tools
//! it requests, feed the results back, and repeat until the model answers in
//! text or a bound is hit. Model calls are retried under the [`RetryPolicy`];
//! tool rounds are capped so a confused model cannot loop forever.
//!
//! Session state is only touched when the turn finishes. Until then the user
//! message, tool calls, results, and any newly verified customer live in a
//! pending buffer, so a turn that is dropped halfway (the caller went away)
//! leaves the session exactly as it was.

use crate::backend::{BackendClient, HttpTransport, RpcTransport};
use crate::catalog::{self, Operation};
use crate::config::{AssistantConfig, ConversationConfig};
use crate::error::{Error, FaultKind, Result};
use crate::llm::{ChatModel, ModelRequest};
use crate::prompt;
use crate::retry::RetryPolicy;
use crate::session::{
    ConversationTurn, CustomerContext, SessionState, ToolInvocationRequest, ToolInvocationResult,
    window,
};
use futures::future::join_all;
use tracing::{debug, info, warn};

pub const RATE_LIMITED_MESSAGE: &str = "The assistant is receiving a lot of requests right now. \
     Please wait a moment and try again.";
/// Shown for both model and backend configuration faults, so it names neither.
pub const CONFIGURATION_MESSAGE: &str = "The assistant is not set up correctly, so I can't \
     help with this right now. Please contact the site administrator.";
pub const UNAVAILABLE_MESSAGE: &str =
    "Sorry, something went wrong while handling your request. Please try again.";
pub const ROUND_LIMIT_MESSAGE: &str = "Sorry, I was unable to complete this request. \
     Please try rephrasing it or breaking it into smaller steps.";
pub const EMPTY_REPLY_MESSAGE: &str =
    "I apologize, but I couldn't generate a response. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingModel,
    ExecutingTools,
    Done,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The model kept asking for tools past the round cap.
    RoundLimit,
    /// The LLM kept rate limiting after every retry.
    RateLimited,
    /// Credentials or request shape rejected; retrying cannot help.
    Configuration,
    /// Transport faults on the LLM or the backend outlasted the retries.
    Unavailable,
}

impl AbortReason {
    fn from_error(error: &Error) -> Self {
        match error.fault_kind() {
            FaultKind::RateLimited => Self::RateLimited,
            FaultKind::Configuration => Self::Configuration,
            FaultKind::Transport => Self::Unavailable,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::RoundLimit => ROUND_LIMIT_MESSAGE,
            Self::RateLimited => RATE_LIMITED_MESSAGE,
            Self::Configuration => CONFIGURATION_MESSAGE,
            Self::Unavailable => UNAVAILABLE_MESSAGE,
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The one message shown to the user.
    pub message: String,
    /// `Done` or `Aborted`; never an intermediate state.
    pub state: TurnState,
    /// Tool rounds executed.
    pub rounds: u32,
    pub tool_calls: Vec<ToolInvocationRequest>,
}

/// Turns produced so far plus a staged customer, applied together at the end.
struct PendingTurn {
    turns: Vec<ConversationTurn>,
    customer: Option<CustomerContext>,
    tool_calls: Vec<ToolInvocationRequest>,
    rounds: u32,
}

impl PendingTurn {
    fn new(user_text: &str, customer: Option<CustomerContext>) -> Self {
        Self {
            turns: vec![ConversationTurn::user(user_text)],
            customer,
            tool_calls: Vec::new(),
            rounds: 0,
        }
    }

    fn finish(self, session: &mut SessionState, message: String) -> TurnOutcome {
        let mut turns = self.turns;
        turns.push(ConversationTurn::assistant(message.clone()));
        session.commit(turns, self.customer);
        TurnOutcome {
            message,
            state: TurnState::Done,
            rounds: self.rounds,
            tool_calls: self.tool_calls,
        }
    }

    /// Keep the user message and a synthetic reply; drop the tool rounds.
    fn abort(mut self, session: &mut SessionState, reason: AbortReason) -> TurnOutcome {
        let message = reason.message().to_string();
        self.turns.truncate(1);
        self.turns.push(ConversationTurn::assistant(message.clone()));
        session.commit(self.turns, self.customer);
        TurnOutcome {
            message,
            state: TurnState::Aborted(reason),
            rounds: self.rounds,
            tool_calls: self.tool_calls,
        }
    }
}

pub struct Orchestrator<M, T = HttpTransport> {
    model: M,
    backend: BackendClient<T>,
    conversation: ConversationConfig,
    assistant: AssistantConfig,
    retry: RetryPolicy,
}

impl<M: ChatModel, T: RpcTransport> Orchestrator<M, T> {
    /// Fails if the catalog and its dispatch table disagree.
    pub fn new(
        model: M,
        backend: BackendClient<T>,
        conversation: ConversationConfig,
        assistant: AssistantConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        catalog::check_dispatch().map_err(Error::config)?;
        Ok(Self {
            model,
            backend,
            conversation,
            assistant,
            retry,
        })
    }

    pub fn backend(&self) -> &BackendClient<T> {
        &self.backend
    }

    /// Single entry point for the UI: one call per user submission.
    ///
    /// Every failure resolves to a text reply.
    pub async fn handle_user_turn(&self, session: &mut SessionState, text: &str) -> String {
        self.run_turn(session, text).await.message
    }

    pub async fn run_turn(&self, session: &mut SessionState, text: &str) -> TurnOutcome {
        let mut pending = PendingTurn::new(text, session.customer().cloned());
        let tools = catalog::list_operations();
        let max_rounds = self.conversation.max_tool_rounds;
        let mut state = TurnState::AwaitingModel;

        info!(
            verified = session.is_verified(),
            history = session.history().len(),
            "user turn started"
        );

        loop {
            debug!(state = ?state, round = pending.rounds, "turn step");

            let system =
                prompt::build_system_prompt(&self.assistant, tools, pending.customer.as_ref());
            let context = self.context(session.history(), &pending.turns);
            let request = &ModelRequest {
                system: &system,
                turns: &context,
                tools,
            };

            let reply = match self
                .retry
                .run("llm", move || self.model.respond(request))
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    let reason = AbortReason::from_error(&e);
                    warn!(error = %e, reason = ?reason, round = pending.rounds, "model call failed, aborting turn");
                    return pending.abort(session, reason);
                }
            };

            if reply.tool_calls.is_empty() {
                let message = if reply.text.trim().is_empty() {
                    EMPTY_REPLY_MESSAGE.to_string()
                } else {
                    reply.text
                };
                info!(rounds = pending.rounds, tool_calls = pending.tool_calls.len(), "turn done");
                return pending.finish(session, message);
            }

            if pending.rounds >= max_rounds {
                warn!(
                    rounds = pending.rounds,
                    requested = reply.tool_calls.len(),
                    "tool round limit reached, aborting turn"
                );
                return pending.abort(session, AbortReason::RoundLimit);
            }

            state = TurnState::ExecutingTools;
            pending.rounds += 1;
            debug!(state = ?state, round = pending.rounds, calls = reply.tool_calls.len(), "executing tools");

            let calls = reply.tool_calls;
            let results = match self.execute_round(&calls).await {
                Ok(results) => results,
                Err(e) => {
                    let reason = AbortReason::from_error(&e);
                    warn!(error = %e, reason = ?reason, round = pending.rounds, "backend call failed, aborting turn");
                    pending.tool_calls.extend(calls);
                    return pending.abort(session, reason);
                }
            };

            for (call, result) in calls.iter().zip(&results) {
                if let Some(customer) = verified_customer(call, result) {
                    info!(customer_id = ?customer.customer_id, "customer verified");
                    pending.customer = Some(customer);
                }
            }

            pending.turns.push(ConversationTurn::tool_calls(calls.clone()));
            pending.tool_calls.extend(calls);
            pending
                .turns
                .extend(results.into_iter().map(ConversationTurn::tool_result));
            state = TurnState::AwaitingModel;
        }
    }

    /// The most recent history plus everything produced in this turn.
    ///
    /// The window counts the new user message, so the first request of a turn
    /// carries exactly `history_window` entries once history is long enough.
    fn context(
        &self,
        history: &[ConversationTurn],
        pending: &[ConversationTurn],
    ) -> Vec<ConversationTurn> {
        let keep = self.conversation.history_window.saturating_sub(1);
        window(history, keep)
            .iter()
            .chain(pending)
            .cloned()
            .collect()
    }

    /// Run every call of one round; results come back in request order.
    async fn execute_round(
        &self,
        calls: &[ToolInvocationRequest],
    ) -> Result<Vec<ToolInvocationResult>> {
        let timeout = self.backend.default_timeout();

        if self.conversation.concurrent_tools {
            return join_all(calls.iter().map(|call| self.backend.invoke(call, timeout)))
                .await
                .into_iter()
                .collect();
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            debug!(operation = %call.operation_name, id = %call.id, "executing tool");
            results.push(self.backend.invoke(call, timeout).await?);
        }
        Ok(results)
    }
}

/// The customer established by `result`, if it is a successful PIN check
/// that names a customer.
fn verified_customer(
    call: &ToolInvocationRequest,
    result: &ToolInvocationResult,
) -> Option<CustomerContext> {
    let operation = Operation::from_name(&call.operation_name)?;
    if !(operation.is_verification() && result.success) {
        return None;
    }
    let customer =
        CustomerContext::from_verification(&result.payload, call.arguments["email"].as_str());
    if customer.is_none() {
        debug!(id = %call.id, "verification result names no customer, session stays unverified");
    }
    customer
}
