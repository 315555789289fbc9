//! Conversation state owned by one chat session.
//!
//! A [`SessionState`] holds the append-only history and the optional verified
//! customer. Nothing here is global; the caller owns the value and hands it to
//! the orchestrator one turn at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A call the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    /// Pairs the request with its result; provider-issued or synthesized.
    pub id: String,
    pub operation_name: String,
    pub arguments: Value,
}

/// Outcome of one requested call, fed back to the model verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub id: String,
    pub operation_name: String,
    pub success: bool,
    pub payload: Value,
}

/// Why a tool result carries `success = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected locally before any network call.
    Validation,
    /// The backend understood the call and said no.
    Application,
}

impl ToolInvocationResult {
    pub fn success(request: &ToolInvocationRequest, payload: Value) -> Self {
        Self {
            id: request.id.clone(),
            operation_name: request.operation_name.clone(),
            success: true,
            payload,
        }
    }

    pub fn failure(
        request: &ToolInvocationRequest,
        kind: FailureKind,
        code: Option<i64>,
        message: impl Into<String>,
    ) -> Self {
        let mut error = json!({ "kind": kind, "message": message.into() });
        if let Some(code) = code {
            error["code"] = json!(code);
        }
        Self {
            id: request.id.clone(),
            operation_name: request.operation_name.clone(),
            success: false,
            payload: json!({ "error": error }),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        if self.success {
            return None;
        }
        serde_json::from_value(self.payload["error"]["kind"].clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    ToolCalls(Vec<ToolInvocationRequest>),
    ToolResult(ToolInvocationResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: TurnContent,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn tool_calls(calls: Vec<ToolInvocationRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::ToolCalls(calls),
        }
    }

    pub fn tool_result(result: ToolInvocationResult) -> Self {
        Self {
            role: Role::Tool,
            content: TurnContent::ToolResult(result),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// Identity established by a successful PIN check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerContext {
    pub customer_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub is_verified: bool,
    /// Whatever the backend returned, kept for the system instructions.
    pub profile: Value,
    pub verified_at: DateTime<Utc>,
}

impl CustomerContext {
    /// Build from a successful verification result.
    ///
    /// Accepts a JSON object (`customer_id`/`id`, `name`, `email`) or the
    /// backend's line-oriented text (`Customer ID: ...`). The email from the
    /// request is the fallback when the payload does not repeat it.
    ///
    /// Returns `None` when the payload names no customer: a text rejection
    /// such as "Invalid email or PIN" is not a verification.
    pub fn from_verification(payload: &Value, requested_email: Option<&str>) -> Option<Self> {
        let field = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| payload.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };

        let (customer_id, name, email) = match payload {
            Value::Object(_) => (
                field(&["customer_id", "id"]),
                field(&["name", "full_name"]),
                field(&["email"]),
            ),
            Value::String(text) => (
                labelled_line(text, "Customer ID"),
                labelled_line(text, "Name"),
                labelled_line(text, "Email"),
            ),
            _ => (None, None, None),
        };
        let customer_id = customer_id.filter(|id| !id.trim().is_empty())?;

        Some(Self {
            customer_id: Some(customer_id),
            name,
            email: email.or_else(|| requested_email.map(str::to_string)),
            is_verified: true,
            profile: payload.clone(),
            verified_at: Utc::now(),
        })
    }
}

fn labelled_line(text: &str, label: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim().trim_start_matches(['-', '*', ' ']);
        (key.eq_ignore_ascii_case(label) && !value.trim().is_empty())
            .then(|| value.trim().to_string())
    })
}

/// Everything one conversation owns.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    history: Vec<ConversationTurn>,
    customer: Option<CustomerContext>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn customer(&self) -> Option<&CustomerContext> {
        self.customer.as_ref()
    }

    pub fn is_verified(&self) -> bool {
        self.customer.as_ref().is_some_and(|c| c.is_verified)
    }

    /// Forget the verified customer; history is kept.
    pub fn logout(&mut self) {
        self.customer = None;
    }

    /// Start over: drop history and the verified customer.
    pub fn clear(&mut self) {
        self.history.clear();
        self.customer = None;
    }

    /// Apply a finished turn. Only the orchestrator calls this.
    pub(crate) fn commit(
        &mut self,
        turns: Vec<ConversationTurn>,
        customer: Option<CustomerContext>,
    ) {
        self.history.extend(turns);
        if let Some(customer) = customer {
            self.customer = Some(customer);
        }
    }
}

/// The most recent `n` entries of `history`, in original order.
pub fn window(history: &[ConversationTurn], n: usize) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(n)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ToolInvocationRequest {
        ToolInvocationRequest {
            id: "call_1".into(),
            operation_name: "verify_customer_pin".into(),
            arguments: json!({"email": "x@example.com", "pin": "1234"}),
        }
    }

    #[test]
    fn window_keeps_most_recent_in_order() {
        let history: Vec<_> = (0..10).map(|i| ConversationTurn::user(i.to_string())).collect();
        let recent = window(&history, 6);
        let texts: Vec<_> = recent.iter().filter_map(|t| t.text()).collect();
        assert_eq!(texts, ["4", "5", "6", "7", "8", "9"]);
        assert_eq!(window(&history[..3], 6).len(), 3);
    }

    #[test]
    fn failure_payload_shape() {
        let result =
            ToolInvocationResult::failure(&request(), FailureKind::Application, Some(-32001), "Invalid PIN");
        assert!(!result.success);
        assert_eq!(result.payload["error"]["message"], "Invalid PIN");
        assert_eq!(result.payload["error"]["code"], -32001);
        assert_eq!(result.failure_kind(), Some(FailureKind::Application));
        assert_eq!(ToolInvocationResult::success(&request(), json!([])).failure_kind(), None);
    }

    #[test]
    fn customer_from_text_payload() {
        let text = "Customer verified.\nCustomer ID: 7f3c-11\nName: Laura Henderson\nEmail: laura@example.org";
        let ctx =
            CustomerContext::from_verification(&json!(text), Some("other@example.org")).unwrap();
        assert_eq!(ctx.customer_id.as_deref(), Some("7f3c-11"));
        assert_eq!(ctx.name.as_deref(), Some("Laura Henderson"));
        assert_eq!(ctx.email.as_deref(), Some("laura@example.org"));
        assert!(ctx.is_verified);
    }

    #[test]
    fn customer_from_object_payload_falls_back_to_requested_email() {
        let ctx = CustomerContext::from_verification(
            &json!({"id": "c-9", "name": "Glee"}),
            Some("glee@example.net"),
        )
        .unwrap();
        assert_eq!(ctx.customer_id.as_deref(), Some("c-9"));
        assert_eq!(ctx.email.as_deref(), Some("glee@example.net"));
    }

    #[test]
    fn payload_without_identity_is_not_a_verification() {
        let email = Some("x@example.com");
        assert!(CustomerContext::from_verification(&json!("Invalid email or PIN"), email).is_none());
        assert!(CustomerContext::from_verification(&json!("Customer ID:   \nName: X"), email).is_none());
        assert!(CustomerContext::from_verification(&json!({"name": "Glee"}), email).is_none());
        assert!(CustomerContext::from_verification(&json!({}), email).is_none());
        assert!(CustomerContext::from_verification(&json!(true), email).is_none());
    }

    #[test]
    fn logout_and_clear() {
        let mut session = SessionState::new();
        assert!(!session.is_verified());
        session.commit(
            vec![ConversationTurn::user("hi"), ConversationTurn::assistant("hello")],
            CustomerContext::from_verification(&json!({"id": "c"}), None),
        );
        assert!(session.is_verified());

        session.logout();
        assert!(!session.is_verified());
        assert_eq!(session.history().len(), 2);

        session.commit(vec![], CustomerContext::from_verification(&json!({"id": "c"}), None));
        session.clear();
        assert!(session.history().is_empty());
        assert!(session.customer().is_none());
    }
}
