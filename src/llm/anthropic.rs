// Anthropic Messages API: tool_use blocks out, tool_result blocks back.

use super::{
    ModelReply, ModelRequest, OMITTED_OPENER, arguments_object, merge_same_role, open_with_user,
    orphan_text, orphaned_results, result_content,
};
use crate::catalog::{OperationSpec, SchemaDialect};
use crate::error::{Error, Result};
use crate::session::{Role, ToolInvocationRequest, TurnContent};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

pub(super) fn request_body(model: &str, max_tokens: u32, request: &ModelRequest<'_>) -> Value {
    let orphaned = orphaned_results(request.turns);
    let mut messages: Vec<Value> = request
        .turns
        .iter()
        .zip(orphaned)
        .map(|(turn, orphan)| match &turn.content {
            TurnContent::Text(text) => {
                let role = if turn.role == Role::Assistant { "assistant" } else { "user" };
                json!({ "role": role, "content": [{ "type": "text", "text": text }] })
            }
            TurnContent::ToolCalls(calls) => {
                let blocks: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "type": "tool_use",
                            "id": c.id,
                            "name": c.operation_name,
                            "input": arguments_object(&c.arguments),
                        })
                    })
                    .collect();
                json!({ "role": "assistant", "content": blocks })
            }
            TurnContent::ToolResult(result) if orphan => json!({
                "role": "user",
                "content": [{ "type": "text", "text": orphan_text(result) }]
            }),
            TurnContent::ToolResult(result) => json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": result.id,
                    "content": result_content(result).to_string(),
                    "is_error": !result.success,
                }]
            }),
        })
        .collect();

    open_with_user(
        &mut messages,
        "assistant",
        json!({ "role": "user", "content": [{ "type": "text", "text": OMITTED_OPENER }] }),
    );

    json!({
        "model": model,
        "max_tokens": max_tokens,
        "system": request.system,
        "messages": merge_same_role(messages, "content"),
        "tools": declarations(request.tools),
    })
}

pub(super) fn declarations(tools: &[OperationSpec]) -> Value {
    tools
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name(),
                "description": spec.description,
                "input_schema": spec.parameter_schema(SchemaDialect::JsonSchema),
            })
        })
        .collect()
}

pub(super) fn parse_reply(body: &str) -> Result<ModelReply> {
    let resp: AnthropicResponse = serde_json::from_str(body)
        .map_err(|e| Error::parse(format!("parse Anthropic response: {e}")))?;

    let mut reply = ModelReply::default();
    for block in resp.content {
        match block {
            AnthropicBlock::Text { text } => {
                if !reply.text.is_empty() {
                    reply.text.push('\n');
                }
                reply.text.push_str(&text);
            }
            AnthropicBlock::ToolUse { id, name, input } => {
                reply.tool_calls.push(ToolInvocationRequest {
                    id,
                    operation_name: name,
                    arguments: input,
                });
            }
            AnthropicBlock::Other => {}
        }
    }
    Ok(reply)
}
