// Gemini generateContent: functionDeclarations out, functionCall parts back.

use super::{
    ModelReply, ModelRequest, OMITTED_OPENER, arguments_object, merge_same_role, next_call_id,
    open_with_user, orphan_text, orphaned_results, result_content,
};
use crate::catalog::{OperationSpec, SchemaDialect};
use crate::error::{Error, Result};
use crate::session::{Role, ToolInvocationRequest, TurnContent};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::AtomicU64;

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

pub(super) fn request_body(max_tokens: u32, request: &ModelRequest<'_>) -> Value {
    let orphaned = orphaned_results(request.turns);
    let mut contents: Vec<Value> = request
        .turns
        .iter()
        .zip(orphaned)
        .map(|(turn, orphan)| match &turn.content {
            TurnContent::Text(text) => {
                let role = if turn.role == Role::Assistant { "model" } else { "user" };
                json!({ "role": role, "parts": [{ "text": text }] })
            }
            TurnContent::ToolCalls(calls) => {
                let parts: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({ "functionCall": {
                            "name": c.operation_name,
                            "args": arguments_object(&c.arguments),
                        }})
                    })
                    .collect();
                json!({ "role": "model", "parts": parts })
            }
            TurnContent::ToolResult(result) if orphan => {
                json!({ "role": "user", "parts": [{ "text": orphan_text(result) }] })
            }
            TurnContent::ToolResult(result) => json!({
                "role": "user",
                "parts": [{ "functionResponse": {
                    "name": result.operation_name,
                    "response": result_content(result),
                }}]
            }),
        })
        .collect();

    // A functionCall turn must follow a user or functionResponse turn.
    open_with_user(
        &mut contents,
        "model",
        json!({ "role": "user", "parts": [{ "text": OMITTED_OPENER }] }),
    );

    json!({
        "systemInstruction": { "parts": [{ "text": request.system }] },
        "contents": merge_same_role(contents, "parts"),
        "tools": declarations(request.tools),
        "generationConfig": { "maxOutputTokens": max_tokens },
    })
}

pub(super) fn declarations(tools: &[OperationSpec]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name(),
                "description": spec.description,
                "parameters": spec.parameter_schema(SchemaDialect::Gemini),
            })
        })
        .collect();
    json!([{ "functionDeclarations": declarations }])
}

pub(super) fn parse_reply(body: &str, call_seq: &AtomicU64) -> Result<ModelReply> {
    let resp: GeminiResponse = serde_json::from_str(body)
        .map_err(|e| Error::parse(format!("parse Gemini response: {e}")))?;

    let mut reply = ModelReply::default();
    let parts = resp
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    for part in parts {
        if let Some(text) = part.text {
            reply.text.push_str(&text);
        }
        if let Some(call) = part.function_call {
            reply.tool_calls.push(ToolInvocationRequest {
                id: next_call_id(call_seq),
                operation_name: call.name,
                arguments: call.args,
            });
        }
    }
    Ok(reply)
}
