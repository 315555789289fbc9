// OpenAI-compatible chat completions (OpenRouter, ollama, ...).

use super::{ModelReply, ModelRequest, arguments_object, orphan_text, orphaned_results, result_content};
use crate::catalog::{OperationSpec, SchemaDialect};
use crate::error::{Error, Result};
use crate::session::{Role, ToolInvocationRequest, TurnContent};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

pub(super) fn request_body(model: &str, max_tokens: u32, request: &ModelRequest<'_>) -> Value {
    let orphaned = orphaned_results(request.turns);
    let mut messages = vec![json!({ "role": "system", "content": request.system })];

    for (turn, orphan) in request.turns.iter().zip(orphaned) {
        messages.push(match &turn.content {
            TurnContent::Text(text) => {
                let role = if turn.role == Role::Assistant { "assistant" } else { "user" };
                json!({ "role": role, "content": text })
            }
            TurnContent::ToolCalls(calls) => {
                let tool_calls: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.operation_name,
                                "arguments": arguments_object(&c.arguments).to_string(),
                            }
                        })
                    })
                    .collect();
                json!({ "role": "assistant", "content": null, "tool_calls": tool_calls })
            }
            TurnContent::ToolResult(result) if orphan => {
                json!({ "role": "user", "content": orphan_text(result) })
            }
            TurnContent::ToolResult(result) => json!({
                "role": "tool",
                "tool_call_id": result.id,
                "content": result_content(result).to_string(),
            }),
        });
    }

    json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
        "tools": declarations(request.tools),
    })
}

pub(super) fn declarations(tools: &[OperationSpec]) -> Value {
    tools
        .iter()
        .map(|spec| {
            json!({
                "type": "function",
                "function": {
                    "name": spec.name(),
                    "description": spec.description,
                    "parameters": spec.parameter_schema(SchemaDialect::JsonSchema),
                }
            })
        })
        .collect()
}

pub(super) fn parse_reply(body: &str) -> Result<ModelReply> {
    let resp: OpenAiResponse = serde_json::from_str(body)
        .map_err(|e| Error::parse(format!("parse LLM response: {e}")))?;
    let message = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| Error::parse("empty response from LLM"))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|tc| ToolInvocationRequest {
            id: tc.id,
            operation_name: tc.function.name,
            // Unparseable arguments are passed through as a string so local
            // validation rejects them and the model can retry.
            arguments: if tc.function.arguments.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(Value::String(tc.function.arguments))
            },
        })
        .collect();

    Ok(ModelReply {
        text: message.content.unwrap_or_default(),
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::session::{ConversationTurn, FailureKind, ToolInvocationResult};

    #[test]
    fn tool_messages_follow_calls() {
        let call = ToolInvocationRequest {
            id: "tc_1".into(),
            operation_name: "verify_customer_pin".into(),
            arguments: json!({"email": "x@example.com", "pin": "0000"}),
        };
        let turns = vec![
            ConversationTurn::user("verify me"),
            ConversationTurn::tool_calls(vec![call.clone()]),
            ConversationTurn::tool_result(ToolInvocationResult::failure(
                &call,
                FailureKind::Application,
                Some(-32000),
                "Invalid PIN",
            )),
        ];
        let request = ModelRequest {
            system: "sys",
            turns: &turns,
            tools: catalog::list_operations(),
        };
        let body = request_body("gpt", 100, &request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "tc_1");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "tc_1");
        assert!(messages[3]["content"].as_str().unwrap().contains("Invalid PIN"));
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn parses_tool_calls_including_bad_arguments() {
        let body = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"a","type":"function","function":{"name":"get_order","arguments":"{\"order_id\":\"o-1\"}"}},
            {"id":"b","type":"function","function":{"name":"get_order","arguments":"{order_id: o-1"}}
        ]}}]}"#;
        let reply = parse_reply(body).unwrap();
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].arguments["order_id"], "o-1");
        assert!(reply.tool_calls[1].arguments.is_string());

        let text = r#"{"choices":[{"message":{"content":"No matches found."}}]}"#;
        let reply = parse_reply(text).unwrap();
        assert_eq!(reply.text, "No matches found.");
        assert!(reply.tool_calls.is_empty());

        assert!(parse_reply(r#"{"choices":[]}"#).is_err());
    }
}
