use crate::conversation::{ContentBlock, Role, ToolCallRequest, Turn};
use crate::error::{AgentError, Result};
use crate::llm::{Brain, BrainRequest};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// OpenAI-compatible chat-completions client with tool calling.
#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, request: &BrainRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for turn in &request.turns {
            messages.extend(turn_to_messages(turn));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        });

        // Newer model families only accept max_completion_tokens
        if self.model.starts_with("gpt-5") || self.model.contains("o1") || self.model.starts_with("gpt-4") {
            body["max_completion_tokens"] = json!(request.max_tokens);
        } else {
            body["max_tokens"] = json!(request.max_tokens);
        }

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

fn turn_to_messages(turn: &Turn) -> Vec<Value> {
    match turn.role {
        Role::User => vec![json!({"role": "user", "content": turn.text()})],
        Role::Model => {
            let text = turn.text();
            let calls: Vec<Value> = turn
                .tool_calls()
                .into_iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.input.to_string(),
                        }
                    })
                })
                .collect();
            let mut msg = json!({"role": "assistant"});
            msg["content"] = if text.is_empty() { Value::Null } else { json!(text) };
            if !calls.is_empty() {
                msg["tool_calls"] = json!(calls);
            }
            vec![msg]
        }
        // one "tool" message per result, in the order the results were collected
        Role::ToolResult => turn
            .tool_results_iter()
            .map(|result| {
                json!({
                    "role": "tool",
                    "tool_call_id": result.id,
                    "content": result.to_model_json().to_string(),
                })
            })
            .collect(),
    }
}

fn parse_message(message: &Value) -> Result<Turn> {
    let mut content = Vec::new();

    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.trim().is_empty() {
            content.push(ContentBlock::Text { text: text.to_string() });
        }
    }

    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for call in calls {
            let id = call["id"]
                .as_str()
                .ok_or_else(|| AgentError::LlmResponse("tool call without id".to_string()))?
                .to_string();
            let name = call["function"]["name"]
                .as_str()
                .ok_or_else(|| AgentError::LlmResponse("tool call without function name".to_string()))?
                .to_string();
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            // malformed arguments are kept verbatim so input validation reports them to the model
            let input = serde_json::from_str(raw_args).unwrap_or_else(|_| Value::String(raw_args.to_string()));
            content.push(ContentBlock::ToolCallRequest(ToolCallRequest { id, name, input }));
        }
    }

    Ok(Turn {
        role: Role::Model,
        content,
    })
}

#[async_trait]
impl Brain for LlmClient {
    async fn converse(&self, request: &BrainRequest) -> Result<Turn> {
        let body = self.build_body(request);
        debug!("Calling {} with {} turns", self.model, request.turns.len());

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            let msg = format!("LLM API error ({}): {}", status, error_text);
            // throttling and server faults are worth another attempt, the rest are not
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(AgentError::Llm(msg))
            } else {
                Err(AgentError::LlmResponse(msg))
            };
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(AgentError::LlmResponse(format!("LLM API error: {}", error)));
        }

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| AgentError::LlmResponse("No choices in LLM response".to_string()))?;

        match choice.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(AgentError::LlmResponse(
                    "LLM response was filtered by content policy".to_string(),
                ))
            }
            _ => {}
        }

        parse_message(&choice["message"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ToolResult;
    use crate::llm::ToolSpec;

    #[test]
    fn test_parse_message_with_tool_calls() {
        let message = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [
                {"id": "call_a", "type": "function", "function": {"name": "get_schema", "arguments": "{\"include_counts\": true}"}},
                {"id": "call_b", "type": "function", "function": {"name": "sample_rows", "arguments": "not json"}}
            ]
        });
        let turn = parse_message(&message).unwrap();
        let calls = turn.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].input["include_counts"], true);
        assert_eq!(calls[1].input, Value::String("not json".to_string()));
    }

    #[test]
    fn test_body_maps_tool_result_turns() {
        let client = LlmClient::new("k".to_string(), "gpt-4o".to_string(), "http://localhost/v1/".to_string());
        let model_turn = Turn {
            role: Role::Model,
            content: vec![ContentBlock::ToolCallRequest(ToolCallRequest {
                id: "c1".to_string(),
                name: "get_schema".to_string(),
                input: json!({}),
            })],
        };
        let request = BrainRequest::new(vec![
            Turn::user("list tables"),
            model_turn,
            Turn::tool_results(vec![ToolResult::payload("c1", json!({"tables": {}}))]),
        ])
        .with_system("be careful")
        .with_tools(vec![ToolSpec {
            name: "get_schema".to_string(),
            description: "schema".to_string(),
            input_schema: json!({"type": "object"}),
        }]);

        let body = client.build_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "c1");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "c1");
        assert_eq!(body["tools"][0]["function"]["name"], "get_schema");
        assert_eq!(client.base_url, "http://localhost/v1");
    }
}
