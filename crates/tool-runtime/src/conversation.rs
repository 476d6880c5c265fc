use crate::tool::ToolCall;
use serde::{Deserialize, Serialize};

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversationMessage {
    System(String),
    /// User's text input
    User(String),
    /// Assistant's response (may contain text and/or tool calls)
    Assistant(AssistantContent),
    /// Tool-role message carrying the result of one call
    ToolResult(ToolResultMessage),
}

/// Content from the assistant that can contain mixed text and tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantContent {
    pub text: Option<String>,
    /// Tool calls declared by the assistant
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Ordered message log for one turn.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
    system_prompt: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from caller-supplied history. A leading system message becomes
    /// the system prompt.
    pub fn from_messages(messages: Vec<ConversationMessage>) -> Self {
        let mut conversation = Self::new();
        for message in messages {
            match message {
                ConversationMessage::System(prompt) if conversation.messages.is_empty() => {
                    conversation.system_prompt = Some(prompt);
                }
                other => conversation.messages.push(other),
            }
        }
        conversation
    }

    pub fn with_system_prompt(mut self, prompt: String) -> Self {
        self.system_prompt = Some(prompt);
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn add_user_message(&mut self, text: String) {
        self.messages.push(ConversationMessage::User(text));
    }

    pub fn add_assistant_response(&mut self, content: AssistantContent) {
        self.messages.push(ConversationMessage::Assistant(content));
    }

    pub fn add_tool_result(&mut self, result: ToolResultMessage) {
        self.messages.push(ConversationMessage::ToolResult(result));
    }

    /// Attach a tool-call declaration to the most recent assistant message,
    /// creating an empty assistant message if the log does not end with one.
    /// A call already declared by the most recent assistant message is left
    /// alone, even when tool results have been appended after it.
    pub fn declare_tool_call(&mut self, call: &ToolCall) {
        let already_declared = self
            .messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ConversationMessage::Assistant(content) => Some(content),
                _ => None,
            })
            .is_some_and(|content| content.tool_calls.iter().any(|c| c.id == call.id));
        if already_declared {
            return;
        }
        if let Some(content) = self.last_assistant_mut() {
            content.tool_calls.push(call.clone());
            return;
        }
        self.add_assistant_response(AssistantContent {
            text: None,
            tool_calls: vec![call.clone()],
        });
    }

    /// Append text to the most recent assistant message, creating one if needed.
    pub fn append_assistant_text(&mut self, text: &str) {
        if let Some(content) = self.last_assistant_mut() {
            match &mut content.text {
                Some(existing) => {
                    if !existing.is_empty() {
                        existing.push('\n');
                    }
                    existing.push_str(text);
                }
                None => content.text = Some(text.to_string()),
            }
            return;
        }
        self.add_assistant_response(AssistantContent {
            text: Some(text.to_string()),
            tool_calls: Vec::new(),
        });
    }

    fn last_assistant_mut(&mut self) -> Option<&mut AssistantContent> {
        match self.messages.last_mut() {
            Some(ConversationMessage::Assistant(content)) => Some(content),
            _ => None,
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "fs_search".to_string(),
            input: serde_json::json!({"query": "todo"}),
        }
    }

    #[test]
    fn test_conversation_basic() {
        let mut conv = Conversation::new();
        conv.add_user_message("Hello".to_string());
        conv.add_assistant_response(AssistantContent {
            text: Some("Hi there!".to_string()),
            tool_calls: vec![],
        });

        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn leading_system_message_becomes_prompt() {
        let conv = Conversation::from_messages(vec![
            ConversationMessage::System("be terse".to_string()),
            ConversationMessage::User("hi".to_string()),
        ]);
        assert_eq!(conv.system_prompt(), Some("be terse"));
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn declaration_attaches_to_last_assistant_once() {
        let mut conv = Conversation::new();
        conv.add_user_message("find todos".to_string());
        conv.add_assistant_response(AssistantContent {
            text: Some("Searching".to_string()),
            tool_calls: vec![call("c1")],
        });
        conv.declare_tool_call(&call("c1"));
        conv.declare_tool_call(&call("c2"));

        assert_eq!(conv.len(), 2);
        match &conv.messages()[1] {
            ConversationMessage::Assistant(content) => {
                let ids: Vec<_> = content.tool_calls.iter().map(|c| c.id.as_str()).collect();
                assert_eq!(ids, vec!["c1", "c2"]);
            }
            other => panic!("expected assistant message, got {other:?}"),
        }
    }

    #[test]
    fn declaration_after_tool_result_opens_new_assistant_message() {
        let mut conv = Conversation::new();
        conv.declare_tool_call(&call("c1"));
        conv.add_tool_result(ToolResultMessage {
            tool_call_id: "c1".to_string(),
            content: "ok".to_string(),
            is_error: false,
        });
        conv.declare_tool_call(&call("c2"));
        assert_eq!(conv.len(), 3);
    }

    #[test]
    fn declared_call_is_not_redeclared_after_results() {
        let mut conv = Conversation::new();
        conv.add_assistant_response(AssistantContent {
            text: None,
            tool_calls: vec![call("c1"), call("c2")],
        });
        conv.declare_tool_call(&call("c1"));
        conv.add_tool_result(ToolResultMessage {
            tool_call_id: "c1".to_string(),
            content: "ok".to_string(),
            is_error: false,
        });
        conv.declare_tool_call(&call("c2"));
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn assistant_text_is_appended_in_place() {
        let mut conv = Conversation::new();
        conv.append_assistant_text("first");
        conv.append_assistant_text("second");
        assert_eq!(
            conv.messages(),
            &[ConversationMessage::Assistant(AssistantContent {
                text: Some("first\nsecond".to_string()),
                tool_calls: vec![],
            })]
        );
    }
}
