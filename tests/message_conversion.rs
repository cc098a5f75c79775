//! Testable property: `convertMessages` never yields an output message with `role="system"` on
//! the OpenAI-style wire path; the lifted system prompt becomes a leading `"developer"` message
//! instead.

use cloudllm::clients::common::convert_messages_openai_style;
use cloudllm::{CompletionMessage, CompletionRequest};
use std::collections::HashMap;

#[test]
fn system_prompt_becomes_a_developer_message_not_a_system_one() {
    let mut request = CompletionRequest::new("gpt-4.1", vec![CompletionMessage::user("Hi")]);
    request.system = Some("be terse".to_string());

    let images = HashMap::new();
    let messages = convert_messages_openai_style(&request, &images);

    assert!(messages.iter().all(|m| m["role"] != "system"));
    assert_eq!(messages[0]["role"], "developer");
    assert_eq!(messages[0]["content"], "be terse");
}

#[test]
fn empty_turns_are_dropped_from_the_wire_message_list() {
    let request = CompletionRequest::new(
        "gpt-4.1",
        vec![CompletionMessage::user("Hi"), CompletionMessage::assistant("")],
    );
    let images = HashMap::new();
    let messages = convert_messages_openai_style(&request, &images);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
}
