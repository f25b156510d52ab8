//! Prompt helpers for the single-message endpoint.

use chatrelay_core::Message;

/// System prompt used by `POST /simple` when the caller supplies none.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, respectful and honest assistant. \
Always answer as helpfully as possible, while being safe. Your answers should not include any \
harmful, unethical, racist, sexist, toxic, dangerous, or illegal content. Please ensure that your \
responses are socially unbiased and positive in nature.

If a question is not clear or factually coherent, explain why instead of answering something not \
correct. If you don't know the answer to a question, please don't share false information.";

/// Build `[system, ...history, user]`.
pub fn create_chat_messages(
    user_message: &str,
    system_prompt: &str,
    history: &[Message],
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system_prompt));
    messages.extend_from_slice(history);
    messages.push(Message::user(user_message));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_history_between_system_and_user() {
        let history = vec![Message::user("earlier"), Message::assistant("reply")];
        let messages = create_chat_messages("now", "be brief", &history);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::system("be brief"));
        assert_eq!(messages[1..3], history[..]);
        assert_eq!(messages[3], Message::user("now"));
    }

    #[test]
    fn without_history_yields_two_messages() {
        let messages = create_chat_messages("hi", DEFAULT_SYSTEM_PROMPT, &[]);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.starts_with("You are a helpful"));
    }
}
