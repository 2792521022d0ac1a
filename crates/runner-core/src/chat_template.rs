//! Chat-template formatting and stop-condition matching.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplateKind {
    /// `<|user|>\n{content}\n<|assistant|>\n` style, one block per turn.
    ChatMl,
    /// `[INST] {content} [/INST]` wrapping, no role tags.
    Instruction,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Renders `messages` into a single prompt string. Only invoked when the
/// caller's generation options set `use_chat_template`; callers who pass
/// raw prompts bypass this entirely.
pub fn render(messages: &[ChatMessage], kind: ChatTemplateKind) -> String {
    match kind {
        ChatTemplateKind::ChatMl => {
            let mut out = String::new();
            for m in messages {
                out.push_str("<|");
                out.push_str(&m.role);
                out.push_str("|>\n");
                out.push_str(&m.content);
                out.push('\n');
            }
            out.push_str("<|assistant|>\n");
            out
        }
        ChatTemplateKind::Instruction => {
            let mut out = String::new();
            for m in messages {
                if m.role == "system" {
                    out.push_str(&m.content);
                    out.push('\n');
                } else {
                    out.push_str("[INST] ");
                    out.push_str(&m.content);
                    out.push_str(" [/INST]");
                }
            }
            out
        }
    }
}

/// Checks whether `generated_suffix` (text produced since the last check)
/// ends with one of `stop_sequences`, returning the matching sequence.
pub fn matches_stop_sequence<'a>(generated_suffix: &str, stop_sequences: &'a [String]) -> Option<&'a str> {
    stop_sequences.iter().find(|s| !s.is_empty() && generated_suffix.ends_with(s.as_str())).map(|s| s.as_str())
}

pub fn is_stop_token(token_id: u32, stop_token_ids: &[u32]) -> bool {
    stop_token_ids.contains(&token_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatml_wraps_each_turn_and_appends_assistant_tag() {
        let messages = vec![
            ChatMessage { role: "system".into(), content: "be terse".into() },
            ChatMessage { role: "user".into(), content: "hi".into() },
        ];
        let rendered = render(&messages, ChatTemplateKind::ChatMl);
        assert!(rendered.ends_with("<|assistant|>\n"));
        assert!(rendered.contains("<|system|>\nbe terse"));
    }

    #[test]
    fn instruction_template_skips_role_tag_for_system() {
        let messages = vec![
            ChatMessage { role: "system".into(), content: "be terse".into() },
            ChatMessage { role: "user".into(), content: "hi".into() },
        ];
        let rendered = render(&messages, ChatTemplateKind::Instruction);
        assert!(rendered.starts_with("be terse\n[INST] hi [/INST]"));
    }

    #[test]
    fn stop_sequence_matches_suffix_only() {
        let stops = vec!["</s>".to_string(), "STOP".to_string()];
        assert_eq!(matches_stop_sequence("hello</s>", &stops), Some("</s>"));
        assert_eq!(matches_stop_sequence("hello", &stops), None);
    }

    #[test]
    fn empty_stop_sequence_never_matches() {
        let stops = vec![String::new()];
        assert_eq!(matches_stop_sequence("anything", &stops), None);
    }

    #[test]
    fn stop_token_lookup() {
        assert!(is_stop_token(2, &[0, 2, 5]));
        assert!(!is_stop_token(3, &[0, 2, 5]));
    }
}
