//! Chat command parser.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    Start,
    Help,
    Queue,
    Unknown,
}

impl ChatCommand {
    /// Parses a leading `/command` (optionally `/command@botname`).
    /// Returns `None` for ordinary text.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let rest = trimmed.strip_prefix('/')?;
        let word = rest.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default();
        let command = match name.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "queue" | "status" => Self::Queue,
            _ => Self::Unknown,
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(ChatCommand::parse("hello /start"), None);
        assert_eq!(ChatCommand::parse(""), None);
    }

    #[test]
    fn commands_parse_with_bot_suffix_and_arguments() {
        assert_eq!(ChatCommand::parse("/start"), Some(ChatCommand::Start));
        assert_eq!(ChatCommand::parse("  /HELP please"), Some(ChatCommand::Help));
        assert_eq!(ChatCommand::parse("/queue@relay_bot"), Some(ChatCommand::Queue));
        assert_eq!(ChatCommand::parse("/status"), Some(ChatCommand::Queue));
        assert_eq!(ChatCommand::parse("/imagine a cat"), Some(ChatCommand::Unknown));
        assert_eq!(ChatCommand::parse("/"), Some(ChatCommand::Unknown));
    }
}
