use std::collections::BTreeMap;

const PING: &str = "/ping";
const HELP: &str = "/help";

/// Fixed command table, consulted before any AI involvement.
#[derive(Debug, Clone, Default)]
pub struct ShortcutTable {
    /// Lowercased trigger → canned response.
    commands: BTreeMap<String, String>,
}

impl ShortcutTable {
    /// Built-ins plus configured `trigger → response` pairs. Configured
    /// entries override built-ins of the same name.
    pub fn new<'a>(configured: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut commands = BTreeMap::new();
        commands.insert(PING.to_string(), "pong".to_string());
        for (trigger, response) in configured {
            let trigger = trigger.trim().to_lowercase();
            if !trigger.is_empty() {
                commands.insert(trigger, response.clone());
            }
        }
        Self { commands }
    }

    /// Response for `text` when its first token is a known command.
    pub fn lookup(&self, text: &str) -> Option<(String, String)> {
        let token = text.split_whitespace().next()?.to_lowercase();
        if let Some(response) = self.commands.get(&token) {
            return Some((token, response.clone()));
        }
        if token == HELP {
            return Some((token, self.help()));
        }
        None
    }

    fn help(&self) -> String {
        let mut names: Vec<&str> = self.commands.keys().map(|k| k.as_str()).collect();
        names.push(HELP);
        names.sort_unstable();
        format!("Available commands: {}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn table() -> ShortcutTable {
        let mut configured = HashMap::new();
        configured.insert("/Status".to_string(), "all systems nominal".to_string());
        configured.insert("oncall".to_string(), "Dana is on call".to_string());
        ShortcutTable::new(&configured)
    }

    #[test]
    fn test_first_token_case_insensitive() {
        let t = table();
        assert_eq!(t.lookup("/STATUS please").unwrap().1, "all systems nominal");
        assert_eq!(t.lookup("OnCall?").map(|(c, _)| c), None);
        assert_eq!(t.lookup("oncall now").unwrap().1, "Dana is on call");
        assert_eq!(t.lookup("/ping").unwrap().1, "pong");
        assert!(t.lookup("what is /ping").is_none());
        assert!(t.lookup("").is_none());
    }

    #[test]
    fn test_help_lists_commands() {
        let (_, help) = table().lookup("/help").unwrap();
        assert_eq!(help, "Available commands: /help, /ping, /status, oncall");
    }
}
