/// The fixed set of per-user setting keys. Values are stored as strings;
/// absent keys fall back to defaults at the point of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    ChatModel,
    Provider,
    Temperature,
    MemoryEnabled,
    AutoMemoryEnabled,
    SystemPrompt,
    CustomInstructions,
    ProviderApiKey,
    SearchApiKey,
    ChatMode,
}

impl SettingKey {
    pub const ALL: [SettingKey; 10] = [
        SettingKey::ChatModel,
        SettingKey::Provider,
        SettingKey::Temperature,
        SettingKey::MemoryEnabled,
        SettingKey::AutoMemoryEnabled,
        SettingKey::SystemPrompt,
        SettingKey::CustomInstructions,
        SettingKey::ProviderApiKey,
        SettingKey::SearchApiKey,
        SettingKey::ChatMode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::ChatModel => "chat_model",
            SettingKey::Provider => "provider",
            SettingKey::Temperature => "temperature",
            SettingKey::MemoryEnabled => "memory_enabled",
            SettingKey::AutoMemoryEnabled => "auto_memory_enabled",
            SettingKey::SystemPrompt => "system_prompt",
            SettingKey::CustomInstructions => "custom_instructions",
            SettingKey::ProviderApiKey => "provider_api_key",
            SettingKey::SearchApiKey => "search_api_key",
            SettingKey::ChatMode => "chat_mode",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == raw)
    }

    /// Secret keys are never returned to callers in cleartext, only as an
    /// "is set" flag.
    pub fn is_secret(self) -> bool {
        matches!(self, SettingKey::ProviderApiKey | SettingKey::SearchApiKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_key() {
        for key in SettingKey::ALL {
            assert_eq!(SettingKey::parse(key.as_str()), Some(key));
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert_eq!(SettingKey::parse("favorite_color"), None);
    }

    #[test]
    fn only_api_keys_are_secret() {
        let secret: Vec<_> = SettingKey::ALL.into_iter().filter(|k| k.is_secret()).collect();
        assert_eq!(
            secret,
            vec![SettingKey::ProviderApiKey, SettingKey::SearchApiKey]
        );
    }
}
