use serde::Deserialize;

/// Prefix allow-list for topic registrations.
///
/// Enabled with an empty list denies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TopicAclConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
}

impl TopicAclConfig {
    pub fn allow_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            allowed_prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, filter: &str) -> bool {
        !self.enabled
            || self
                .allowed_prefixes
                .iter()
                .any(|prefix| filter.starts_with(prefix.as_str()))
    }
}
