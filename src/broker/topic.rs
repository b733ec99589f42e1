use std::collections::HashMap;

use crate::protocol::QoS;
use crate::utils::{Error, Result};

pub type SubscriberId = String;

/// Reports whether a published `topic` is selected by a subscription `filter`.
///
/// Levels are separated by `/`. A `#` level matches the rest of the topic,
/// including nothing at all; `+` matches exactly one level. Without
/// wildcards both sides must have the same number of levels.
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Rejects filters a broker would refuse: empty filters, `#` anywhere but the
/// last level, and wildcards sharing a level with other characters.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopicFilter("empty filter".to_string()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        let wildcard = level.contains('#') || level.contains('+');
        if wildcard && level.len() > 1 {
            return Err(Error::InvalidTopicFilter(format!(
                "{filter}: wildcard must occupy a whole level"
            )));
        }
        if *level == "#" && i != last {
            return Err(Error::InvalidTopicFilter(format!(
                "{filter}: '#' must be the last level"
            )));
        }
    }
    Ok(())
}

/// A subscription filter and the clients subscribed through it, with the
/// QoS each of them asked for.
#[derive(Debug, Default)]
pub struct Topic {
    pub filter: String,
    pub subscribers: HashMap<SubscriberId, QoS>,
}

impl Topic {
    pub fn new(filter: &str) -> Self {
        Self {
            filter: filter.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Adds a subscriber; subscribing again only updates its QoS.
    pub fn subscribe(&mut self, id: SubscriberId, qos: QoS) {
        self.subscribers.insert(id, qos);
    }

    pub fn unsubscribe(&mut self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }

    pub fn matches(&self, topic: &str) -> bool {
        matches(topic, &self.filter)
    }
}
