//! Exchange, queue and binding declarations.

use serde::{Deserialize, Serialize};

/// How an exchange routes messages to bound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExchangeKind {
    /// Routes by matching the routing key against binding patterns.
    #[default]
    Topic,

    /// Routes every message to every bound queue, ignoring the key.
    Fanout,
}

/// Declaration of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    /// A durable fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

/// Declaration of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,

    /// Durable queues keep their messages across broker restarts.
    pub durable: bool,

    /// Number of deliveries after which a requeued message is dead-lettered.
    /// `None` retries forever.
    pub max_deliveries: Option<u32>,

    /// Queue receiving messages that are rejected or exhaust their deliveries.
    pub dead_letter_queue: Option<String>,
}

impl QueueSpec {
    /// A durable queue with unlimited redelivery and no dead-letter queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_deliveries: None,
            dead_letter_queue: None,
        }
    }

    /// Limits how many times a message is delivered before dead-lettering.
    pub fn max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max.max(1));
        self
    }

    /// Routes rejected and exhausted messages to the given queue.
    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(queue.into());
        self
    }

    /// Returns true if a message delivered `attempt` times may be delivered again.
    pub fn allows_redelivery(&self, attempt: u32) -> bool {
        self.max_deliveries.is_none_or(|max| attempt < max)
    }
}

/// Binds a queue to an exchange with a routing-key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            pattern: pattern.into(),
        }
    }

    /// Returns true if a message published with `routing_key` to an exchange
    /// of the given kind should be routed through this binding.
    pub fn routes(&self, kind: ExchangeKind, routing_key: &str) -> bool {
        match kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(&self.pattern, routing_key),
        }
    }
}

/// A set of declarations applied together at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an exchange declaration.
    pub fn exchange(mut self, exchange: ExchangeSpec) -> Self {
        if !self.exchanges.contains(&exchange) {
            self.exchanges.push(exchange);
        }
        self
    }

    /// Adds a queue declaration.
    pub fn queue(mut self, queue: QueueSpec) -> Self {
        if !self.queues.contains(&queue) {
            self.queues.push(queue);
        }
        self
    }

    /// Adds a binding.
    pub fn bind(mut self, binding: BindingSpec) -> Self {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        self
    }

    /// Combines two topologies, dropping duplicate declarations.
    pub fn merge(self, other: Topology) -> Self {
        let merged = other
            .exchanges
            .into_iter()
            .fold(self, |acc, exchange| acc.exchange(exchange));
        let merged = other
            .queues
            .into_iter()
            .fold(merged, |acc, queue| acc.queue(queue));
        other
            .bindings
            .into_iter()
            .fold(merged, |acc, binding| acc.bind(binding))
    }
}

/// Matches a routing key against an AMQP topic pattern.
///
/// Both are `.`-separated words. `*` matches exactly one word and `#`
/// matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => match key.split_first() {
            Some((_, key_rest)) => match_words(rest, key_rest),
            None => false,
        },
        Some((word, rest)) => match key.split_first() {
            Some((first, key_rest)) => first == word && match_words(rest, key_rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_same_key() {
        assert!(topic_matches("user.created", "user.created"));
        assert!(!topic_matches("user.created", "user.creation.failed"));
        assert!(!topic_matches("user.created", "user"));
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user.creation.failed"));
        assert!(!topic_matches("user.*", "user"));
        assert!(topic_matches("*.created", "user.created"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("user.#", "user.created"));
        assert!(topic_matches("user.#", "user.creation.failed"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.failed", "user.creation.failed"));
        assert!(!topic_matches("#.failed", "user.created"));
    }

    #[test]
    fn fanout_binding_ignores_key() {
        let binding = BindingSpec::new("q", "x", "ignored");
        assert!(binding.routes(ExchangeKind::Fanout, "user.created"));
        assert!(!binding.routes(ExchangeKind::Topic, "user.created"));
    }

    #[test]
    fn queue_redelivery_limit() {
        let unlimited = QueueSpec::durable("q");
        assert!(unlimited.allows_redelivery(1_000));

        let limited = QueueSpec::durable("q").max_deliveries(3);
        assert!(limited.allows_redelivery(1));
        assert!(limited.allows_redelivery(2));
        assert!(!limited.allows_redelivery(3));
    }

    #[test]
    fn topology_merge_drops_duplicates() {
        let a = Topology::new()
            .exchange(ExchangeSpec::topic("user.exchange"))
            .queue(QueueSpec::durable("a"));
        let b = Topology::new()
            .exchange(ExchangeSpec::topic("user.exchange"))
            .queue(QueueSpec::durable("b"))
            .bind(BindingSpec::new("b", "user.exchange", "user.created"));

        let merged = a.merge(b);
        assert_eq!(merged.exchanges.len(), 1);
        assert_eq!(merged.queues.len(), 2);
        assert_eq!(merged.bindings.len(), 1);
    }
}
