//! Failure domains and the queue names derived from them.
//!
//! Queue names are read by external dead-letter tooling, so their format
//! must not change.

use std::fmt;

use serde::{Deserialize, Serialize};

const SEPARATOR: &str = "||";

/// The consumer or producer a retry queue belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureDomain {
    /// A message consumer, identified by topic and consumer group.
    Consumer {
        topic: String,
        consumer_group: String,
    },
    /// A message producer, identified by name.
    Producer { producer: String },
}

impl FailureDomain {
    pub fn consumer(topic: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self::Consumer {
            topic: topic.into(),
            consumer_group: consumer_group.into(),
        }
    }

    pub fn producer(producer: impl Into<String>) -> Self {
        Self::Producer {
            producer: producer.into(),
        }
    }

    /// Name of the retry queue for this domain.
    pub fn queue_name(&self) -> String {
        match self {
            Self::Consumer {
                topic,
                consumer_group,
            } => consumer_queue_name(topic, consumer_group),
            Self::Producer { producer } => producer_queue_name(producer),
        }
    }
}

impl fmt::Display for FailureDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumer {
                topic,
                consumer_group,
            } => write!(f, "consumer {}/{}", topic, consumer_group),
            Self::Producer { producer } => write!(f, "producer {}", producer),
        }
    }
}

/// `retry||consumer||{topic}||{consumer_group}`
pub fn consumer_queue_name(topic: &str, consumer_group: &str) -> String {
    ["retry", "consumer", topic, consumer_group].join(SEPARATOR)
}

/// `retry||producer||{producer}`
pub fn producer_queue_name(producer: &str) -> String {
    ["retry", "producer", producer].join(SEPARATOR)
}
