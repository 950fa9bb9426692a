// Outbound notification event: target channel class + text.

use serde::{Deserialize, Serialize};

/// Logical chat channel a notification is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelClass {
    Daily,
    Hourly,
    Error,
    Status,
    Worker,
}

impl std::fmt::Display for ChannelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelClass::Daily => write!(f, "daily"),
            ChannelClass::Hourly => write!(f, "hourly"),
            ChannelClass::Error => write!(f, "error"),
            ChannelClass::Status => write!(f, "status"),
            ChannelClass::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: ChannelClass,
    pub text: String,
}

impl Notification {
    pub fn new(channel: ChannelClass, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: text.into(),
        }
    }
}
