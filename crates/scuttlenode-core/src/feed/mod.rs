//! Feeds: message model, feed formats and the append-only log rules

pub mod format;
pub mod log;
pub mod message;

pub use format::{ClassicFormat, FeedFormat, Formats, MAX_MESSAGE_SIZE};
pub use log::{AppendOutcome, ContactToSave, Feed, FeedTip};
pub use message::{ContactAction, ContactContent, Content, Message, UnsignedMessage};

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::identity::Identity;
    use chrono::Utc;
    use serde_json::json;

    /// `n` signed messages forming the start of `identity`'s feed.
    pub(crate) fn chain(identity: &Identity, n: u64) -> Vec<Message> {
        let mut feed = Feed::new(identity.public().main_feed());
        for i in 1..=n {
            feed.create_message(json!({"type": "test", "n": i}), Utc::now(), identity, &ClassicFormat)
                .unwrap();
        }
        feed.pop_appended()
    }
}
