use thiserror::Error;

/// Errors raised by the in-process messaging layer.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker is closed")]
    Closed,

    #[error("subscriber queue closed for {subscriber} on topic {topic}")]
    SubscriberGone { topic: String, subscriber: String },

    #[error("not subscribed: {subscriber} on topic {topic}")]
    NotSubscribed { topic: String, subscriber: String },
}
