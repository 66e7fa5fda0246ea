pub mod adapter;
pub mod broker;
pub mod error;
pub mod events;
pub mod message;
pub mod topic;

pub use adapter::spawn_adapter;
pub use broker::{Broker, Subscription, DEFAULT_CACHE_SIZE, DEFAULT_CONSUMER_BUF};
pub use error::BusError;
pub use events::{
    DispatchMode, EventKind, EventMeta, EventResponse, EventSubscriber, ExecutionControl,
    RuntimeEvent, SubscriptionSystem,
};
pub use message::{BusMessage, TransportPacket};
pub use topic::topic_for_labels;
