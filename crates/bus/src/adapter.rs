//! Bridges a broker subscription to a typed packet channel.
//!
//! One task per subscription drains the queue in FIFO order and forwards
//! each message as a [`TransportPacket`] with a blocking send, so pub/sub
//! backpressure is preserved end to end and nothing is ever dropped.

use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::Subscription;
use crate::message::TransportPacket;

/// Adapter channel depth. Small on purpose: real buffering lives in the
/// broker's subscriber queues.
const ADAPTER_BUF: usize = 8;

/// Spawn the forwarding task and return the consumer-side packet channel.
/// The channel closes when the subscription's queue closes.
pub fn spawn_adapter(mut subscription: Subscription) -> mpsc::Receiver<TransportPacket> {
    let (tx, rx) = mpsc::channel(ADAPTER_BUF);
    let topic = subscription.topic.clone();
    let subscriber = subscription.subscriber_id.clone();

    tokio::spawn(async move {
        while let Some(msg) = subscription.recv().await {
            if tx.send(TransportPacket::from(msg)).await.is_err() {
                // Consumer dropped its receiver; stop forwarding.
                break;
            }
        }
        debug!(topic, subscriber, "adapter closed");
    });

    rx
}
