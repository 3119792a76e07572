use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

use crate::protocol::SyncMessage;

/// Posts `message` to the controller queue after `delay`.
///
/// The queue is held weakly so pending timers never keep a dropped
/// controller alive.
pub(crate) fn post_after(
    bus: &WeakUnboundedSender<SyncMessage>,
    delay: Duration,
    message: SyncMessage,
) -> JoinHandle<()> {
    let bus = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(bus) = bus.upgrade() {
            let _ = bus.send(message);
        }
    })
}
