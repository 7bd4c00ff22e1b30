// Registry-change notifications for external observers

use tokio::sync::mpsc;

/// A change to the set of live sessions.
///
/// Delivered to an external observer (an admin console, typically) over a
/// bounded one-way queue. The observer is advisory: if it falls behind, events
/// are dropped rather than blocking the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ClientConnected { identity: String },
    ClientDisconnected { identity: String },
}

/// Sending side of the registry-event queue.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<RegistryEvent>,
}

/// Create the event queue with the given capacity.
pub fn channel(capacity: usize) -> (EventQueue, mpsc::Receiver<RegistryEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventQueue { tx }, rx)
}

impl EventQueue {
    /// Best-effort publish; never blocks the event loop.
    pub fn publish(&self, event: RegistryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(?event, "observer queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_delivered_in_order() {
        let (queue, mut rx) = channel(4);

        queue.publish(RegistryEvent::ClientConnected {
            identity: "alice".into(),
        });
        queue.publish(RegistryEvent::ClientDisconnected {
            identity: "alice".into(),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::ClientConnected {
                identity: "alice".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::ClientDisconnected {
                identity: "alice".into()
            }
        );
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (queue, mut rx) = channel(1);

        queue.publish(RegistryEvent::ClientConnected {
            identity: "alice".into(),
        });
        // Queue is full; this one is dropped.
        queue.publish(RegistryEvent::ClientConnected {
            identity: "bob".into(),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            RegistryEvent::ClientConnected {
                identity: "alice".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receiver_is_not_an_error() {
        let (queue, rx) = channel(1);
        drop(rx);

        queue.publish(RegistryEvent::ClientConnected {
            identity: "alice".into(),
        });
    }
}
