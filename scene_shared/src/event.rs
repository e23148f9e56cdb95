//! Host event routing.
//!
//! Viewer interactions and session lifecycle changes are forwarded to the
//! hosting application. The scene layer never interprets UI semantics; it
//! only resolves a widget key to the callback identifier stored on it.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{session::SessionId, widget::CallbackId};

/// What the viewer did to a widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UiInput {
    Click,
    SliderValue(f64),
}

/// Event delivered to the hosting application.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    SessionOpened(SessionId),
    SessionClosed(SessionId),
    Callback {
        session: SessionId,
        widget: String,
        callback: CallbackId,
        input: UiInput,
    },
    KeyDown {
        session: SessionId,
        key: String,
    },
    KeyUp {
        session: SessionId,
        key: String,
    },
}

/// Fan-out of host events to any number of subscribers.
#[derive(Default)]
pub struct HostEventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<HostEvent>>>,
}

impl HostEventHub {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HostEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Delivers `event` to every live subscriber, dropping closed ones.
    pub fn emit(&self, event: HostEvent) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_all_and_prunes_dropped() {
        let hub = HostEventHub::default();
        let mut a = hub.subscribe();
        let b = hub.subscribe();
        drop(b);

        hub.emit(HostEvent::SessionOpened(SessionId(7)));
        assert_eq!(a.try_recv().unwrap(), HostEvent::SessionOpened(SessionId(7)));
        assert_eq!(hub.subscriber_count(), 1);
    }
}
