use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use crate::domain::VisibilityEvent;

const EVENT_CAPACITY: usize = 16;

/// Host window visibility. Every `set` call emits, including repeats; the
/// lock manager treats a second `Hide` as a re-arm.
pub struct Visibility {
    visible: AtomicBool,
    events: broadcast::Sender<VisibilityEvent>,
}

impl Visibility {
    pub fn new(initial: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            visible: AtomicBool::new(initial),
            events,
        }
    }

    pub fn set(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
        let event = if visible {
            VisibilityEvent::Show
        } else {
            VisibilityEvent::Hide
        };
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VisibilityEvent> {
        self.events.subscribe()
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Self::new(true)
    }
}
