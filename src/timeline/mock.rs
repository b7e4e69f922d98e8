//! Mock timeline publisher for testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{PublishError, Result, TimelineEvent, TimelineKind, TimelinePublisher};

/// Records published events in order.
#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<TimelineEvent>>,
    fail_on_publish: AtomicBool,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<TimelineEvent> {
        self.events().clone()
    }

    pub fn kinds(&self) -> Vec<TimelineKind> {
        self.events().iter().map(TimelineEvent::kind).collect()
    }

    pub fn take_published(&self) -> Vec<TimelineEvent> {
        std::mem::take(&mut *self.events())
    }

    fn events(&self) -> std::sync::MutexGuard<'_, Vec<TimelineEvent>> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl TimelinePublisher for MockPublisher {
    fn publish(&self, event: TimelineEvent) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(PublishError::Send("Mock publish failure".to_string()));
        }
        self.events().push(event);
        Ok(())
    }
}
