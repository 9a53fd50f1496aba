use std::sync::Arc;

use crate::classifier::Classification;
use crate::intake::{Action, ClientMeta};
use crate::store::{ActivityStore, EventId, NewActivityEvent, StoreError};
use crate::telemetry::NotificationSink;

/// Result of one [`ActivityRecorder::record`] call.
#[derive(Debug)]
pub struct RecordAttempt {
    /// Action label the event was stored under.
    pub label: String,
    pub anomalous: bool,
    pub result: Result<EventId, StoreError>,
}

/// Turns one classified submission into one persisted [`ActivityEvent`].
///
/// [`ActivityEvent`]: crate::store::ActivityEvent
#[derive(Clone)]
pub struct ActivityRecorder {
    store: Arc<dyn ActivityStore>,
    notifier: NotificationSink,
}

impl ActivityRecorder {
    pub fn new(store: Arc<dyn ActivityStore>, notifier: NotificationSink) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<dyn ActivityStore> {
        &self.store
    }

    pub fn notifier(&self) -> &NotificationSink {
        &self.notifier
    }

    /// Persist exactly one event. Anomalous submissions are stored under
    /// the `_length_attack` label and announced on the notification channel
    /// first. Store errors are returned as-is, without retry.
    pub async fn record(
        &self,
        action: &Action,
        classification: Classification,
        meta: &ClientMeta,
    ) -> RecordAttempt {
        let anomalous = classification.is_anomalous();
        let label = action.event_label(anomalous);
        if anomalous {
            self.notifier.notify_anomaly(
                &label,
                meta.ip.as_deref(),
                meta.user_agent.as_deref(),
                classification.data(),
            );
        }

        let event = NewActivityEvent::new(
            label.clone(),
            classification.into_data(),
            meta.ip.clone(),
            meta.user_agent.clone(),
        );
        let result = self.store.insert(event).await;
        RecordAttempt {
            label,
            anomalous,
            result,
        }
    }
}
