//! Collaborators that record calls in memory.
//!
//! Used by the command-line driver and by tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{
    CollaboratorError, Notification, Notifier, QualityCheckPayload, QualityCheckSink,
};
use crate::procedure::StepNumber;
use crate::recorder::ExecutionId;

/// Keeps every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        self.sent
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("notifier lock poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

/// A recorded quality check.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityCheckCall {
    pub execution_id: ExecutionId,
    pub step_number: StepNumber,
    pub payload: QualityCheckPayload,
}

/// Accepts quality checks and keeps them. Can be told to fail the next
/// calls.
#[derive(Debug, Default)]
pub struct RecordingQualityChecks {
    calls: Mutex<Vec<QualityCheckCall>>,
    superseded: Mutex<Vec<QualityCheckCall>>,
    fail_next: AtomicUsize,
}

impl RecordingQualityChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the next `n` calls as unavailable.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<QualityCheckCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Checks reported as superseded by a concurrent submission.
    pub fn superseded(&self) -> Vec<QualityCheckCall> {
        self.superseded.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl QualityCheckSink for RecordingQualityChecks {
    fn record_quality_check(
        &self,
        execution_id: &ExecutionId,
        step_number: StepNumber,
        payload: &QualityCheckPayload,
    ) -> Result<(), CollaboratorError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CollaboratorError::Unavailable(
                "quality system offline".to_string(),
            ));
        }

        self.calls
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("quality lock poisoned".to_string()))?
            .push(QualityCheckCall {
                execution_id: *execution_id,
                step_number,
                payload: payload.clone(),
            });
        Ok(())
    }

    fn quality_check_superseded(
        &self,
        execution_id: &ExecutionId,
        step_number: StepNumber,
        payload: &QualityCheckPayload,
    ) -> Result<(), CollaboratorError> {
        self.superseded
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("quality lock poisoned".to_string()))?
            .push(QualityCheckCall {
                execution_id: *execution_id,
                step_number,
                payload: payload.clone(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> QualityCheckPayload {
        QualityCheckPayload {
            procedure_id: "p".to_string(),
            step_title: "Check seal".to_string(),
            value: Some(json!("intact")),
            is_deviation: false,
            operator_id: "op".to_string(),
            acceptable_range: None,
            expected_last: Some(0),
        }
    }

    #[test]
    fn test_fail_next() {
        let sink = RecordingQualityChecks::new();
        let id = ExecutionId::new();
        sink.fail_next(2);

        assert!(sink.record_quality_check(&id, 1, &payload()).is_err());
        assert!(sink.record_quality_check(&id, 1, &payload()).is_err());
        assert!(sink.record_quality_check(&id, 1, &payload()).is_ok());
        assert_eq!(sink.calls().len(), 1);
        assert!(sink.superseded().is_empty());
    }

    #[test]
    fn test_superseded_checks_are_kept_apart() {
        let sink = RecordingQualityChecks::new();
        let id = ExecutionId::new();
        sink.record_quality_check(&id, 3, &payload()).unwrap();
        sink.quality_check_superseded(&id, 3, &payload()).unwrap();

        assert_eq!(sink.calls().len(), 1);
        let superseded = sink.superseded();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].step_number, 3);
        assert_eq!(superseded[0].payload.expected_last, Some(0));
    }

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        let id = ExecutionId::new();
        notifier
            .notify(&Notification::ExecutionFailed {
                execution_id: id,
                procedure_id: "p".to_string(),
                declared_outcome: crate::engine::state::Outcome::Success,
                reasons: vec!["step 2 missing".to_string()],
            })
            .unwrap();
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].execution_id(), &id);
    }

    #[test]
    fn test_notification_is_tagged() {
        let value = serde_json::to_value(Notification::ExecutionFailed {
            execution_id: ExecutionId::new(),
            procedure_id: "p".to_string(),
            declared_outcome: crate::engine::state::Outcome::Conditional,
            reasons: Vec::new(),
        })
        .unwrap();
        assert_eq!(value["kind"], json!("execution_failed"));
        assert_eq!(value["declared_outcome"], json!("conditional"));
    }
}
