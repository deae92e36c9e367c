use crate::clock::Clock;
use crate::error::{ReconcileError, StoreError};
use crate::reconcile::{reconcile, Mutation, ReconcileContext, Reconciliation};
use crate::record::MessageStatusRecord;
use crate::status::{DeliveryStatus, StatusEvent};
use tracing::{debug, warn};

/// Conflicting writes are retried this many times before a message is
/// deferred to the next pass.
pub const MAX_CONFLICT_RETRIES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Another writer got there first: the insert found an existing record,
    /// the patch guard no longer matched, or the touched record is gone.
    Conflict,
}

/// Document store keyed by message id.
///
/// `write` must apply each mutation atomically:
/// - `Insert` only when no record with that message id exists,
/// - `Patch` only while the stored `status_count` equals
///   `expected_status_count`,
/// - `Touch` never moves `last_scanned_at` backwards.
pub trait StatusStore {
    fn find(&self, message_id: &str) -> Result<Option<MessageStatusRecord>, StoreError>;
    fn write(&self, mutation: &Mutation) -> Result<WriteOutcome, StoreError>;
    fn by_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageStatusRecord>, StoreError>;
    fn by_latest_status(
        &self,
        status: &DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<MessageStatusRecord>, StoreError>;
    fn recent(&self, limit: usize) -> Result<Vec<MessageStatusRecord>, StoreError>;
}

/// Issues the one write per message and absorbs lost races with a fresh
/// reconciliation against whatever the winner stored.
pub struct UpsertCoordinator<'a, S: StatusStore + ?Sized> {
    store: &'a S,
    clock: &'a dyn Clock,
    workflow_id: String,
}

impl<'a, S: StatusStore + ?Sized> UpsertCoordinator<'a, S> {
    pub fn new(store: &'a S, clock: &'a dyn Clock, workflow_id: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            workflow_id: workflow_id.into(),
        }
    }

    /// Reconciles one message. `Ok(None)` means the batch was empty and
    /// nothing was written.
    pub fn reconcile_message(
        &self,
        message_id: &str,
        batch: &[StatusEvent],
    ) -> Result<Option<Reconciliation>, ReconcileError> {
        if let Some(foreign) = batch.iter().find(|event| event.message_id != message_id) {
            return Err(ReconcileError::ForeignEvent {
                expected: message_id.to_string(),
                found: foreign.message_id.clone(),
            });
        }

        for attempt in 0..=MAX_CONFLICT_RETRIES {
            let existing = self.store.find(message_id)?;
            let ctx = self.context();
            let Some(reconciliation) = reconcile(existing.as_ref(), batch, &ctx) else {
                return Ok(None);
            };

            match self.store.write(&reconciliation.mutation)? {
                WriteOutcome::Applied => {
                    debug!(
                        event = "message_reconciled",
                        message_id,
                        outcome = %reconciliation.outcome,
                        novel_events = reconciliation.novel_events,
                        status_count = reconciliation.record.status_count,
                        attempt
                    );
                    return Ok(Some(reconciliation));
                }
                WriteOutcome::Conflict => {
                    warn!(
                        event = "upsert_conflict",
                        message_id,
                        attempted = %reconciliation.outcome,
                        attempt
                    );
                }
            }
        }

        Err(ReconcileError::Contended {
            message_id: message_id.to_string(),
        })
    }

    fn context(&self) -> ReconcileContext {
        ReconcileContext {
            now: self.clock.local_now(),
            zone: self.clock.zone(),
            workflow_id: self.workflow_id.clone(),
        }
    }
}
