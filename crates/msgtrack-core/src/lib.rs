pub mod clock;
pub mod dedup;
pub mod error;
pub mod normalize;
pub mod reconcile;
pub mod record;
pub mod source;
pub mod status;
pub mod upsert;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{MalformedEventError, ReconcileError, SourceError, StoreError};
pub use normalize::{normalize, RawStatusEvent};
pub use reconcile::{Mutation, ReconcileOutcome, Reconciliation};
pub use record::MessageStatusRecord;
pub use source::{EventSource, ExecutionBatch, SourceFilter};
pub use status::{DeliveryStatus, StatusEvent};
pub use upsert::{StatusStore, UpsertCoordinator, WriteOutcome};
