//! Interaction event log.

use common::protocol::{LogEvent, LogResponse};
use common::ServiceError;
use fieldcrypt::{FieldCipher, RecordStore, Table};
use tracing::debug;

use super::{encode, store_error};

/// Append an event. `userEmail` is stored encrypted.
pub async fn record_event(
    store: &dyn RecordStore,
    cipher: &FieldCipher,
    event: LogEvent,
) -> Result<LogResponse, ServiceError> {
    if event.event_type.trim().is_empty() {
        return Err(ServiceError::BadRequest("eventType must not be empty".into()));
    }
    let record = encode(cipher, Table::Log, &event)?;
    let row = store.insert(Table::Log, record).await.map_err(store_error)?;
    debug!(id = row.id, event_type = %event.event_type, "event logged");
    Ok(LogResponse { id: row.id })
}
