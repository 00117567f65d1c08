use crate::store::QueryStore;
use fairlog_core::config::MAX_UNBATCHED_WINDOW;
use fairlog_core::error::Result;
use fairlog_core::record::{NewQuery, QueryRecord};
use std::sync::Arc;

/// Front door of the query log: numbers incoming queries and hands out the
/// unbatched backlog.
#[derive(Clone)]
pub struct Sequencer {
    store: Arc<dyn QueryStore>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn QueryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn QueryStore> {
        &self.store
    }

    pub fn append(&self, query: NewQuery) -> Result<QueryRecord> {
        let record = self.store.append(query)?;
        tracing::debug!(model_id = record.model_id, seq_num = record.seq_num, "query sequenced");
        Ok(record)
    }

    /// `None` means the default cap.
    pub fn unbatched(&self, model_id: u32, limit: Option<usize>) -> Result<Vec<QueryRecord>> {
        self.store
            .unbatched(model_id, limit.unwrap_or(MAX_UNBATCHED_WINDOW))
    }
}
