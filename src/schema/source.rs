//! Event retrieval boundary
//!
//! The engine never fetches data itself. It asks an [`EventSource`] for the
//! rows of a time window and consumes them batch by batch.

use crate::error::SourceError;
use crate::schema::event_row::EventRow;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// What the engine needs from the event store for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Inclusive lower bound
    pub from: DateTime<Utc>,
    /// Inclusive upper bound
    pub to: DateTime<Utc>,
    /// Event names of interest; `None` means any event.
    pub events: Option<BTreeSet<String>>,
    /// External tables of interest; `None` means no tables.
    pub tables: Option<BTreeSet<String>>,
}

impl EventQuery {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            events: None,
            tables: None,
        }
    }

    /// Whether a row falls inside this query (window and name hints)
    pub fn admits(&self, row: &EventRow) -> bool {
        if row.timestamp < self.from || row.timestamp > self.to {
            return false;
        }
        match &row.table {
            Some(table) => self
                .tables
                .as_ref()
                .map(|tables| tables.contains(table))
                .unwrap_or(false),
            None => self
                .events
                .as_ref()
                .map(|events| events.contains(&row.event))
                .unwrap_or(true),
        }
    }
}

/// A batching cursor over the event store
pub trait EventSource {
    /// Stream every row matching `query` to `on_batch`, at most `batch_size`
    /// rows per call. Row order is not guaranteed.
    fn fetch(
        &self,
        query: &EventQuery,
        batch_size: usize,
        on_batch: &mut dyn FnMut(Vec<EventRow>),
    ) -> Result<(), SourceError>;
}

/// Event source backed by rows held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSource {
    rows: Vec<EventRow>,
    failure: Option<SourceError>,
}

impl InMemoryEventSource {
    pub fn new(rows: Vec<EventRow>) -> Self {
        Self {
            rows,
            failure: None,
        }
    }

    /// Make every fetch fail with `error`
    pub fn failing(error: SourceError) -> Self {
        Self {
            rows: Vec::new(),
            failure: Some(error),
        }
    }

    pub fn push(&mut self, row: EventRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl EventSource for InMemoryEventSource {
    fn fetch(
        &self,
        query: &EventQuery,
        batch_size: usize,
        on_batch: &mut dyn FnMut(Vec<EventRow>),
    ) -> Result<(), SourceError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        let batch_size = batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size.min(self.rows.len()));
        for row in self.rows.iter().filter(|r| query.admits(r)) {
            batch.push(row.clone());
            if batch.len() == batch_size {
                on_batch(std::mem::take(&mut batch));
            }
        }
        if !batch.is_empty() {
            on_batch(batch);
        }
        Ok(())
    }
}

/// Drain a source into a vector
pub fn collect_rows(
    source: &dyn EventSource,
    query: &EventQuery,
    batch_size: usize,
) -> Result<Vec<EventRow>, SourceError> {
    let mut rows = Vec::new();
    source.fetch(query, batch_size, &mut |batch| rows.extend(batch))?;
    Ok(rows)
}
