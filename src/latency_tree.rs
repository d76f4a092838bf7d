//! Hierarchical value reduction
//!
//! Trace events (LLM generations, spans, tool calls) form a parent/child
//! tree where a container often reports a value that already includes its
//! children. A node is counted iff it carries a value and no ancestor in its
//! parent chain carries one. Value-less nodes are transparent.
//!
//! Nodes are stored in a vector and indexed by span id once per trace; the
//! ancestor walk works on indices only.

use crate::metric::TraceSpec;
use crate::schema::EventRow;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One event in a trace
#[derive(Debug, Clone, PartialEq)]
pub struct EventNode {
    pub event_id: String,
    /// Id other nodes can reference as parent; absent means always a leaf
    pub own_span_id: Option<String>,
    /// Trace id or another node's span id
    pub parent_ref: Option<String>,
    pub value: Option<f64>,
}

impl EventNode {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            own_span_id: None,
            parent_ref: None,
            value: None,
        }
    }

    pub fn span(mut self, span_id: impl Into<String>) -> Self {
        self.own_span_id = Some(span_id.into());
        self
    }

    pub fn parent(mut self, parent_ref: impl Into<String>) -> Self {
        self.parent_ref = Some(parent_ref.into());
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Build a node from a row; ids are normalised to strings here
    pub fn from_row(row: &EventRow, spec: &TraceSpec, value: Option<f64>) -> Self {
        let id = |key: &str| {
            row.property(key)
                .and_then(|v| v.to_key_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            event_id: row.uuid.to_string(),
            own_span_id: id(&spec.span_id_property),
            parent_ref: id(&spec.parent_id_property),
            value,
        }
    }
}

/// All nodes of one trace
#[derive(Debug, Clone)]
pub struct TraceTree {
    trace_id: String,
    nodes: Vec<EventNode>,
    index: HashMap<String, usize>,
}

impl TraceTree {
    pub fn new(trace_id: impl Into<String>, nodes: Vec<EventNode>) -> Self {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if let Some(span) = &node.own_span_id {
                // first occurrence wins
                index.entry(span.clone()).or_insert(i);
            }
        }
        Self {
            trace_id: trace_id.into(),
            nodes,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn parent_index(&self, i: usize) -> Option<usize> {
        let parent = self.nodes[i].parent_ref.as_deref()?;
        if parent == self.trace_id {
            return None;
        }
        self.index.get(parent).copied().filter(|&p| p != i)
    }

    /// `covered[i]` is true when node `i` or one of its ancestors has a value
    fn covered(&self) -> Vec<bool> {
        let mut memo: Vec<Option<bool>> = vec![None; self.nodes.len()];

        for start in 0..self.nodes.len() {
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            let mut current = Some(start);

            let result = loop {
                let Some(i) = current else { break false };
                if let Some(known) = memo[i] {
                    break known;
                }
                if !on_path.insert(i) {
                    // cycle with no valued node on it
                    break false;
                }
                path.push(i);
                if self.nodes[i].value.is_some() {
                    break true;
                }
                current = self.parent_index(i);
            };

            for i in path {
                memo[i] = Some(result);
            }
        }

        memo.into_iter().map(|m| m.unwrap_or(false)).collect()
    }

    /// Indices of the nodes that are counted
    pub fn contributing(&self) -> Vec<usize> {
        let covered = self.covered();
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].value.is_some())
            .filter(|&i| !self.parent_index(i).is_some_and(|p| covered[p]))
            .collect()
    }

    /// Sum of contributing values
    pub fn reduce(&self) -> f64 {
        self.contributing()
            .into_iter()
            .filter_map(|i| self.nodes[i].value)
            .sum()
    }
}

/// Collapse a subject's trace rows into one total.
///
/// Rows are grouped by trace id and each trace is reduced on its own. A row
/// without a trace id is a trace of its own.
pub fn reduce_traces<F>(rows: &[&EventRow], spec: &TraceSpec, value_of: F) -> f64
where
    F: Fn(&EventRow) -> Option<f64>,
{
    let mut traces: BTreeMap<String, Vec<EventNode>> = BTreeMap::new();
    let mut orphans = 0.0;

    for &row in rows {
        let node = EventNode::from_row(row, spec, value_of(row));
        match row
            .property(&spec.trace_id_property)
            .and_then(|v| v.to_key_string())
            .filter(|s| !s.is_empty())
        {
            Some(trace_id) => traces.entry(trace_id).or_default().push(node),
            None => orphans += node.value.unwrap_or(0.0),
        }
    }

    let traced: f64 = traces
        .into_iter()
        .map(|(trace_id, nodes)| TraceTree::new(trace_id, nodes).reduce())
        .sum();
    traced + orphans
}
