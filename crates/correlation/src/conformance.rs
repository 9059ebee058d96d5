//! Multi-path routing conformance.
//!
//! Emitted telemetry leaves the process and passes through relays (a
//! collector, a pipeline worker, an agent) before it lands in a store. Each
//! signal kind may take a different path. Relays are free to enrich, filter,
//! or sample, but a relay that forwards a record must forward its trace and
//! span ids untouched.
//!
//! This module models that fan-out with [`Hop`]s, [`RelayPath`]s and a
//! [`Topology`], and provides checks that a set of landed records is still
//! correlatable with what the emitter produced.
//!
//! # Dropped parents
//!
//! When a relay samples out a span but keeps its descendants, the trace tree
//! becomes partially connected. [`TraceTree`] reports each such gap as a
//! [`BrokenEdge`] and never re-parents the orphan. If the emitted spans are
//! available, the edge names the nearest ancestor that did survive, as
//! diagnostic information only.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::{
    attributes::AttributeValue,
    ids::{SpanId, TraceId},
    record::{Level, LogRecord, Metric, Signal, SignalKind, SpanRecord},
};

/// One relay between the emitter and a store.
pub trait Hop: Send + Sync {
    /// Inspect, transform, or drop (`None`) a signal.
    fn forward(&self, signal: Signal) -> Option<Signal>;
}

/// Adds an attribute to spans and a field to log records.
#[derive(Debug, Clone)]
pub struct Enrich {
    key: String,
    value: AttributeValue,
}

impl Enrich {
    pub fn new(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Hop for Enrich {
    fn forward(&self, signal: Signal) -> Option<Signal> {
        Some(match signal {
            Signal::Log(mut log) => {
                log.insert_field(self.key.clone(), self.value.clone());
                Signal::Log(log)
            }
            Signal::Span(mut span) => {
                span.attributes.insert(self.key.clone(), self.value.clone());
                Signal::Span(span)
            }
            other => other,
        })
    }
}

/// Drops log records below a severity threshold.
#[derive(Debug, Clone, Copy)]
pub struct DropLevelsBelow(pub Level);

impl Hop for DropLevelsBelow {
    fn forward(&self, signal: Signal) -> Option<Signal> {
        match signal {
            Signal::Log(log) if log.level < self.0 => None,
            other => Some(other),
        }
    }
}

/// Keeps only the spans for which the predicate holds.
pub struct SampleSpans<F> {
    keep: F,
}

impl<F> SampleSpans<F>
where
    F: Fn(&SpanRecord) -> bool + Send + Sync,
{
    pub fn new(keep: F) -> Self {
        Self { keep }
    }
}

impl<F> Hop for SampleSpans<F>
where
    F: Fn(&SpanRecord) -> bool + Send + Sync,
{
    fn forward(&self, signal: Signal) -> Option<Signal> {
        match signal {
            Signal::Span(span) if !(self.keep)(&span) => None,
            other => Some(other),
        }
    }
}

/// Arbitrary transformation; models relays that do not honour the contract.
pub struct Rewrite<F>(pub F);

impl<F> Hop for Rewrite<F>
where
    F: Fn(Signal) -> Option<Signal> + Send + Sync,
{
    fn forward(&self, signal: Signal) -> Option<Signal> {
        (self.0)(signal)
    }
}

/// Ordered relays one signal kind passes through.
#[derive(Default)]
pub struct RelayPath {
    hops: Vec<Box<dyn Hop>>,
}

impl RelayPath {
    /// A path with no relays: emitter straight to store.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn then(mut self, hop: impl Hop + 'static) -> Self {
        self.hops.push(Box::new(hop));
        self
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Pass `signal` through every hop; `None` if any hop dropped it.
    pub fn deliver(&self, signal: Signal) -> Option<Signal> {
        self.hops.iter().try_fold(signal, |s, hop| hop.forward(s))
    }
}

/// Independent relay paths per signal kind.
#[derive(Default)]
pub struct Topology {
    pub logs: RelayPath,
    pub spans: RelayPath,
    pub metrics: RelayPath,
}

impl Topology {
    /// Route every emitted signal along its kind's path and collect what lands.
    pub fn deliver(&self, emitted: &[Signal]) -> Landed {
        let mut landed = Landed::default();
        for signal in emitted {
            let path = match signal.kind() {
                SignalKind::Log => &self.logs,
                SignalKind::Span => &self.spans,
                SignalKind::Metric => &self.metrics,
            };
            match path.deliver(signal.clone()) {
                Some(Signal::Log(l)) => landed.logs.push(l),
                Some(Signal::Span(s)) => landed.spans.push(s),
                Some(Signal::Metric(m)) => landed.metrics.push(m),
                None => {}
            }
        }
        landed
    }
}

/// Contents of the correlated stores: log index, trace store, metric store.
#[derive(Debug, Clone, Default)]
pub struct Landed {
    pub logs: Vec<LogRecord>,
    pub spans: Vec<SpanRecord>,
    pub metrics: Vec<Metric>,
}

/// A broken correlation guarantee.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// A landed record matches no emitted record with the same identifiers.
    IdentifierRewritten {
        kind: SignalKind,
        trace_id: Option<TraceId>,
        span_id: Option<SpanId>,
    },
    /// A record carries a different trace id than the span it belongs to.
    MixedTrace {
        span_id: SpanId,
        expected: TraceId,
        found: Option<TraceId>,
    },
    /// A child span is not contained in its parent's time range.
    ContainmentBroken { parent: SpanId, child: SpanId },
    /// A unit of work produced the wrong number of log records.
    LogCount {
        trace_id: TraceId,
        expected: usize,
        found: usize,
    },
}

/// Every landed log and span must match an emitted record with identical ids.
///
/// Records are matched on their immutable content (timestamps, level and
/// message for logs; name and time range for spans) since relays may change
/// attributes.
pub fn check_identifiers_preserved(emitted: &[Signal], landed: &Landed) -> Vec<Violation> {
    type LogKey<'a> = (DateTime<Utc>, Level, &'a str);
    type SpanKey<'a> = (&'a str, DateTime<Utc>, DateTime<Utc>);

    let mut log_ids: HashMap<LogKey<'_>, Vec<(Option<TraceId>, Option<SpanId>)>> = HashMap::new();
    let mut span_ids: HashMap<SpanKey<'_>, Vec<(TraceId, SpanId, Option<SpanId>)>> = HashMap::new();
    for signal in emitted {
        match signal {
            Signal::Log(l) => log_ids
                .entry((l.timestamp, l.level, l.message.as_str()))
                .or_default()
                .push((l.trace_id, l.span_id)),
            Signal::Span(s) => span_ids
                .entry((s.name.as_str(), s.start, s.end))
                .or_default()
                .push((s.trace_id, s.span_id, s.parent_span_id)),
            Signal::Metric(_) => {}
        }
    }

    let mut violations = Vec::new();
    for l in &landed.logs {
        let ok = log_ids
            .get(&(l.timestamp, l.level, l.message.as_str()))
            .is_some_and(|c| c.contains(&(l.trace_id, l.span_id)));
        if !ok {
            violations.push(Violation::IdentifierRewritten {
                kind: SignalKind::Log,
                trace_id: l.trace_id,
                span_id: l.span_id,
            });
        }
    }
    for s in &landed.spans {
        let ok = span_ids
            .get(&(s.name.as_str(), s.start, s.end))
            .is_some_and(|c| c.contains(&(s.trace_id, s.span_id, s.parent_span_id)));
        if !ok {
            violations.push(Violation::IdentifierRewritten {
                kind: SignalKind::Span,
                trace_id: Some(s.trace_id),
                span_id: Some(s.span_id),
            });
        }
    }
    violations
}

/// Every span shares its local parent's trace id, and every log shares the
/// trace id of the span it names.
pub fn check_trace_consistency(spans: &[SpanRecord], logs: &[LogRecord]) -> Vec<Violation> {
    let trace_of: HashMap<SpanId, TraceId> = spans.iter().map(|s| (s.span_id, s.trace_id)).collect();
    let mut violations = Vec::new();

    for s in spans.iter().filter(|s| !s.is_local_root()) {
        if let Some(&expected) = s.parent_span_id.and_then(|p| trace_of.get(&p)) {
            if expected != s.trace_id {
                violations.push(Violation::MixedTrace {
                    span_id: s.span_id,
                    expected,
                    found: Some(s.trace_id),
                });
            }
        }
    }
    for l in logs {
        if let Some(span_id) = l.span_id {
            if let Some(&expected) = trace_of.get(&span_id) {
                if l.trace_id != Some(expected) {
                    violations.push(Violation::MixedTrace {
                        span_id,
                        expected,
                        found: l.trace_id,
                    });
                }
            }
        }
    }
    violations
}

/// Each span with a local parent lies within the parent's time range.
pub fn check_temporal_containment(spans: &[SpanRecord]) -> Vec<Violation> {
    let by_id: HashMap<SpanId, &SpanRecord> = spans.iter().map(|s| (s.span_id, s)).collect();
    spans
        .iter()
        .filter(|s| !s.is_local_root())
        .filter_map(|child| {
            let parent = by_id.get(&child.parent_span_id?)?;
            let contained = parent.start <= child.start && parent.end >= child.end;
            (!contained).then_some(Violation::ContainmentBroken {
                parent: parent.span_id,
                child: child.span_id,
            })
        })
        .collect()
}

/// The unit of work `trace_id` produced exactly `expected` log records.
pub fn check_log_count(logs: &[LogRecord], trace_id: TraceId, expected: usize) -> Option<Violation> {
    let found = logs.iter().filter(|l| l.trace_id == Some(trace_id)).count();
    (found != expected).then_some(Violation::LogCount {
        trace_id,
        expected,
        found,
    })
}

/// Logs whose trace has no landed span: a visible degraded state, not an error
/// to repair.
pub fn orphan_logs(landed: &Landed) -> Vec<&LogRecord> {
    let traces: HashSet<TraceId> = landed.spans.iter().map(|s| s.trace_id).collect();
    landed
        .logs
        .iter()
        .filter(|l| l.trace_id.is_some_and(|t| !traces.contains(&t)))
        .collect()
}

/// A landed span whose parent did not land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenEdge {
    pub child: SpanId,
    pub missing_parent: SpanId,
    /// Closest emitted ancestor that did land, when the lineage is known.
    pub nearest_surviving_ancestor: Option<SpanId>,
}

/// The landed spans of one trace, arranged by parent.
#[derive(Debug, Clone)]
pub struct TraceTree {
    trace_id: TraceId,
    roots: Vec<SpanId>,
    children: HashMap<SpanId, Vec<SpanId>>,
    broken_edges: Vec<BrokenEdge>,
}

impl TraceTree {
    /// Build the tree of `trace_id` from landed spans.
    pub fn assemble(trace_id: TraceId, landed: &[SpanRecord]) -> Self {
        Self::build(trace_id, landed, None)
    }

    /// As [`TraceTree::assemble`], annotating broken edges with the nearest
    /// surviving ancestor found in the emitted spans.
    pub fn assemble_with_lineage(trace_id: TraceId, landed: &[SpanRecord], emitted: &[SpanRecord]) -> Self {
        Self::build(trace_id, landed, Some(emitted))
    }

    fn build(trace_id: TraceId, landed: &[SpanRecord], emitted: Option<&[SpanRecord]>) -> Self {
        let spans: Vec<&SpanRecord> = landed.iter().filter(|s| s.trace_id == trace_id).collect();
        let present: HashSet<SpanId> = spans.iter().map(|s| s.span_id).collect();
        let lineage: HashMap<SpanId, Option<SpanId>> = emitted
            .unwrap_or_default()
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .map(|s| (s.span_id, (!s.is_local_root()).then_some(s.parent_span_id).flatten()))
            .collect();

        let mut tree = Self {
            trace_id,
            roots: Vec::new(),
            children: HashMap::new(),
            broken_edges: Vec::new(),
        };
        for span in spans {
            match span.parent_span_id {
                Some(parent) if !span.parent_is_remote => {
                    if present.contains(&parent) {
                        tree.children.entry(parent).or_default().push(span.span_id);
                    } else {
                        tree.broken_edges.push(BrokenEdge {
                            child: span.span_id,
                            missing_parent: parent,
                            nearest_surviving_ancestor: nearest_surviving(parent, &lineage, &present),
                        });
                    }
                }
                _ => tree.roots.push(span.span_id),
            }
        }
        tree
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Spans with no parent in this process (including remote-parented ones).
    pub fn roots(&self) -> &[SpanId] {
        &self.roots
    }

    pub fn children(&self, span: SpanId) -> &[SpanId] {
        self.children.get(&span).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn broken_edges(&self) -> &[BrokenEdge] {
        &self.broken_edges
    }

    /// One root and no broken edges.
    pub fn is_connected(&self) -> bool {
        self.roots.len() == 1 && self.broken_edges.is_empty()
    }
}

/// Walk the emitted lineage upward from `start` to the first span that landed.
fn nearest_surviving(
    start: SpanId,
    lineage: &HashMap<SpanId, Option<SpanId>>,
    present: &HashSet<SpanId>,
) -> Option<SpanId> {
    let mut current = start;
    // Bounded by the lineage size so a malformed (cyclic) lineage terminates.
    for _ in 0..=lineage.len() {
        let parent = (*lineage.get(&current)?)?;
        if present.contains(&parent) {
            return Some(parent);
        }
        current = parent;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{emitter::Emitter, ids::IdGenerator, sink::MemorySink};
    use std::sync::Arc;

    /// root › a › b › c, plus one log per span.
    fn emit_chain() -> (Vec<Signal>, TraceId) {
        let sink = MemorySink::new();
        let emitter = Emitter::new("svc", IdGenerator::from_os_rng().unwrap(), Arc::new(sink.clone()));
        let root = emitter.start_unit("root", None);
        let trace_id = root.context().trace_id;
        let a = root.child("a");
        a.info("in a");
        let b = a.child("b");
        b.info("in b");
        let c = b.child("c");
        c.info("in c");
        c.end_ok();
        b.end_ok();
        a.end_ok();
        root.end_ok();
        (sink.signals(), trace_id)
    }

    fn spans(signals: &[Signal]) -> Vec<SpanRecord> {
        signals
            .iter()
            .filter_map(|s| match s {
                Signal::Span(span) => Some(span.clone()),
                _ => None,
            })
            .collect()
    }

    fn span_id(spans: &[SpanRecord], name: &str) -> SpanId {
        spans.iter().find(|s| s.name == name).unwrap().span_id
    }

    #[test]
    fn direct_topology_preserves_everything() {
        let (emitted, trace_id) = emit_chain();
        let landed = Topology::default().deliver(&emitted);
        assert!(check_identifiers_preserved(&emitted, &landed).is_empty());
        assert!(check_trace_consistency(&landed.spans, &landed.logs).is_empty());
        assert!(check_temporal_containment(&landed.spans).is_empty());
        assert_eq!(check_log_count(&landed.logs, trace_id, 4), None);
        assert!(TraceTree::assemble(trace_id, &landed.spans).is_connected());
    }

    #[test]
    fn enrichment_and_filtering_are_allowed() {
        let (emitted, _) = emit_chain();
        let topology = Topology {
            logs: RelayPath::direct()
                .then(Enrich::new("k8s.namespace", "demo"))
                .then(DropLevelsBelow(Level::Warn)),
            spans: RelayPath::direct().then(Enrich::new("collector", "otel")),
            metrics: RelayPath::direct(),
        };
        let landed = topology.deliver(&emitted);
        // Only INFO logs were emitted, so the filter removes all of them.
        assert!(landed.logs.is_empty());
        assert!(landed.spans.iter().all(|s| s.attributes.contains_key("collector")));
        assert!(check_identifiers_preserved(&emitted, &landed).is_empty());
    }

    #[test]
    fn rewritten_ids_are_detected() {
        let (emitted, _) = emit_chain();
        let ids = IdGenerator::from_os_rng().unwrap();
        let fresh = ids.trace_id();
        let topology = Topology {
            logs: RelayPath::direct().then(Rewrite(move |s: Signal| match s {
                Signal::Log(mut l) => {
                    l.trace_id = Some(fresh);
                    Some(Signal::Log(l))
                }
                other => Some(other),
            })),
            ..Topology::default()
        };
        let landed = topology.deliver(&emitted);
        let violations = check_identifiers_preserved(&emitted, &landed);
        assert_eq!(violations.len(), landed.logs.len());
        assert!(violations
            .iter()
            .all(|v| matches!(v, Violation::IdentifierRewritten { kind: SignalKind::Log, .. })));
        assert_eq!(check_trace_consistency(&landed.spans, &landed.logs).len(), landed.logs.len());
    }

    #[test]
    fn sampled_out_parent_is_reported_not_reparented() {
        let (emitted, trace_id) = emit_chain();
        let all = spans(&emitted);
        let (a, b, c) = (span_id(&all, "a"), span_id(&all, "b"), span_id(&all, "c"));
        let topology = Topology {
            spans: RelayPath::direct().then(SampleSpans::new(|s: &SpanRecord| s.name != "b")),
            ..Topology::default()
        };
        let landed = topology.deliver(&emitted);

        let tree = TraceTree::assemble_with_lineage(trace_id, &landed.spans, &all);
        assert!(!tree.is_connected());
        assert_eq!(
            tree.broken_edges(),
            &[BrokenEdge {
                child: c,
                missing_parent: b,
                nearest_surviving_ancestor: Some(a),
            }]
        );
        // c is not attached anywhere.
        assert!(tree.children(a).is_empty());

        let plain = TraceTree::assemble(trace_id, &landed.spans);
        assert_eq!(plain.broken_edges()[0].nearest_surviving_ancestor, None);
    }

    #[test]
    fn dropping_all_spans_leaves_observable_orphan_logs() {
        let (emitted, _) = emit_chain();
        let topology = Topology {
            spans: RelayPath::direct().then(SampleSpans::new(|_: &SpanRecord| false)),
            ..Topology::default()
        };
        let landed = topology.deliver(&emitted);
        assert_eq!(orphan_logs(&landed).len(), landed.logs.len());
        assert!(check_identifiers_preserved(&emitted, &landed).is_empty());
    }

    #[test]
    fn containment_violation_is_detected() {
        let (emitted, _) = emit_chain();
        let mut all = spans(&emitted);
        let root_end = all.iter().find(|s| s.name == "root").unwrap().end;
        let c = all.iter_mut().find(|s| s.name == "c").unwrap();
        c.end = root_end + chrono::Duration::seconds(1);
        let violations = check_temporal_containment(&all);
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn wrong_log_count_is_reported() {
        let (emitted, trace_id) = emit_chain();
        let landed = Topology::default().deliver(&emitted);
        assert_eq!(
            check_log_count(&landed.logs, trace_id, 7),
            Some(Violation::LogCount {
                trace_id,
                expected: 7,
                found: 4,
            })
        );
    }

    #[test]
    fn relay_path_len() {
        let path = RelayPath::direct().then(DropLevelsBelow(Level::Info));
        assert_eq!(path.len(), 1);
        assert!(RelayPath::direct().is_empty());
    }
}
