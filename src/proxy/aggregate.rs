//! Result aggregation: threshold filtering, ordering and output

use crate::proxy::checker::SortOrder;
use crate::proxy::models::{AnnotatedResult, EndpointDescriptor, ProbeOutcome};
use crate::Result;
use anyhow::Context;
use std::fs;
use std::path::Path;

/// Collects passing tunnel results and produces the final ordered list
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    threshold_ms: u64,
    sort_order: SortOrder,
    results: Vec<AnnotatedResult>,
}

impl ResultAggregator {
    pub fn new(threshold_ms: u64, sort_order: SortOrder) -> Self {
        Self {
            threshold_ms,
            sort_order,
            results: Vec::new(),
        }
    }

    /// Whether a measured latency is acceptable; the threshold is exclusive
    pub fn passes(&self, latency_ms: u64) -> bool {
        latency_ms < self.threshold_ms
    }

    /// Latency of `outcome` if it should be kept
    pub fn accepted_latency(&self, outcome: &ProbeOutcome) -> Option<u64> {
        outcome.latency_ms().filter(|ms| self.passes(*ms))
    }

    /// Record an annotated result; returns `false` if it misses the threshold
    pub fn push(&mut self, descriptor: EndpointDescriptor, latency_ms: u64, country_code: String) -> bool {
        if !self.passes(latency_ms) {
            return false;
        }
        self.results
            .push(AnnotatedResult::new(descriptor, Some(latency_ms), country_code));
        true
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Sorted results
    ///
    /// Ties under latency ordering fall back to the output line, so the
    /// order never depends on probe completion order.
    pub fn finish(self) -> Vec<AnnotatedResult> {
        let mut keyed: Vec<(String, AnnotatedResult)> = self
            .results
            .into_iter()
            .map(|r| (r.to_line(), r))
            .collect();

        match self.sort_order {
            SortOrder::Descriptor => keyed.sort_by(|a, b| a.0.cmp(&b.0)),
            SortOrder::Latency => keyed.sort_by(|a, b| {
                a.1.latency_ms
                    .cmp(&b.1.latency_ms)
                    .then_with(|| a.0.cmp(&b.0))
            }),
        }

        keyed.into_iter().map(|(_, r)| r).collect()
    }
}

/// Render results as newline-terminated output lines
pub fn render(results: &[AnnotatedResult]) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&result.to_line());
        out.push('\n');
    }
    out
}

/// Write results to `path`, one line each
pub fn save_to_file<P: AsRef<Path>>(results: &[AnnotatedResult], path: P) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, render(results))
        .with_context(|| format!("failed to write output file {}", path.display()))?;
    Ok(())
}

/// Write results as a pretty-printed JSON array
pub fn save_json<P: AsRef<Path>>(results: &[AnnotatedResult], path: P) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_vec_pretty(results)?;
    fs::write(path, json)
        .with_context(|| format!("failed to write JSON report {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::parser::DescriptorParser;

    fn descriptor(line: &str) -> EndpointDescriptor {
        DescriptorParser::parse_line(line).unwrap()
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let agg = ResultAggregator::new(150, SortOrder::Descriptor);
        assert!(agg.passes(149));
        assert!(!agg.passes(150));
        assert!(!agg.passes(151));

        assert_eq!(agg.accepted_latency(&ProbeOutcome::Reachable(149)), Some(149));
        assert_eq!(agg.accepted_latency(&ProbeOutcome::Reachable(150)), None);
        assert_eq!(agg.accepted_latency(&ProbeOutcome::Unreachable), None);
        assert_eq!(
            agg.accepted_latency(&ProbeOutcome::TunnelFailure("x".into())),
            None
        );
    }

    #[test]
    fn test_push_rejects_slow_results() {
        let mut agg = ResultAggregator::new(100, SortOrder::Descriptor);
        assert!(!agg.push(descriptor("vless://a@1.1.1.1"), 100, "US".into()));
        assert!(agg.push(descriptor("vless://a@1.1.1.1"), 99, "US".into()));
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_descriptor_order() {
        let mut agg = ResultAggregator::new(1000, SortOrder::Descriptor);
        agg.push(descriptor("vless://c@3.3.3.3#x"), 10, "FR".into());
        agg.push(descriptor("vless://a@1.1.1.1#y"), 300, "US".into());
        agg.push(descriptor("vless://b@2.2.2.2"), 20, "??".into());

        let lines: Vec<String> = agg.finish().iter().map(|r| r.to_line()).collect();
        assert_eq!(
            lines,
            vec![
                "vless://a@1.1.1.1#US-300ms",
                "vless://b@2.2.2.2#??-20ms",
                "vless://c@3.3.3.3#FR-10ms",
            ]
        );
    }

    #[test]
    fn test_latency_order_breaks_ties_by_line() {
        let mut agg = ResultAggregator::new(1000, SortOrder::Latency);
        agg.push(descriptor("vless://z@9.9.9.9"), 50, "DE".into());
        agg.push(descriptor("vless://a@1.1.1.1"), 50, "DE".into());
        agg.push(descriptor("vless://m@5.5.5.5"), 5, "DE".into());

        let hosts: Vec<String> = agg.finish().into_iter().map(|r| r.descriptor.host).collect();
        assert_eq!(hosts, vec!["5.5.5.5", "1.1.1.1", "9.9.9.9"]);
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("good.txt");

        let mut agg = ResultAggregator::new(1000, SortOrder::Descriptor);
        agg.push(descriptor("vless://a@1.1.1.1?security=tls#old"), 42, "NL".into());
        save_to_file(&agg.finish(), &path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "vless://a@1.1.1.1?security=tls#NL-42ms\n"
        );

        save_to_file(&[], &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_save_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut agg = ResultAggregator::new(1000, SortOrder::Descriptor);
        agg.push(descriptor("vless://a@1.1.1.1:8443"), 42, "NL".into());
        let results = agg.finish();
        save_json(&results, &path).unwrap();

        let read: Vec<AnnotatedResult> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(read, results);
        assert_eq!(read[0].descriptor.port, 8443);
    }
}
