use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Some gateways dial the intake with zero-length or identity-less bodies
/// as keep-alives. They get a `200` and are never forwarded; this tracker
/// gives operators a view of who is doing it and how often.
#[derive(Default)]
pub struct EmptyPayloadTracker {
    sources: Mutex<HashMap<String, SourceStat>>,
}

#[derive(Debug, Clone, Copy)]
struct SourceStat {
    count: u64,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceReport {
    pub source_ip: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

impl EmptyPayloadTracker {
    pub fn record(&self, source_ip: &str) {
        let mut sources = self.sources.lock().expect("shed lock");
        let stat = sources.entry(source_ip.to_string()).or_insert(SourceStat {
            count: 0,
            last_seen: Utc::now(),
        });
        stat.count += 1;
        stat.last_seen = Utc::now();
    }

    pub fn snapshot(&self) -> Vec<SourceReport> {
        let sources = self.sources.lock().expect("shed lock");
        let mut out: Vec<SourceReport> = sources
            .iter()
            .map(|(ip, stat)| SourceReport {
                source_ip: ip.clone(),
                count: stat.count,
                last_seen: stat.last_seen,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.source_ip.cmp(&b.source_ip)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_source() {
        let tracker = EmptyPayloadTracker::default();
        tracker.record("203.0.113.9");
        tracker.record("203.0.113.9");
        tracker.record("198.51.100.4");

        let report = tracker.snapshot();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].source_ip, "203.0.113.9");
        assert_eq!(report[0].count, 2);
        assert_eq!(report[1].count, 1);
    }
}
