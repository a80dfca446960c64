use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cloud-front-door extras: token routing, revocation, and per-tenant
/// traffic shaping. The routing table is seeded from a JSON file managed
/// by provisioning and re-read on a TTL.
pub struct CloudRelay {
    path: PathBuf,
    table: Mutex<TokenTable>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    rate_per_sec: f64,
    burst: f64,
}

#[derive(Default)]
struct TokenTable {
    routes: HashMap<String, TokenRoute>,
    denied: HashSet<String>,
    attributes: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenRoute {
    pub tenant: String,
    pub family: String,
}

#[derive(Debug, Deserialize)]
struct TokenTableFile {
    #[serde(default)]
    tokens: Vec<TokenEntry>,
    #[serde(default)]
    denied: Vec<String>,
    #[serde(default)]
    attributes: HashMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    token: String,
    tenant: String,
    family: String,
}

/// Outcome of the token gate ahead of the enqueue.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayDecision {
    Allowed(TokenRoute),
    Denied,
    Unknown,
    RateLimited,
}

impl PartialEq for TokenRoute {
    fn eq(&self, other: &Self) -> bool {
        self.tenant == other.tenant && self.family == other.family
    }
}

struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
}

impl CloudRelay {
    pub fn load(path: PathBuf, rate_per_sec: f64, burst: f64) -> Result<Self> {
        let relay = Self {
            path,
            table: Mutex::new(TokenTable::default()),
            buckets: Mutex::new(HashMap::new()),
            rate_per_sec,
            burst,
        };
        relay.refresh()?;
        Ok(relay)
    }

    pub fn refresh(&self) -> Result<()> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read token table {}", self.path.display()))?;
        let parsed: TokenTableFile = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse token table {}", self.path.display()))?;

        let mut table = self.table.lock().expect("relay table lock");
        table.routes = parsed
            .tokens
            .into_iter()
            .map(|entry| {
                (
                    entry.token,
                    TokenRoute {
                        tenant: entry.tenant,
                        family: entry.family,
                    },
                )
            })
            .collect();
        table.denied = parsed.denied.into_iter().collect();
        table.attributes = parsed.attributes;
        tracing::info!(
            tokens = table.routes.len(),
            denied = table.denied.len(),
            "token table refreshed"
        );
        Ok(())
    }

    /// Spawns the TTL refresh loop.
    pub fn start_refresh(self: std::sync::Arc<Self>, ttl: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh() {
                            tracing::warn!(error = %err, "token table refresh failed; keeping previous table");
                        }
                    }
                }
            }
        });
    }

    pub fn resolve(&self, token: &str) -> RelayDecision {
        let route = {
            let table = self.table.lock().expect("relay table lock");
            if table.denied.contains(token) {
                return RelayDecision::Denied;
            }
            match table.routes.get(token) {
                Some(route) => route.clone(),
                None => return RelayDecision::Unknown,
            }
        };

        if self.take_token(&route.tenant) {
            RelayDecision::Allowed(route)
        } else {
            RelayDecision::RateLimited
        }
    }

    pub fn attributes(&self, token: &str) -> Option<JsonValue> {
        let table = self.table.lock().expect("relay table lock");
        if table.denied.contains(token) || !table.routes.contains_key(token) {
            return None;
        }
        Some(
            table
                .attributes
                .get(token)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})),
        )
    }

    fn take_token(&self, tenant: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("relay bucket lock");
        let bucket = buckets.entry(tenant.to_string()).or_insert(TokenBucket {
            tokens: self.burst,
            refilled_at: Instant::now(),
        });
        let elapsed = bucket.refilled_at.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.refilled_at = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("tokens.json");
        let mut file = std::fs::File::create(&path).expect("tmp file");
        file.write_all(contents.as_bytes()).expect("write");
        (dir, path)
    }

    const TABLE: &str = r#"{
        "tokens": [
            {"token": "munbon-ridr-water-level", "tenant": "rid", "family": "water-level"},
            {"token": "munbon-m2m-moisture", "tenant": "rid", "family": "moisture"}
        ],
        "denied": ["munbon-old-revoked"],
        "attributes": {
            "munbon-m2m-moisture": {"report_interval_s": 900}
        }
    }"#;

    #[test]
    fn resolves_known_tokens_to_their_route() {
        let (_guard, path) = table_file(TABLE);
        let relay = CloudRelay::load(path, 100.0, 200.0).unwrap();
        let decision = relay.resolve("munbon-m2m-moisture");
        match decision {
            RelayDecision::Allowed(route) => {
                assert_eq!(route.tenant, "rid");
                assert_eq!(route.family, "moisture");
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn denied_and_unknown_tokens_are_refused() {
        let (_guard, path) = table_file(TABLE);
        let relay = CloudRelay::load(path, 100.0, 200.0).unwrap();
        assert_eq!(relay.resolve("munbon-old-revoked"), RelayDecision::Denied);
        assert_eq!(relay.resolve("nope"), RelayDecision::Unknown);
    }

    #[test]
    fn tenant_bucket_shapes_bursts() {
        let (_guard, path) = table_file(TABLE);
        let relay = CloudRelay::load(path, 0.0, 3.0).unwrap();
        for _ in 0..3 {
            assert!(matches!(
                relay.resolve("munbon-m2m-moisture"),
                RelayDecision::Allowed(_)
            ));
        }
        assert_eq!(
            relay.resolve("munbon-m2m-moisture"),
            RelayDecision::RateLimited
        );
    }

    #[test]
    fn attributes_are_served_for_provisioned_tokens_only() {
        let (_guard, path) = table_file(TABLE);
        let relay = CloudRelay::load(path, 100.0, 200.0).unwrap();
        let blob = relay.attributes("munbon-m2m-moisture").unwrap();
        assert_eq!(blob["report_interval_s"], 900);
        // Token without an attribute entry still boots with an empty blob.
        assert_eq!(
            relay.attributes("munbon-ridr-water-level").unwrap(),
            serde_json::json!({})
        );
        assert!(relay.attributes("munbon-old-revoked").is_none());
    }
}
