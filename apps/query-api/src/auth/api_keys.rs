use crate::error::ApiError;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use telemetry_core::model::SensorFamily;
use uuid::Uuid;

/// Consumer tiers; quota is per 15-minute window, `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
    Internal,
}

/// Endpoint classes gating by tier: `Standard` covers the sensor-centric
/// reads, `Advanced` the aggregate/comparison/legacy surfaces, `Admin` the
/// key-management surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Standard,
    Advanced,
    Admin,
}

impl Tier {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            "enterprise" => Some(Tier::Enterprise),
            "internal" => Some(Tier::Internal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
            Tier::Internal => "internal",
        }
    }

    pub fn quota_per_window(&self) -> Option<u64> {
        match self {
            Tier::Free => Some(100),
            Tier::Basic => Some(1_000),
            Tier::Premium => Some(10_000),
            Tier::Enterprise | Tier::Internal => None,
        }
    }

    pub fn allows(&self, class: EndpointClass) -> bool {
        match class {
            EndpointClass::Standard => true,
            EndpointClass::Advanced => {
                matches!(self, Tier::Premium | Tier::Enterprise | Tier::Internal)
            }
            EndpointClass::Admin => matches!(self, Tier::Internal),
        }
    }
}

/// Scope annotation attached to each authenticated request.
#[derive(Debug, Clone)]
pub struct KeyContext {
    pub id: Uuid,
    pub tenant: String,
    pub tier: Tier,
    pub allowed_families: Vec<SensorFamily>,
    pub allowed_zones: Option<Vec<String>>,
}

impl KeyContext {
    pub fn require_class(&self, class: EndpointClass) -> Result<(), ApiError> {
        if self.tier.allows(class) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "Endpoint not available on the {} tier",
                self.tier.as_str()
            )))
        }
    }

    pub fn require_family(&self, family: SensorFamily) -> Result<(), ApiError> {
        // Gateways ride along with the moisture grant.
        let effective = match family {
            SensorFamily::Gateway => SensorFamily::Moisture,
            other => other,
        };
        if self.allowed_families.contains(&effective) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "Family {} is outside this key's scope",
                family.as_str()
            )))
        }
    }

    pub fn zone_filter(&self) -> Option<&[String]> {
        self.allowed_zones.as_deref()
    }
}

pub fn api_key_hash(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: Uuid,
    tenant: String,
    tier: String,
    allowed_families: Vec<String>,
    allowed_zones: Option<Vec<String>>,
    expires_at: Option<DateTime<Utc>>,
    active: bool,
}

struct CacheSlot {
    context: Option<KeyContext>,
    cached_at: Instant,
}

/// Durable key table mirrored to memory on a short TTL so the hot path
/// stays off the database.
pub struct ApiKeyAuthority {
    db: PgPool,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheSlot>>,
}

impl ApiKeyAuthority {
    pub fn new(db: PgPool, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, raw_key: &str) -> Result<Option<KeyContext>, sqlx::Error> {
        let raw_key = raw_key.trim();
        if raw_key.is_empty() {
            return Ok(None);
        }
        let key_hash = api_key_hash(raw_key);

        if let Some(context) = self.cached(&key_hash) {
            return Ok(context);
        }

        let row: Option<ApiKeyRow> = sqlx::query_as(
            r#"
            SELECT id, tenant, tier, allowed_families, allowed_zones, expires_at, active
            FROM api_keys
            WHERE key_hash = $1
            LIMIT 1
            "#,
        )
        .bind(&key_hash)
        .fetch_optional(&self.db)
        .await?;

        let context = row.and_then(|row| {
            if !row.active {
                return None;
            }
            if matches!(row.expires_at, Some(expires) if Utc::now() >= expires) {
                return None;
            }
            let tier = Tier::parse(&row.tier)?;
            let allowed_families = row
                .allowed_families
                .iter()
                .filter_map(|raw| SensorFamily::parse(raw))
                .collect();
            Some(KeyContext {
                id: row.id,
                tenant: row.tenant,
                tier,
                allowed_families,
                allowed_zones: row.allowed_zones,
            })
        });

        if let Some(context) = &context {
            let _ = sqlx::query(
                "UPDATE api_keys SET last_used_at = NOW(), usage_count = usage_count + 1 WHERE id = $1",
            )
            .bind(context.id)
            .execute(&self.db)
            .await;
        }

        let mut cache = self.cache.write().expect("key cache lock");
        cache.insert(
            key_hash,
            CacheSlot {
                context: context.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(context)
    }

    fn cached(&self, key_hash: &str) -> Option<Option<KeyContext>> {
        let cache = self.cache.read().expect("key cache lock");
        let slot = cache.get(key_hash)?;
        if slot.cached_at.elapsed() > self.ttl {
            return None;
        }
        Some(slot.context.clone())
    }

    /// Mints a new key. The plaintext is returned exactly once; only the
    /// hash is stored.
    pub async fn create_key(
        &self,
        tenant: &str,
        tier: Tier,
        allowed_families: &[SensorFamily],
        allowed_zones: Option<&[String]>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(Uuid, String), sqlx::Error> {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let mut plaintext = String::with_capacity(3 + raw.len() * 2);
        plaintext.push_str("mb_");
        for byte in raw {
            let _ = write!(plaintext, "{byte:02x}");
        }

        let id = Uuid::new_v4();
        let families: Vec<String> = allowed_families
            .iter()
            .map(|f| f.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, key_hash, tenant, tier, allowed_families, allowed_zones, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(api_key_hash(&plaintext))
        .bind(tenant)
        .bind(tier.as_str())
        .bind(families)
        .bind(allowed_zones.map(|z| z.to_vec()))
        .bind(expires_at)
        .execute(&self.db)
        .await?;

        Ok((id, plaintext))
    }

    /// Revocation flips `active`; the row stays for auditability. The
    /// memory mirror converges within its TTL.
    pub async fn revoke_key(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE api_keys SET active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_hex() {
        let a = api_key_hash("mb_test");
        let b = api_key_hash("mb_test");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(api_key_hash("mb_other"), a);
    }

    #[test]
    fn tier_quotas_follow_the_pricing_table() {
        assert_eq!(Tier::Free.quota_per_window(), Some(100));
        assert_eq!(Tier::Basic.quota_per_window(), Some(1_000));
        assert_eq!(Tier::Premium.quota_per_window(), Some(10_000));
        assert_eq!(Tier::Enterprise.quota_per_window(), None);
    }

    #[test]
    fn endpoint_classes_gate_by_tier() {
        assert!(Tier::Free.allows(EndpointClass::Standard));
        assert!(!Tier::Free.allows(EndpointClass::Advanced));
        assert!(Tier::Premium.allows(EndpointClass::Advanced));
        assert!(!Tier::Enterprise.allows(EndpointClass::Admin));
        assert!(Tier::Internal.allows(EndpointClass::Admin));
    }

    #[test]
    fn family_scope_covers_gateways_via_moisture() {
        let ctx = KeyContext {
            id: Uuid::new_v4(),
            tenant: "rid".to_string(),
            tier: Tier::Basic,
            allowed_families: vec![SensorFamily::Moisture],
            allowed_zones: None,
        };
        assert!(ctx.require_family(SensorFamily::Moisture).is_ok());
        assert!(ctx.require_family(SensorFamily::Gateway).is_ok());
        assert!(ctx.require_family(SensorFamily::WaterLevel).is_err());
    }
}
