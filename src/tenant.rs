use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::FixedOffset;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

type EngineCell = Arc<OnceCell<Arc<Engine>>>;

/// Manages per-tenant engines. Each tenant (packhouse) gets its own Engine,
/// WAL, outbox and compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, EngineCell>,
    data_dir: PathBuf,
    compact_threshold: u64,
    utc_offset: FixedOffset,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, utc_offset: FixedOffset) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            utc_offset,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub async fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant).and_then(|cell| cell.get().cloned()) {
            return Ok(engine);
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }

        if !self.engines.contains_key(tenant) && self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The map's shard lock is only held to find or add the cell. Replay
        // runs outside it, once per tenant even when connections race.
        let cell = self.engines.entry(tenant.to_string()).or_default().clone();
        let opened = cell.get_or_try_init(|| self.open(tenant, &safe_name)).await;
        match opened {
            Ok(engine) => Ok(engine.clone()),
            Err(e) => {
                self.engines.remove_if(tenant, |_, cell| cell.get().is_none());
                Err(e)
            }
        }
    }

    async fn open(&self, tenant: &str, safe_name: &str) -> io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let utc_offset = self.utc_offset;
        let engine = tokio::task::spawn_blocking(move || {
            Engine::new(wal_path, Arc::new(NotifyHub::new()), utc_offset)
        })
        .await
        .map_err(io::Error::other)??;
        let engine = Arc::new(engine);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("opened tenant {tenant}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_offset;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("packslot_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, default_offset())
    }

    fn spec() -> SlotSpec {
        SlotSpec {
            date: NaiveDate::from_ymd_opt(2031, 3, 3).unwrap(),
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            capacity: 10,
            resource_unit: "tons".into(),
            blackout: false,
            notes: None,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("packhouse_a").await.unwrap();
        let eng_b = tm.get_or_create("packhouse_b").await.unwrap();

        // Same slot id and key in both tenants
        let slot_id = Ulid::new();
        eng_a.create_slot(slot_id, spec()).await.unwrap();
        eng_b.create_slot(slot_id, spec()).await.unwrap();

        let grower = Ulid::new();
        eng_a.register_grower(grower, "Hill Farm".into(), None).await.unwrap();
        eng_a
            .create_booking(Principal::Admin, Ulid::new(), slot_id, grower, None, 7, None)
            .await
            .unwrap();

        assert_eq!(eng_a.slot_usage(slot_id).await.unwrap().booked, 7);
        assert_eq!(eng_b.slot_usage(slot_id).await.unwrap().booked, 0);
        // The grower only exists in tenant A.
        assert!(eng_b.list_growers().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").await.unwrap();

        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").await.unwrap();
        let eng2 = tm.get_or_create("foo").await.unwrap();

        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_opens_share_one_engine() {
        let dir = test_data_dir("racing_opens");
        let tm = Arc::new(manager(dir));

        let mut handles = Vec::new();
        for i in 0..16 {
            let tm = tm.clone();
            let tenant = if i % 2 == 0 { "busy" } else { "quiet" };
            handles.push(tokio::spawn(async move { (tenant, tm.get_or_create(tenant).await.unwrap()) }));
        }
        let mut busy = Vec::new();
        for h in handles {
            let (tenant, engine) = h.await.unwrap();
            if tenant == "busy" {
                busy.push(engine);
            }
        }
        assert_eq!(busy.len(), 8);
        assert!(busy.iter().all(|e| Arc::ptr_eq(e, &busy[0])));
        let quiet = tm.get_or_create("quiet").await.unwrap();
        assert!(!Arc::ptr_eq(&quiet, &busy[0]));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        // Path traversal attempt
        let _eng = tm.get_or_create("../evil").await.unwrap();
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        assert!(tm.get_or_create("../..").await.is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).await.err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).await.unwrap();
        }
        let err = tm.get_or_create("one_more").await.err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
