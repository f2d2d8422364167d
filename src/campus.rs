use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Manages per-campus engines. Each campus gets its own Engine + WAL + reaper.
/// Campus = database name from the pgwire connection.
pub struct CampusManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    shutdown: CancellationToken,
}

impl CampusManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the reaper and compactor tasks of every campus.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get or lazily create an engine for the given campus.
    pub fn get_or_create(&self, campus: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(campus) {
            return Ok(engine.value().clone());
        }
        if campus.len() > MAX_CAMPUS_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "campus name too long",
            ));
        }
        if self.engines.len() >= MAX_CAMPUSES {
            return Err(std::io::Error::other("too many campuses"));
        }

        // Sanitize campus name to prevent path traversal
        let safe_name: String = campus
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty campus name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify)?);

        // Spawn reaper + compactor for this campus
        let reaper_engine = engine.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = reaper::run_reaper(reaper_engine) => {}
            }
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = reaper::run_compactor(compactor_engine, threshold) => {}
            }
        });

        self.engines.insert(campus.to_string(), engine.clone());
        metrics::gauge!(crate::observability::CAMPUSES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("parkd_test_campus").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn campus_isolation() {
        let dir = test_data_dir("isolation");
        let cm = CampusManager::new(dir, 1000);

        let eng_a = cm.get_or_create("campus_a").unwrap();
        let eng_b = cm.get_or_create("campus_b").unwrap();

        let sid = Ulid::new();

        // Create same site ID in both campuses
        eng_a
            .create_site(sid, "north lot".into(), 35.0, 139.0, SiteCategory::Parking)
            .await
            .unwrap();
        eng_b
            .create_site(sid, "south lot".into(), 34.0, 138.0, SiteCategory::Parking)
            .await
            .unwrap();

        let bid = Ulid::new();
        eng_a.create_building(bid, sid, "tower A".into()).await.unwrap();

        // Campus B's site should have no buildings
        let buildings_b = eng_b.list_buildings(Some(sid), 0).await;
        assert!(buildings_b.is_empty());

        // Campus A should see its building
        let buildings_a = eng_a.list_buildings(Some(sid), 0).await;
        assert_eq!(buildings_a.len(), 1);
        assert_eq!(buildings_a[0].name, "tower A");
    }

    #[tokio::test]
    async fn campus_lazy_creation() {
        let dir = test_data_dir("lazy");
        let cm = CampusManager::new(dir.clone(), 1000);

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        // Create a campus
        let _eng = cm.get_or_create("my_db").unwrap();

        // WAL file should now exist
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn campus_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let cm = CampusManager::new(dir, 1000);

        let eng1 = cm.get_or_create("foo").unwrap();
        let eng2 = cm.get_or_create("foo").unwrap();

        // Should be the same Arc
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn campus_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let cm = CampusManager::new(dir.clone(), 1000);

        // Path traversal attempt
        let _eng = cm.get_or_create("../evil").unwrap();
        // Should create "evil.wal", not "../evil.wal"
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        let result = cm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn campus_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let cm = CampusManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_CAMPUS_NAME_LEN + 1);
        let result = cm.get_or_create(&long_name);
        assert!(result.is_err());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("campus name too long"));
    }

    #[tokio::test]
    async fn campus_name_at_limit() {
        let dir = test_data_dir("name_at_limit");
        let cm = CampusManager::new(dir.clone(), 1000);

        // MAX_CAMPUS_NAME_LEN plus the ".wal" suffix stays well under OS
        // filename limits, so a name exactly at the limit must succeed.
        let name = "x".repeat(MAX_CAMPUS_NAME_LEN);
        let _eng = cm.get_or_create(&name).unwrap();
        assert!(dir.join(format!("{name}.wal")).exists());
    }

    #[tokio::test]
    async fn shutdown_cancels_background_tasks() {
        let dir = test_data_dir("shutdown");
        let cm = CampusManager::new(dir, 1000);
        let eng = cm.get_or_create("main").unwrap();

        cm.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The engine itself keeps working; only the background sweeps stop.
        eng.create_site(Ulid::new(), "lot".into(), 35.0, 139.0, SiteCategory::Parking)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn campus_count_limit() {
        let dir = test_data_dir("count_limit");
        let cm = CampusManager::new(dir, 1000);

        for i in 0..MAX_CAMPUSES {
            cm.get_or_create(&format!("c{i}")).unwrap();
        }
        let result = cm.get_or_create("one_more");
        assert!(result.is_err());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("too many campuses"));
    }
}
