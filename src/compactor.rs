use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;

/// Background task that compacts the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        debug!("compacting WAL after {appends} appends");
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("encore_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compactor_resets_append_count() {
        let path = test_wal_path("compactor.wal");
        let engine = Arc::new(Engine::new(path).unwrap());
        for i in 0..5 {
            engine
                .register_user(Ulid::new(), format!("user{i}"))
                .await
                .unwrap();
        }
        engine
            .create_resource(Ulid::new(), "Mixer".into(), EquipCategory::Mixer, true)
            .await
            .unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 6);

        let task = tokio::spawn(run_compactor(engine.clone(), 3, Duration::from_millis(10)));
        let mut compacted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if engine.wal_appends_since_compact().await == 0 {
                compacted = true;
                break;
            }
        }
        task.abort();
        assert!(compacted, "compactor never ran");
    }
}
