//! Bulk loading of reference data and rosters from a JSON file.
//!
//! Entries that already exist are skipped, so a seed file can be applied to
//! the same data directory on every start.

use serde::Deserialize;
use tracing::{debug, info};

use crate::engine::{Engine, EngineError};
use crate::model::*;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub users: Vec<UserInfo>,
    pub performances: Vec<PerformanceInfo>,
    pub session_kinds: Vec<SessionKindInfo>,
    pub resources: Vec<ResourceInfo>,
    pub teams: Vec<NewTeam>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub skipped: usize,
}

impl SeedReport {
    fn count(&mut self, result: Result<(), EngineError>) -> Result<(), EngineError> {
        match result {
            Ok(()) => self.created += 1,
            Err(EngineError::AlreadyExists(id)) => {
                debug!("seed: {id} already present");
                self.skipped += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl SeedFile {
    pub fn parse(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Apply in dependency order: catalog entries, resources, then teams.
    /// Teams have no caller-chosen id; one whose performance already has a
    /// team of the same name is treated as present.
    pub async fn load_into(self, engine: &Engine) -> Result<SeedReport, EngineError> {
        let mut report = SeedReport::default();
        for u in self.users {
            report.count(engine.register_user(u.id, u.name).await)?;
        }
        for p in self.performances {
            report.count(engine.register_performance(p.id, p.name).await)?;
        }
        for s in self.session_kinds {
            report.count(engine.register_session_kind(s.id, s.name).await)?;
        }
        for r in self.resources {
            report.count(
                engine
                    .create_resource(r.id, r.name, r.category, r.is_available)
                    .await,
            )?;
        }
        for team in self.teams {
            let existing = engine.list_teams(Some(team.performance_id)).await;
            if existing.iter().any(|t| t.fields.name == team.fields.name) {
                report.skipped += 1;
                continue;
            }
            engine.create_team(team).await?;
            report.created += 1;
        }
        info!(
            "seed applied: {} created, {} skipped",
            report.created, report.skipped
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("encore_test_seed");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const SEED: &str = r#"{
        "users": [
            {"id": "01JBQ0000000000000000000A1", "name": "Alice"},
            {"id": "01JBQ0000000000000000000A2", "name": "Bob"}
        ],
        "performances": [{"id": "01JBQ00000000000000000000P", "name": "Spring Concert"}],
        "session_kinds": [{"id": "01JBQ00000000000000000000S", "name": "Guitar"}],
        "resources": [
            {"id": "01JBQ00000000000000000000R", "name": "Room A", "category": "ROOM", "is_available": true}
        ],
        "teams": [{
            "performance_id": "01JBQ00000000000000000000P",
            "leader_id": "01JBQ0000000000000000000A1",
            "name": "The Band",
            "song_name": "Song",
            "song_artist": "Artist",
            "is_freshmen_fixed": false,
            "is_self_made": true,
            "sessions": [{
                "session_id": "01JBQ00000000000000000000S",
                "capacity": 2,
                "members": [{"user_id": "01JBQ0000000000000000000A1", "index": 1}]
            }]
        }]
    }"#;

    #[test]
    fn missing_sections_default_to_empty() {
        let seed = SeedFile::parse(r#"{"users": []}"#).unwrap();
        assert!(seed.resources.is_empty());
        assert!(seed.teams.is_empty());
    }

    #[tokio::test]
    async fn seeding_twice_skips_existing_entries() {
        let engine = Engine::new(test_wal_path("twice.wal")).unwrap();

        let first = SeedFile::parse(SEED).unwrap().load_into(&engine).await.unwrap();
        assert_eq!(first, SeedReport { created: 6, skipped: 0 });

        let second = SeedFile::parse(SEED).unwrap().load_into(&engine).await.unwrap();
        assert_eq!(second, SeedReport { created: 0, skipped: 6 });

        let teams = engine.list_teams(None).await;
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].leader.name, "Alice");
        assert_eq!(teams[0].sessions[0].members.len(), 1);
    }

    #[tokio::test]
    async fn team_with_unknown_leader_aborts_seeding() {
        let engine = Engine::new(test_wal_path("bad_leader.wal")).unwrap();
        let json = SEED.replace(
            r#""leader_id": "01JBQ0000000000000000000A1""#,
            r#""leader_id": "01JBQ0000000000000000000A9""#,
        );
        let err = SeedFile::parse(&json)
            .unwrap()
            .load_into(&engine)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingReference { entity: "leader", .. }));
    }
}
