use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, TEAMS_TOTAL};

use super::conflict::now_ms;
use super::{Engine, EngineError};

fn check_fields(fields: &TeamFields) -> Result<(), EngineError> {
    if [&fields.name, &fields.song_name, &fields.song_artist]
        .iter()
        .any(|s| s.len() > MAX_NAME_LEN)
    {
        return Err(EngineError::LimitExceeded("team field too long"));
    }
    let optional = [
        &fields.description,
        &fields.poster_image,
        &fields.song_video_url,
    ];
    if optional.iter().flat_map(|s| s.as_deref()).any(|s| s.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("team field too long"));
    }
    Ok(())
}

fn ensure_leader(team: &TeamState, caller_id: Ulid, caller_is_admin: bool) -> Result<(), EngineError> {
    if caller_is_admin || team.leader_id == caller_id {
        Ok(())
    } else {
        Err(EngineError::Forbidden("only the team leader or an admin may change a team"))
    }
}

impl Engine {
    /// Materialise a bulk roster. References must exist, but seat occupancy
    /// and capacity are taken as given: this path is for trusted input only.
    fn build_sessions(&self, seeds: Vec<SessionSeed>) -> Result<Vec<TeamSession>, EngineError> {
        if seeds.len() > MAX_SESSIONS_PER_TEAM {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        seeds
            .into_iter()
            .map(|seed| {
                if self.catalog.session_kind(&seed.session_id).is_none() {
                    return Err(EngineError::MissingReference {
                        entity: "session",
                        id: seed.session_id,
                    });
                }
                if seed.capacity < 1 {
                    return Err(EngineError::MalformedBatch("session capacity must be at least 1"));
                }
                if seed.capacity > MAX_CAPACITY {
                    return Err(EngineError::LimitExceeded("session capacity too large"));
                }
                if let Some(m) = seed.members.iter().find(|m| !self.catalog.has_user(&m.user_id)) {
                    return Err(EngineError::MissingReference {
                        entity: "user",
                        id: m.user_id,
                    });
                }
                let mut members: Vec<TeamMember> = seed
                    .members
                    .into_iter()
                    .map(|m| TeamMember {
                        id: Ulid::new(),
                        user_id: m.user_id,
                        index: m.index,
                    })
                    .collect();
                members.sort_by_key(|m| m.index);
                Ok(TeamSession {
                    id: Ulid::new(),
                    session_kind_id: seed.session_id,
                    capacity: seed.capacity,
                    members,
                })
            })
            .collect()
    }

    pub(super) fn team_info(&self, team: &TeamState) -> TeamInfo {
        TeamInfo {
            id: team.id,
            performance: self
                .catalog
                .performance(&team.performance_id)
                .unwrap_or(PerformanceInfo {
                    id: team.performance_id,
                    name: String::new(),
                }),
            leader: self.catalog.user_or_placeholder(team.leader_id),
            fields: team.fields.clone(),
            created_at: team.created_at,
            sessions: team
                .sessions
                .iter()
                .map(|s| TeamSessionInfo {
                    id: s.id,
                    session: self
                        .catalog
                        .session_kind(&s.session_kind_id)
                        .unwrap_or(SessionKindInfo {
                            id: s.session_kind_id,
                            name: String::new(),
                        }),
                    capacity: s.capacity,
                    members: s
                        .members
                        .iter()
                        .map(|m| TeamMemberInfo {
                            id: m.id,
                            user: self.catalog.user_or_placeholder(m.user_id),
                            index: m.index,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub async fn create_team(&self, new: NewTeam) -> Result<TeamInfo, EngineError> {
        let result = self.try_create_team(new).await;
        observability::record_outcome(TEAMS_TOTAL, "create", &result);
        result
    }

    async fn try_create_team(&self, new: NewTeam) -> Result<TeamInfo, EngineError> {
        check_fields(&new.fields)?;
        if self.catalog.performance(&new.performance_id).is_none() {
            return Err(EngineError::MissingReference {
                entity: "performance",
                id: new.performance_id,
            });
        }
        if !self.catalog.has_user(&new.leader_id) {
            return Err(EngineError::MissingReference {
                entity: "leader",
                id: new.leader_id,
            });
        }
        let sessions = self.build_sessions(new.sessions)?;

        let _gate = self.compaction_gate.read().await;
        let team = TeamState {
            id: Ulid::new(),
            performance_id: new.performance_id,
            leader_id: new.leader_id,
            fields: new.fields,
            created_at: now_ms(),
            sessions,
        };
        let id = team.id;
        self.wal_append(&Event::TeamCreated {
            id,
            performance_id: team.performance_id,
            leader_id: team.leader_id,
            fields: team.fields.clone(),
            created_at: team.created_at,
            sessions: team.sessions.clone(),
        })
        .await?;
        let info = self.team_info(&team);
        self.teams.insert(id, Arc::new(RwLock::new(team)));
        info!("team {id} created for performance {}", info.performance.id);
        Ok(info)
    }

    pub async fn get_team(&self, id: Ulid) -> Result<TeamInfo, EngineError> {
        let ts = self
            .team_arc(&id)
            .ok_or(EngineError::not_found("team", id))?;
        let guard = ts.read().await;
        Ok(self.team_info(&guard))
    }

    /// Teams, newest first, optionally limited to one performance.
    pub async fn list_teams(&self, performance_id: Option<Ulid>) -> Vec<TeamInfo> {
        let teams: Vec<_> = self.teams.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(teams.len());
        for ts in teams {
            let guard = ts.read().await;
            if performance_id.is_none_or(|p| guard.performance_id == p) {
                out.push(self.team_info(&guard));
            }
        }
        out.sort_by_key(|t| std::cmp::Reverse((t.created_at, t.id)));
        out
    }

    pub async fn update_team(
        &self,
        id: Ulid,
        patch: TeamPatch,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<TeamInfo, EngineError> {
        let result = self
            .try_update_team(id, patch, caller_id, caller_is_admin)
            .await;
        observability::record_outcome(TEAMS_TOTAL, "update", &result);
        result
    }

    async fn try_update_team(
        &self,
        id: Ulid,
        patch: TeamPatch,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<TeamInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_team(id).await?;
        ensure_leader(&guard, caller_id, caller_is_admin)?;

        let fields = patch.merge_into(&guard.fields);
        check_fields(&fields)?;
        let sessions = match patch.sessions {
            Some(seeds) => Some(self.build_sessions(seeds)?),
            None => None,
        };
        let replaces_roster = sessions.is_some();
        let event = Event::TeamUpdated {
            id,
            fields,
            sessions,
        };
        self.persist_and_apply_team(&mut guard, &event).await?;
        info!("team {id} updated (roster replaced: {replaces_roster})");
        Ok(self.team_info(&guard))
    }

    pub async fn remove_team(
        &self,
        id: Ulid,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<(), EngineError> {
        let result = self.try_remove_team(id, caller_id, caller_is_admin).await;
        observability::record_outcome(TEAMS_TOTAL, "remove", &result);
        result
    }

    async fn try_remove_team(
        &self,
        id: Ulid,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let guard = self.lock_team(id).await?;
        ensure_leader(&guard, caller_id, caller_is_admin)?;

        self.wal_append(&Event::TeamRemoved { id }).await?;
        // Removed while still locked: waiters re-check the map and see NotFound.
        self.teams.remove(&id);
        drop(guard);
        info!("team {id} removed");
        Ok(())
    }
}
