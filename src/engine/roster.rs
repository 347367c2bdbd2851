//! Seat allocation on team rosters.
//!
//! `apply` validates a whole application against the roster before writing
//! anything, so a request for two seats where only one is free leaves the
//! roster untouched. Both operations run under the team's write lock.

use std::collections::HashSet;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, ROSTER_TOTAL};

use super::{Engine, EngineError};

/// Check every requested seat against the current roster, in request order:
/// the session must be on the team, the seat must be free, and the index must
/// lie in `[1, capacity]`. Returns the resolved `(team_session_id, index)`
/// pairs; nothing is mutated.
pub fn validate_application(
    team: &TeamState,
    requests: &[SeatRequest],
) -> Result<Vec<(Ulid, u32)>, EngineError> {
    if requests.is_empty() {
        return Err(EngineError::MalformedBatch("application names no seats"));
    }
    if requests.len() > MAX_BATCH_SIZE {
        return Err(EngineError::LimitExceeded("application too large"));
    }

    let mut resolved = Vec::with_capacity(requests.len());
    let mut requested = HashSet::new();
    for req in requests {
        let session = team
            .session_by_kind(req.session_id)
            .ok_or(EngineError::UnknownSession(req.session_id))?;
        if session.occupant(req.index).is_some() {
            return Err(EngineError::SlotFilled {
                session_id: req.session_id,
                index: req.index,
            });
        }
        if req.index < 1 || req.index > session.capacity {
            return Err(EngineError::CapacityExceeded {
                session_id: req.session_id,
                capacity: session.capacity,
            });
        }
        if !requested.insert((session.id, req.index)) {
            return Err(EngineError::MalformedBatch("seat requested twice"));
        }
        resolved.push((session.id, req.index));
    }
    Ok(resolved)
}

impl Engine {
    pub async fn apply_to_team(
        &self,
        team_id: Ulid,
        user_id: Ulid,
        requests: &[SeatRequest],
    ) -> Result<TeamInfo, EngineError> {
        let result = self.try_apply_to_team(team_id, user_id, requests).await;
        observability::record_outcome(ROSTER_TOTAL, "apply", &result);
        result
    }

    async fn try_apply_to_team(
        &self,
        team_id: Ulid,
        user_id: Ulid,
        requests: &[SeatRequest],
    ) -> Result<TeamInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_team(team_id).await?;
        if !self.catalog.has_user(&user_id) {
            return Err(EngineError::not_found("user", user_id));
        }

        let seats = match validate_application(&guard, requests) {
            Ok(seats) => seats,
            Err(e) => {
                debug!("application by {user_id} to team {team_id} rejected: {e}");
                return Err(e);
            }
        };

        let event = Event::SeatsTaken {
            team_id,
            seats: seats
                .into_iter()
                .map(|(team_session_id, index)| SeatGrant {
                    team_session_id,
                    member: TeamMember {
                        id: Ulid::new(),
                        user_id,
                        index,
                    },
                })
                .collect(),
        };
        self.persist_and_apply_team(&mut guard, &event).await?;
        info!("user {user_id} joined team {team_id} ({} seats)", requests.len());
        Ok(self.team_info(&guard))
    }

    /// Drop every seat the user holds anywhere on the team.
    pub async fn leave_team(&self, team_id: Ulid, user_id: Ulid) -> Result<TeamInfo, EngineError> {
        let result = self.try_leave_team(team_id, user_id).await;
        observability::record_outcome(ROSTER_TOTAL, "leave", &result);
        result
    }

    async fn try_leave_team(&self, team_id: Ulid, user_id: Ulid) -> Result<TeamInfo, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_team(team_id).await?;
        if !guard.is_member(user_id) {
            return Err(EngineError::NotAMember(user_id));
        }
        let event = Event::SeatsReleased { team_id, user_id };
        self.persist_and_apply_team(&mut guard, &event).await?;
        info!("user {user_id} left team {team_id}");
        Ok(self.team_info(&guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team(sessions: Vec<TeamSession>) -> TeamState {
        TeamState {
            id: Ulid::new(),
            performance_id: Ulid::new(),
            leader_id: Ulid::new(),
            fields: TeamFields {
                name: "Band".into(),
                description: None,
                poster_image: None,
                song_name: "Song".into(),
                song_artist: "Artist".into(),
                song_video_url: None,
                is_freshmen_fixed: false,
                is_self_made: false,
            },
            created_at: 0,
            sessions,
        }
    }

    fn session(kind: Ulid, capacity: u32, taken: &[u32]) -> TeamSession {
        TeamSession {
            id: Ulid::new(),
            session_kind_id: kind,
            capacity,
            members: taken
                .iter()
                .map(|&index| TeamMember {
                    id: Ulid::new(),
                    user_id: Ulid::new(),
                    index,
                })
                .collect(),
        }
    }

    fn seat(session_id: Ulid, index: u32) -> SeatRequest {
        SeatRequest { session_id, index }
    }

    #[test]
    fn free_seats_resolve_to_team_sessions() {
        let guitar = Ulid::new();
        let vocal = Ulid::new();
        let t = team(vec![session(guitar, 2, &[1]), session(vocal, 1, &[])]);
        let resolved = validate_application(&t, &[seat(guitar, 2), seat(vocal, 1)]).unwrap();
        assert_eq!(resolved, vec![(t.sessions[0].id, 2), (t.sessions[1].id, 1)]);
    }

    #[test]
    fn unknown_session_is_named() {
        let t = team(vec![session(Ulid::new(), 2, &[])]);
        let stranger = Ulid::new();
        let err = validate_application(&t, &[seat(stranger, 1)]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownSession(id) if id == stranger));
    }

    #[test]
    fn filled_seat_rejected() {
        let kind = Ulid::new();
        let t = team(vec![session(kind, 2, &[1])]);
        let err = validate_application(&t, &[seat(kind, 1)]).unwrap_err();
        assert!(matches!(err, EngineError::SlotFilled { index: 1, .. }));
    }

    #[test]
    fn index_outside_capacity_rejected() {
        let kind = Ulid::new();
        let t = team(vec![session(kind, 2, &[])]);
        for index in [0, 3] {
            let err = validate_application(&t, &[seat(kind, index)]).unwrap_err();
            assert!(matches!(err, EngineError::CapacityExceeded { capacity: 2, .. }));
        }
    }

    #[test]
    fn any_bad_item_fails_the_batch() {
        let guitar = Ulid::new();
        let drums = Ulid::new();
        let t = team(vec![session(guitar, 2, &[]), session(drums, 1, &[1])]);
        let err = validate_application(&t, &[seat(guitar, 1), seat(drums, 1)]).unwrap_err();
        assert!(matches!(err, EngineError::SlotFilled { .. }));
    }

    #[test]
    fn duplicate_and_empty_batches_are_malformed() {
        let kind = Ulid::new();
        let t = team(vec![session(kind, 2, &[])]);
        assert!(matches!(
            validate_application(&t, &[seat(kind, 1), seat(kind, 1)]),
            Err(EngineError::MalformedBatch(_))
        ));
        assert!(matches!(
            validate_application(&t, &[]),
            Err(EngineError::MalformedBatch(_))
        ));
    }

    #[test]
    fn oversized_batch_rejected() {
        let kind = Ulid::new();
        let t = team(vec![session(kind, MAX_CAPACITY, &[])]);
        let requests: Vec<_> = (1..=MAX_BATCH_SIZE as u32 + 1).map(|i| seat(kind, i)).collect();
        assert!(matches!(
            validate_application(&t, &requests),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
