use std::collections::HashSet;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, RESERVATIONS_TOTAL};

use super::conflict::{check_no_conflict, has_conflict, validate_span};
use super::{Engine, EngineError, apply_to_resource};

fn check_title(title: &str) -> Result<(), EngineError> {
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

fn ensure_participant(
    reservation: &Reservation,
    caller_id: Ulid,
    caller_is_admin: bool,
) -> Result<(), EngineError> {
    if caller_is_admin || reservation.has_participant(caller_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(
            "only participants or an admin may change a reservation",
        ))
    }
}

impl Engine {
    /// Deduplicate, bound and existence-check a participant list.
    fn resolve_participants(&self, ids: Vec<Ulid>) -> Result<Vec<Ulid>, EngineError> {
        let mut seen = HashSet::new();
        let participants: Vec<Ulid> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
        if participants.is_empty() {
            return Err(EngineError::MalformedBatch(
                "a reservation needs at least one participant",
            ));
        }
        if participants.len() > MAX_PARTICIPANTS {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        if let Some(missing) = participants.iter().find(|id| !self.catalog.has_user(id)) {
            return Err(EngineError::not_found("user", *missing));
        }
        Ok(participants)
    }

    fn reservation_info(&self, resource: &ResourceInfo, r: &Reservation) -> ReservationInfo {
        ReservationInfo {
            id: r.id,
            resource: resource.clone(),
            title: r.title.clone(),
            start: r.span.start,
            end: r.span.end,
            participants: r
                .participants
                .iter()
                .map(|id| self.catalog.user_or_placeholder(*id))
                .collect(),
        }
    }

    /// True if `[start, end)` overlaps a live reservation on the resource,
    /// ignoring `exclude`.
    pub async fn has_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = validate_span(start, end)?;
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        Ok(has_conflict(&guard, &span, exclude))
    }

    pub async fn create_reservation(
        &self,
        resource_id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        participants: Vec<Ulid>,
    ) -> Result<ReservationInfo, EngineError> {
        let result = self
            .try_create_reservation(resource_id, title, start, end, participants)
            .await;
        observability::record_outcome(RESERVATIONS_TOTAL, "create", &result);
        result
    }

    async fn try_create_reservation(
        &self,
        resource_id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        participants: Vec<Ulid>,
    ) -> Result<ReservationInfo, EngineError> {
        check_title(&title)?;
        let _gate = self.compaction_gate.read().await;
        let rs = self.resource(resource_id)?;
        let participants = self.resolve_participants(participants)?;
        let span = validate_span(start, end)?;

        // Check and write under the resource's lock: concurrent creates on
        // overlapping spans serialize here.
        let mut guard = rs.write().await;
        if !guard.info.is_available {
            return Err(EngineError::ResourceDisabled(resource_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many reservations on resource"));
        }
        if let Err(e) = check_no_conflict(&guard, &span, None) {
            debug!("reservation on {resource_id} [{start}, {end}) rejected: {e}");
            return Err(e);
        }

        let id = Ulid::new();
        let reservation = Reservation {
            id,
            resource_id,
            title,
            span,
            participants,
        };
        let event = Event::ReservationCreated {
            id,
            resource_id,
            title: reservation.title.clone(),
            span,
            participants: reservation.participants.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} created on {resource_id} [{start}, {end})");
        Ok(self.reservation_info(&guard.info, &reservation))
    }

    /// Reservations matching `filter`, ordered by start ascending.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<ReservationInfo> {
        let candidates: Vec<_> = match filter.resource_id {
            Some(id) => self.resource_arc(&id).into_iter().collect(),
            None => self.resources.iter().map(|e| e.value().clone()).collect(),
        };

        let mut out = Vec::new();
        for rs in candidates {
            let guard = rs.read().await;
            if filter.kind.is_some_and(|k| guard.info.category.kind() != k) {
                continue;
            }
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| filter.matches_window(&r.span))
                    .map(|r| self.reservation_info(&guard.info, r)),
            );
        }
        out.sort_by_key(|r| (r.start, r.id));
        out
    }

    /// Reservations the user takes part in, most recent start first.
    pub async fn list_user_reservations(&self, user_id: Ulid) -> Vec<ReservationInfo> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.has_participant(user_id))
                    .map(|r| self.reservation_info(&guard.info, r)),
            );
        }
        out.sort_by_key(|r| std::cmp::Reverse((r.start, r.id)));
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let resource_id = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found("reservation", id))?;
        let rs = self.resource(resource_id)?;
        let guard = rs.read().await;
        let reservation = guard
            .reservation(id)
            .ok_or(EngineError::not_found("reservation", id))?;
        Ok(self.reservation_info(&guard.info, reservation))
    }

    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<ReservationInfo, EngineError> {
        let result = self
            .try_update_reservation(id, patch, caller_id, caller_is_admin)
            .await;
        observability::record_outcome(RESERVATIONS_TOTAL, "update", &result);
        result
    }

    async fn try_update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<ReservationInfo, EngineError> {
        if let Some(title) = &patch.title {
            check_title(title)?;
        }
        let reschedules = patch.reschedules();
        let _gate = self.compaction_gate.read().await;

        let (mut current, mut target) = self.lock_reservation_move(id, patch.resource_id).await?;
        let previous_resource_id = current.info.id;
        let resource_id = target.as_ref().map_or(previous_resource_id, |t| t.info.id);

        let Some(existing) = current.reservation(id).cloned() else {
            return Err(EngineError::not_found("reservation", id));
        };
        ensure_participant(&existing, caller_id, caller_is_admin)?;

        let participants = match patch.participants {
            Some(ids) => self.resolve_participants(ids)?,
            None => existing.participants.clone(),
        };
        let span = validate_span(
            patch.start.unwrap_or(existing.span.start),
            patch.end.unwrap_or(existing.span.end),
        )?;

        let destination = target.as_deref().unwrap_or(&*current);
        if target.is_some() && !destination.info.is_available {
            return Err(EngineError::ResourceDisabled(resource_id));
        }
        if reschedules {
            if let Err(e) = check_no_conflict(destination, &span, Some(id)) {
                debug!("reservation {id} reschedule to {resource_id} rejected: {e}");
                return Err(e);
            }
        }

        let updated = Reservation {
            id,
            resource_id,
            title: patch.title.unwrap_or(existing.title),
            span,
            participants,
        };
        let event = Event::ReservationUpdated {
            id,
            previous_resource_id,
            resource_id,
            title: updated.title.clone(),
            span,
            participants: updated.participants.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_resource(&mut current, &event, &self.reservation_index);
        let info = match target.as_mut() {
            Some(t) => {
                apply_to_resource(t, &event, &self.reservation_index);
                self.reservation_info(&t.info, &updated)
            }
            None => self.reservation_info(&current.info, &updated),
        };
        info!("reservation {id} updated");
        Ok(info)
    }

    pub async fn remove_reservation(
        &self,
        id: Ulid,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<(), EngineError> {
        let result = self.try_remove_reservation(id, caller_id, caller_is_admin).await;
        observability::record_outcome(RESERVATIONS_TOTAL, "remove", &result);
        result
    }

    async fn try_remove_reservation(
        &self,
        id: Ulid,
        caller_id: Ulid,
        caller_is_admin: bool,
    ) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut guard = self.lock_reservation(id).await?;
        let Some(existing) = guard.reservation(id) else {
            return Err(EngineError::not_found("reservation", id));
        };
        ensure_participant(existing, caller_id, caller_is_admin)?;

        let event = Event::ReservationRemoved {
            id,
            resource_id: guard.info.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("reservation {id} removed");
        Ok(())
    }
}
