use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Turn raw bounds into a span, rejecting `start >= end` and out-of-range values.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::checked(start, end).ok_or(EngineError::InvalidSpan { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// First live reservation on `rs` overlapping `span`, skipping `exclude`.
pub fn find_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(span)
        .find(|r| Some(r.id) != exclude)
        .map(|r| r.id)
}

/// Half-open overlap check against every reservation on one resource.
/// Touching intervals (one ends where the other starts) do not conflict.
pub fn has_conflict(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(rs, span, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(rs, span, exclude) {
        Some(id) => Err(EngineError::Conflict(id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::*;

    const H: Ms = 3_600_000;
    const DAY: Ms = 1_767_225_600_000; // 2026-01-01T00:00:00Z

    fn resource_with(spans: &[(Ms, Ms)]) -> (ResourceState, Vec<Ulid>) {
        let mut rs = ResourceState::new(ResourceInfo {
            id: Ulid::new(),
            name: "Drum kit".into(),
            category: EquipCategory::Drum,
            is_available: true,
        });
        let mut ids = Vec::new();
        for &(start, end) in spans {
            let id = Ulid::new();
            ids.push(id);
            rs.insert_reservation(Reservation {
                id,
                resource_id: rs.info.id,
                title: "session".into(),
                span: Span::new(start, end),
                participants: vec![Ulid::new()],
            });
        }
        (rs, ids)
    }

    #[test]
    fn afternoon_boundaries() {
        let (rs, ids) = resource_with(&[(DAY + 14 * H, DAY + 16 * H)]);
        // 15:00–17:00 overlaps 14:00–16:00
        let b = Span::new(DAY + 15 * H, DAY + 17 * H);
        assert!(has_conflict(&rs, &b, None));
        assert!(matches!(check_no_conflict(&rs, &b, None), Err(EngineError::Conflict(id)) if id == ids[0]));
        // 16:00–18:00 only touches
        let c = Span::new(DAY + 16 * H, DAY + 18 * H);
        assert!(!has_conflict(&rs, &c, None));
        // 12:00–14:00 touches from the other side
        let d = Span::new(DAY + 12 * H, DAY + 14 * H);
        assert!(!has_conflict(&rs, &d, None));
    }

    #[test]
    fn containment_in_both_directions_conflicts() {
        let (rs, _) = resource_with(&[(DAY + 10 * H, DAY + 12 * H)]);
        assert!(has_conflict(&rs, &Span::new(DAY + 9 * H, DAY + 13 * H), None));
        assert!(has_conflict(&rs, &Span::new(DAY + 10 * H + 1, DAY + 11 * H), None));
        assert!(has_conflict(&rs, &Span::new(DAY + 10 * H, DAY + 12 * H), None));
    }

    #[test]
    fn excluded_reservation_is_ignored() {
        let (rs, ids) = resource_with(&[(DAY, DAY + H), (DAY + 2 * H, DAY + 3 * H)]);
        let own = Span::new(DAY, DAY + H);
        assert!(has_conflict(&rs, &own, None));
        assert!(!has_conflict(&rs, &own, Some(ids[0])));
        // Stretching into the neighbour still conflicts with the neighbour.
        let stretched = Span::new(DAY, DAY + 2 * H + 1);
        assert_eq!(find_conflict(&rs, &stretched, Some(ids[0])), Some(ids[1]));
    }

    #[test]
    fn empty_resource_never_conflicts() {
        let (rs, _) = resource_with(&[]);
        assert!(!has_conflict(&rs, &Span::new(DAY, DAY + H), None));
    }

    #[test]
    fn overlap_predicate_matches_brute_force() {
        let existing = [(10, 20), (30, 40), (40, 45)];
        let (mut rs, _) = resource_with(&[]);
        for &(s, e) in &existing {
            rs.insert_reservation(Reservation {
                id: Ulid::new(),
                resource_id: rs.info.id,
                title: "x".into(),
                span: Span::new(DAY + s, DAY + e),
                participants: vec![Ulid::new()],
            });
        }
        for s in 0..50 {
            for e in (s + 1)..=50 {
                let expected = existing.iter().any(|&(s1, e1)| s1 < e && s < e1);
                let span = Span::new(DAY + s, DAY + e);
                assert_eq!(has_conflict(&rs, &span, None), expected, "[{s}, {e})");
            }
        }
    }

    #[test]
    fn validate_span_rejects_inverted_and_empty() {
        assert!(matches!(
            validate_span(DAY + H, DAY),
            Err(EngineError::InvalidSpan { .. })
        ));
        assert!(matches!(
            validate_span(DAY, DAY),
            Err(EngineError::InvalidSpan { .. })
        ));
        assert_eq!(validate_span(DAY, DAY + H).unwrap(), Span::new(DAY, DAY + H));
    }

    #[test]
    fn validate_span_limits() {
        assert!(matches!(
            validate_span(0, H),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        assert!(matches!(
            validate_span(DAY, DAY + MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
        assert!(validate_span(DAY, DAY + MAX_SPAN_DURATION_MS).is_ok());
    }
}
