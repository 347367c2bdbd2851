use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Reference data ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquipCategory {
    Room,
    Synthesizer,
    Microphone,
    Guitar,
    Bass,
    Drum,
    AudioInterface,
    Cable,
    Amplifier,
    Speaker,
    Mixer,
    Etc,
}

impl EquipCategory {
    pub fn kind(self) -> ResourceKind {
        match self {
            EquipCategory::Room => ResourceKind::Room,
            _ => ResourceKind::Item,
        }
    }
}

/// Coarse split used by reservation listings: rooms vs. everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Room,
    Item,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceInfo {
    pub id: Ulid,
    pub name: String,
}

/// An instrument or role a team can field (vocal, guitar, drums, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKindInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub category: EquipCategory,
    /// Disabled resources keep their reservations but accept no new ones.
    pub is_available: bool,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub title: String,
    pub span: Span,
    pub participants: Vec<Ulid>,
}

impl Reservation {
    pub fn has_participant(&self, user_id: Ulid) -> bool {
        self.participants.contains(&user_id)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub info: ResourceInfo,
    /// Live reservations, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(info: ResourceInfo) -> Self {
        Self {
            info,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

// ── Teams ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamFields {
    pub name: String,
    pub description: Option<String>,
    pub poster_image: Option<String>,
    pub song_name: String,
    pub song_artist: String,
    pub song_video_url: Option<String>,
    #[serde(default)]
    pub is_freshmen_fixed: bool,
    #[serde(default)]
    pub is_self_made: bool,
}

/// One occupied seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: Ulid,
    pub user_id: Ulid,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSession {
    pub id: Ulid,
    pub session_kind_id: Ulid,
    pub capacity: u32,
    /// Sorted by `index`.
    pub members: Vec<TeamMember>,
}

impl TeamSession {
    pub fn occupant(&self, index: u32) -> Option<&TeamMember> {
        self.members
            .binary_search_by_key(&index, |m| m.index)
            .ok()
            .map(|pos| &self.members[pos])
    }

    /// Seat a member. Returns false, leaving the session untouched, if the
    /// index is already taken.
    pub fn occupy(&mut self, member: TeamMember) -> bool {
        match self.members.binary_search_by_key(&member.index, |m| m.index) {
            Ok(_) => false,
            Err(pos) => {
                self.members.insert(pos, member);
                true
            }
        }
    }

    pub fn vacate_user(&mut self, user_id: Ulid) -> usize {
        let before = self.members.len();
        self.members.retain(|m| m.user_id != user_id);
        before - self.members.len()
    }
}

#[derive(Debug, Clone)]
pub struct TeamState {
    pub id: Ulid,
    pub performance_id: Ulid,
    pub leader_id: Ulid,
    pub fields: TeamFields,
    pub created_at: Ms,
    pub sessions: Vec<TeamSession>,
}

impl TeamState {
    /// First team session fielding the given session kind.
    pub fn session_by_kind(&self, session_kind_id: Ulid) -> Option<&TeamSession> {
        self.sessions
            .iter()
            .find(|s| s.session_kind_id == session_kind_id)
    }

    pub fn session_mut(&mut self, team_session_id: Ulid) -> Option<&mut TeamSession> {
        self.sessions.iter_mut().find(|s| s.id == team_session_id)
    }

    pub fn is_member(&self, user_id: Ulid) -> bool {
        self.sessions
            .iter()
            .any(|s| s.members.iter().any(|m| m.user_id == user_id))
    }

    pub fn vacate_user(&mut self, user_id: Ulid) -> usize {
        self.sessions.iter_mut().map(|s| s.vacate_user(user_id)).sum()
    }
}

/// A seat granted by the roster allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatGrant {
    pub team_session_id: Ulid,
    pub member: TeamMember,
}

// ── Events ───────────────────────────────────────────────────────

/// The event types: flat, no nesting beyond value types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
    },
    PerformanceRegistered {
        id: Ulid,
        name: String,
    },
    SessionKindRegistered {
        id: Ulid,
        name: String,
    },
    ResourceCreated {
        id: Ulid,
        name: String,
        category: EquipCategory,
        is_available: bool,
    },
    ResourceAvailabilityChanged {
        id: Ulid,
        is_available: bool,
    },
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        title: String,
        span: Span,
        participants: Vec<Ulid>,
    },
    /// Full post-update state. `previous_resource_id` differs from
    /// `resource_id` when the reservation moved.
    ReservationUpdated {
        id: Ulid,
        previous_resource_id: Ulid,
        resource_id: Ulid,
        title: String,
        span: Span,
        participants: Vec<Ulid>,
    },
    ReservationRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    TeamCreated {
        id: Ulid,
        performance_id: Ulid,
        leader_id: Ulid,
        fields: TeamFields,
        created_at: Ms,
        sessions: Vec<TeamSession>,
    },
    /// `sessions` replaces the whole roster when present.
    TeamUpdated {
        id: Ulid,
        fields: TeamFields,
        sessions: Option<Vec<TeamSession>>,
    },
    TeamRemoved {
        id: Ulid,
    },
    SeatsTaken {
        team_id: Ulid,
        seats: Vec<SeatGrant>,
    },
    SeatsReleased {
        team_id: Ulid,
        user_id: Ulid,
    },
}

// ── Commands ─────────────────────────────────────────────────────

/// Partial reservation update. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReservationPatch {
    pub resource_id: Option<Ulid>,
    pub title: Option<String>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    /// Replaces the participant set, never merges.
    pub participants: Option<Vec<Ulid>>,
}

impl ReservationPatch {
    /// True if the reservation's place in time or its resource may change.
    pub fn reschedules(&self) -> bool {
        self.resource_id.is_some() || self.start.is_some() || self.end.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReservationFilter {
    pub kind: Option<ResourceKind>,
    pub resource_id: Option<Ulid>,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

impl ReservationFilter {
    /// Window match uses the same half-open overlap rule as the conflict checker;
    /// a missing bound is unbounded.
    pub fn matches_window(&self, span: &Span) -> bool {
        self.from.is_none_or(|from| span.end > from) && self.to.is_none_or(|to| span.start < to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SeatRequest {
    pub session_id: Ulid,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemberSeed {
    pub user_id: Ulid,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionSeed {
    pub session_id: Ulid,
    pub capacity: u32,
    #[serde(default)]
    pub members: Vec<MemberSeed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewTeam {
    pub performance_id: Ulid,
    pub leader_id: Ulid,
    #[serde(flatten)]
    pub fields: TeamFields,
    #[serde(default)]
    pub sessions: Vec<SessionSeed>,
}

/// Partial team update. Nullable fields take `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub poster_image: Option<Option<String>>,
    pub song_name: Option<String>,
    pub song_artist: Option<String>,
    pub song_video_url: Option<Option<String>>,
    pub is_freshmen_fixed: Option<bool>,
    pub is_self_made: Option<bool>,
    /// Wholesale roster replacement.
    pub sessions: Option<Vec<SessionSeed>>,
}

impl TeamPatch {
    pub fn merge_into(&self, current: &TeamFields) -> TeamFields {
        TeamFields {
            name: self.name.clone().unwrap_or_else(|| current.name.clone()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| current.description.clone()),
            poster_image: self
                .poster_image
                .clone()
                .unwrap_or_else(|| current.poster_image.clone()),
            song_name: self
                .song_name
                .clone()
                .unwrap_or_else(|| current.song_name.clone()),
            song_artist: self
                .song_artist
                .clone()
                .unwrap_or_else(|| current.song_artist.clone()),
            song_video_url: self
                .song_video_url
                .clone()
                .unwrap_or_else(|| current.song_video_url.clone()),
            is_freshmen_fixed: self.is_freshmen_fixed.unwrap_or(current.is_freshmen_fixed),
            is_self_made: self.is_self_made.unwrap_or(current.is_self_made),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub resource: ResourceInfo,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    pub participants: Vec<UserInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamMemberInfo {
    pub id: Ulid,
    pub user: UserInfo,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamSessionInfo {
    pub id: Ulid,
    pub session: SessionKindInfo,
    pub capacity: u32,
    pub members: Vec<TeamMemberInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamInfo {
    pub id: Ulid,
    pub performance: PerformanceInfo,
    pub leader: UserInfo,
    #[serde(flatten)]
    pub fields: TeamFields,
    pub created_at: Ms,
    pub sessions: Vec<TeamSessionInfo>,
}
