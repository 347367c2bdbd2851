use tokio::sync::oneshot;
use tracing::info;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL as the minimal event set that recreates current state:
    /// catalog, resources, live reservations, then teams with their rosters.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive: no mutation may be between its WAL append and its apply.
        let _gate = self.compaction_gate.write().await;

        let mut events = self.catalog.snapshot();

        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut reservations = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                id: guard.info.id,
                name: guard.info.name.clone(),
                category: guard.info.category,
                is_available: guard.info.is_available,
            });
            reservations.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                id: r.id,
                resource_id: r.resource_id,
                title: r.title.clone(),
                span: r.span,
                participants: r.participants.clone(),
            }));
        }
        events.append(&mut reservations);

        let teams: Vec<_> = self.teams.iter().map(|e| e.value().clone()).collect();
        for ts in teams {
            let guard = ts.read().await;
            events.push(Event::TeamCreated {
                id: guard.id,
                performance_id: guard.performance_id,
                leader_id: guard.leader_id,
                fields: guard.fields.clone(),
                created_at: guard.created_at,
                sessions: guard.sessions.clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
