//! Leaderboard projection computed on demand from the response ledger.

use std::collections::HashMap;

use uuid::Uuid;

use crate::{
    dao::{
        models::{ParticipationEntity, ResponseEntity},
        session_store::SessionStore,
    },
    dto::session::LeaderboardEntry,
    error::ServiceError,
};

#[derive(Default)]
struct Totals {
    score: i64,
    response_time_ms: u64,
    answered: u32,
}

/// Rank participants by total score, breaking ties by lower total response time.
///
/// Host participations are excluded. Participants without graded rows still
/// appear with a zero score.
pub fn project(
    participations: &[ParticipationEntity],
    responses: &[ResponseEntity],
) -> Vec<LeaderboardEntry> {
    let mut totals: HashMap<Uuid, Totals> = participations
        .iter()
        .filter(|p| !p.is_host)
        .map(|p| (p.id, Totals::default()))
        .collect();

    for response in responses.iter().filter(|r| r.is_graded) {
        let Some(entry) = totals.get_mut(&response.participation_id) else {
            continue;
        };
        entry.score += response.calculated_score.unwrap_or(0);
        if !response.submitted_keys.is_empty() {
            entry.response_time_ms += response.response_time_ms.unwrap_or(0);
            entry.answered += 1;
        }
    }

    let mut rows: Vec<(&ParticipationEntity, Totals)> = participations
        .iter()
        .filter_map(|p| totals.remove(&p.id).map(|t| (p, t)))
        .collect();
    // Stable sort keeps join order for complete ties.
    rows.sort_by(|(_, a), (_, b)| {
        b.score
            .cmp(&a.score)
            .then(a.response_time_ms.cmp(&b.response_time_ms))
    });

    rows.into_iter()
        .enumerate()
        .map(|(position, (participation, totals))| LeaderboardEntry {
            rank: position as u32 + 1,
            participation_id: participation.id,
            display_name: participation.display_name.clone(),
            score: totals.score,
            total_response_time_ms: totals.response_time_ms,
            answered: totals.answered,
        })
        .collect()
}

/// Load a consistent snapshot of the ledger and project it.
pub async fn for_session(
    store: &dyn SessionStore,
    session_id: Uuid,
) -> Result<Vec<LeaderboardEntry>, ServiceError> {
    let participations = store.list_participations(session_id).await?;
    let responses = store.list_responses(session_id).await?;
    Ok(project(&participations, &responses))
}
