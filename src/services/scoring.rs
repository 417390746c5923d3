//! Pure scoring rules for submitted answers.
//!
//! Nothing here touches the session or the store, so every rule is testable in
//! isolation and gives the same result for the same inputs.

use std::collections::BTreeSet;

use crate::dao::models::QuestionType;

/// Flat points for a correct (or survey) answer.
pub const BASE_POINTS: i64 = 500;
/// Maximum time bonus, awarded for an instant answer.
pub const TIME_BONUS_MAX: i64 = 400;
/// Base of the consecutive-answer bonus.
pub const STREAK_BASE: i64 = 100;
/// Percentage of [`STREAK_BASE`] added per streak step.
const STREAK_STEP_PERCENT: i64 = 10;

/// Everything the scoring rules look at for one submission.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub correct_keys: &'a [usize],
    pub submitted_keys: &'a [usize],
    pub response_time_ms: u64,
    pub duration_secs: u32,
    pub question_type: QuestionType,
    pub points_weight: u32,
    /// Consecutive positively scored answers before this one.
    pub streak: u32,
}

/// Result of scoring one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreOutcome {
    /// Points from the question rules alone.
    pub base_points: i64,
    /// Bonus earned from the running streak.
    pub streak_bonus: i64,
    /// `base_points + streak_bonus`; this is what gets persisted.
    pub earned_points: i64,
    pub new_streak: u32,
    /// Whether the submission counts as correct for display purposes.
    pub correct: bool,
}

impl ScoreOutcome {
    fn zero() -> Self {
        Self {
            base_points: 0,
            streak_bonus: 0,
            earned_points: 0,
            new_streak: 0,
            correct: false,
        }
    }
}

/// Bonus for answering early: `round(remainingSeconds × 400 / durationSec)`.
pub fn time_bonus(duration_secs: u32, response_time_ms: u64) -> i64 {
    if duration_secs == 0 {
        return 0;
    }
    let window_ms = i64::from(duration_secs) * 1000;
    let elapsed_ms = i64::try_from(response_time_ms).unwrap_or(i64::MAX);
    let remaining_secs = (window_ms.saturating_sub(elapsed_ms) as f64 / 1000.0).round();
    let bonus = (remaining_secs * TIME_BONUS_MAX as f64 / f64::from(duration_secs)).round();
    (bonus as i64).max(0)
}

/// Score one submission and advance the streak.
pub fn score(input: ScoreInput<'_>) -> ScoreOutcome {
    if input.submitted_keys.is_empty() {
        return ScoreOutcome::zero();
    }

    let submitted: BTreeSet<usize> = input.submitted_keys.iter().copied().collect();
    let correct: BTreeSet<usize> = input.correct_keys.iter().copied().collect();
    let full_credit = i64::from(input.points_weight) * 100
        + BASE_POINTS
        + time_bonus(input.duration_secs, input.response_time_ms);

    let (base_points, is_correct) = match input.question_type {
        QuestionType::SingleChoice => {
            let exact = correct.len() == 1 && submitted == correct;
            (if exact { full_credit } else { 0 }, exact)
        }
        QuestionType::Survey => (full_credit, true),
        QuestionType::MultiSelect => {
            let hits = submitted.intersection(&correct).count() as i64;
            (hits * i64::from(input.points_weight), submitted == correct)
        }
    };

    if base_points <= 0 {
        return ScoreOutcome {
            correct: is_correct,
            ..ScoreOutcome::zero()
        };
    }

    let streak_bonus = if input.streak > 0 {
        STREAK_BASE + STREAK_BASE * i64::from(input.streak) * STREAK_STEP_PERCENT / 100
    } else {
        0
    };

    ScoreOutcome {
        base_points,
        streak_bonus,
        earned_points: base_points + streak_bonus,
        new_streak: input.streak.saturating_add(1),
        correct: is_correct,
    }
}
