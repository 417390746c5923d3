use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{MongoDaoError, MongoResult};
use crate::dao::models::{
    ParticipationEntity, QuestionEntity, QuestionType, QuizEntity, ResponseEntity, SessionEntity,
};

pub const QUIZ_COLLECTION: &str = "quizzes";
pub const QUESTION_COLLECTION: &str = "questions";
pub const SESSION_COLLECTION: &str = "sessions";
pub const PARTICIPATION_COLLECTION: &str = "participations";
pub const RESPONSE_COLLECTION: &str = "responses";

/// Identifiers are stored as their hyphenated string form so filters stay readable.
pub fn parse_id(collection: &'static str, raw: &str) -> MongoResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| MongoDaoError::Malformed {
        collection,
        message: format!("invalid identifier `{raw}`: {err}"),
    })
}

fn parse_optional_id(collection: &'static str, raw: Option<&str>) -> MongoResult<Option<Uuid>> {
    raw.map(|value| parse_id(collection, value)).transpose()
}

fn keys_to_doc(keys: &[usize]) -> Vec<i64> {
    keys.iter().map(|&key| key as i64).collect()
}

fn keys_from_doc(keys: &[i64]) -> Vec<usize> {
    keys.iter()
        .filter_map(|&key| usize::try_from(key).ok())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoQuizDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub owner_id: String,
    pub title: String,
}

impl TryFrom<MongoQuizDocument> for QuizEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoQuizDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(QUIZ_COLLECTION, &value.id)?,
            owner_id: parse_id(QUIZ_COLLECTION, &value.owner_id)?,
            title: value.title,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoQuestionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub quiz_id: String,
    pub order_index: i64,
    pub text: String,
    pub options: Vec<String>,
    pub correct_keys: Vec<i64>,
    pub question_type: QuestionType,
    pub duration_secs: i64,
    pub points_weight: i64,
    #[serde(default)]
    pub media_url: Option<String>,
}

impl TryFrom<MongoQuestionDocument> for QuestionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoQuestionDocument) -> MongoResult<Self> {
        let number = |field: &str, raw: i64| {
            u32::try_from(raw).map_err(|_| MongoDaoError::Malformed {
                collection: QUESTION_COLLECTION,
                message: format!("field `{field}` out of range: {raw}"),
            })
        };

        Ok(Self {
            id: parse_id(QUESTION_COLLECTION, &value.id)?,
            quiz_id: parse_id(QUESTION_COLLECTION, &value.quiz_id)?,
            order_index: number("order_index", value.order_index)?,
            text: value.text,
            options: value.options,
            correct_keys: keys_from_doc(&value.correct_keys),
            question_type: value.question_type,
            duration_secs: number("duration_secs", value.duration_secs)?,
            points_weight: number("points_weight", value.points_weight)?,
            media_url: value.media_url,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub quiz_id: String,
    pub admin_id: String,
    /// Absent (not null) while inactive so the unique partial index ignores it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitation_code: Option<i64>,
    pub is_active: bool,
    pub activated_from: Option<DateTime>,
    pub activated_to: Option<DateTime>,
    pub current_question_id: Option<String>,
    pub is_question_active: bool,
    pub created_at: DateTime,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id.to_string(),
            quiz_id: value.quiz_id.to_string(),
            admin_id: value.admin_id.to_string(),
            invitation_code: value.invitation_code.map(i64::from),
            is_active: value.is_active,
            activated_from: value.activated_from.map(DateTime::from_system_time),
            activated_to: value.activated_to.map(DateTime::from_system_time),
            current_question_id: value.current_question_id.map(|id| id.to_string()),
            is_question_active: value.is_question_active,
            created_at: DateTime::from_system_time(value.created_at),
        }
    }
}

impl TryFrom<MongoSessionDocument> for SessionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> MongoResult<Self> {
        let invitation_code = value
            .invitation_code
            .map(|code| {
                u32::try_from(code).map_err(|_| MongoDaoError::Malformed {
                    collection: SESSION_COLLECTION,
                    message: format!("invitation code out of range: {code}"),
                })
            })
            .transpose()?;

        Ok(Self {
            id: parse_id(SESSION_COLLECTION, &value.id)?,
            quiz_id: parse_id(SESSION_COLLECTION, &value.quiz_id)?,
            admin_id: parse_id(SESSION_COLLECTION, &value.admin_id)?,
            invitation_code,
            is_active: value.is_active,
            activated_from: value.activated_from.map(DateTime::to_system_time),
            activated_to: value.activated_to.map(DateTime::to_system_time),
            current_question_id: parse_optional_id(
                SESSION_COLLECTION,
                value.current_question_id.as_deref(),
            )?,
            is_question_active: value.is_question_active,
            created_at: value.created_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoParticipationDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub session_id: String,
    /// Absent for guests so the `(session_id, user_id)` unique index skips them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub display_name: String,
    pub is_host: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl From<ParticipationEntity> for MongoParticipationDocument {
    fn from(value: ParticipationEntity) -> Self {
        Self {
            id: value.id.to_string(),
            session_id: value.session_id.to_string(),
            user_id: value.user_id.map(|id| id.to_string()),
            display_name: value.display_name,
            is_host: value.is_host,
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
        }
    }
}

impl TryFrom<MongoParticipationDocument> for ParticipationEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoParticipationDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(PARTICIPATION_COLLECTION, &value.id)?,
            session_id: parse_id(PARTICIPATION_COLLECTION, &value.session_id)?,
            user_id: parse_optional_id(PARTICIPATION_COLLECTION, value.user_id.as_deref())?,
            display_name: value.display_name,
            is_host: value.is_host,
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

/// Response row; `session_id` is denormalised so closing a question is one update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoResponseDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub session_id: String,
    pub participation_id: String,
    pub question_id: String,
    pub submitted_keys: Vec<i64>,
    pub response_time_ms: Option<i64>,
    pub calculated_score: Option<i64>,
    pub is_graded: bool,
}

impl MongoResponseDocument {
    /// Build the document stored for `response`.
    pub fn new(session_id: Uuid, response: &ResponseEntity) -> Self {
        Self {
            id: response.id.to_string(),
            session_id: session_id.to_string(),
            participation_id: response.participation_id.to_string(),
            question_id: response.question_id.to_string(),
            submitted_keys: keys_to_doc(&response.submitted_keys),
            response_time_ms: response
                .response_time_ms
                .and_then(|ms| i64::try_from(ms).ok()),
            calculated_score: response.calculated_score,
            is_graded: response.is_graded,
        }
    }
}

impl TryFrom<MongoResponseDocument> for ResponseEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoResponseDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(RESPONSE_COLLECTION, &value.id)?,
            participation_id: parse_id(RESPONSE_COLLECTION, &value.participation_id)?,
            question_id: parse_id(RESPONSE_COLLECTION, &value.question_id)?,
            submitted_keys: keys_from_doc(&value.submitted_keys),
            response_time_ms: value
                .response_time_ms
                .and_then(|ms| u64::try_from(ms).ok()),
            calculated_score: value.calculated_score,
            is_graded: value.is_graded,
        })
    }
}

/// Convert grade keys for a `$set` update.
pub fn grade_keys(keys: &[usize]) -> Vec<i64> {
    keys_to_doc(keys)
}
