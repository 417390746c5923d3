use mongodb::error::Error as MongoError;
use thiserror::Error;
use uuid::Uuid;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping health check failed")]
    HealthPing {
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to load quiz `{id}`")]
    LoadQuiz {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to save session `{id}`")]
    SaveSession {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load session `{id}`")]
    LoadSession {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to look up session by invitation code")]
    LookupCode {
        #[source]
        source: MongoError,
    },
    #[error("failed to save participation `{id}`")]
    SaveParticipation {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load participation `{id}`")]
    LoadParticipation {
        id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to write response rows of participation `{participation_id}`")]
    SaveResponses {
        participation_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to close question `{question_id}` of session `{session_id}`")]
    CloseQuestion {
        session_id: Uuid,
        question_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load participations of session `{session_id}`")]
    LoadParticipations {
        session_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to grade response of participation `{participation_id}`")]
    GradeResponse {
        participation_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("failed to load responses of session `{session_id}`")]
    LoadResponses {
        session_id: Uuid,
        #[source]
        source: MongoError,
    },
    #[error("malformed document in `{collection}`: {message}")]
    Malformed {
        collection: &'static str,
        message: String,
    },
}
