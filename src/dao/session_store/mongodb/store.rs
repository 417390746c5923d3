use std::{sync::Arc, time::SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database, IndexModel,
    bson::{Bson, DateTime, Document, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::IndexOptions,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{
        MongoParticipationDocument, MongoQuestionDocument, MongoQuizDocument,
        MongoResponseDocument, MongoSessionDocument, PARTICIPATION_COLLECTION,
        QUESTION_COLLECTION, QUIZ_COLLECTION, RESPONSE_COLLECTION, SESSION_COLLECTION, grade_keys,
    },
};
use crate::dao::{
    models::{
        ActivationOutcome, Grade, ParticipationEntity, QuestionEntity, QuizEntity,
        ResponseEntity, ResponseRows, SessionEntity,
    },
    session_store::SessionStore,
    storage::StorageResult,
};

const DUPLICATE_KEY: i32 = 11000;

fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn id_filter(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

/// [`SessionStore`] backed by MongoDB.
///
/// Code uniqueness and participation uniqueness are enforced by unique partial
/// indexes, so a concurrent duplicate insert or activation fails server-side.
#[derive(Clone)]
pub struct MongoSessionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    database: RwLock<Database>,
    config: MongoConfig,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = self.database.read().await.clone();
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (_client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        *self.database.write().await = database;
        Ok(())
    }
}

impl MongoSessionStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (_client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let store = Self {
            inner: Arc::new(MongoInner {
                database: RwLock::new(database),
                config,
            }),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;

        let code_index = IndexModel::builder()
            .keys(doc! {"invitation_code": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("session_code_idx".to_owned()))
                    .unique(Some(true))
                    .partial_filter_expression(Some(doc! {"invitation_code": {"$exists": true}}))
                    .build(),
            )
            .build();
        database
            .collection::<Document>(SESSION_COLLECTION)
            .create_index(code_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SESSION_COLLECTION,
                index: "invitation_code",
                source,
            })?;

        let member_index = IndexModel::builder()
            .keys(doc! {"session_id": 1, "user_id": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("participation_member_idx".to_owned()))
                    .unique(Some(true))
                    .partial_filter_expression(Some(doc! {"user_id": {"$type": "string"}}))
                    .build(),
            )
            .build();
        database
            .collection::<Document>(PARTICIPATION_COLLECTION)
            .create_index(member_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: PARTICIPATION_COLLECTION,
                index: "session_id,user_id",
                source,
            })?;

        let response_index = IndexModel::builder()
            .keys(doc! {"participation_id": 1, "question_id": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("response_slot_idx".to_owned()))
                    .unique(Some(true))
                    .build(),
            )
            .build();
        let response_session_index = IndexModel::builder()
            .keys(doc! {"session_id": 1, "question_id": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("response_session_idx".to_owned()))
                    .build(),
            )
            .build();
        database
            .collection::<Document>(RESPONSE_COLLECTION)
            .create_indexes([response_index, response_session_index])
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: RESPONSE_COLLECTION,
                index: "participation_id,question_id",
                source,
            })?;

        let question_index = IndexModel::builder()
            .keys(doc! {"quiz_id": 1, "order_index": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("question_order_idx".to_owned()))
                    .build(),
            )
            .build();
        database
            .collection::<Document>(QUESTION_COLLECTION)
            .create_index(question_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: QUESTION_COLLECTION,
                index: "quiz_id,order_index",
                source,
            })?;

        Ok(())
    }

    async fn database(&self) -> Database {
        self.inner.database.read().await.clone()
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        self.database().await.collection(SESSION_COLLECTION)
    }

    async fn participations(&self) -> Collection<MongoParticipationDocument> {
        self.database().await.collection(PARTICIPATION_COLLECTION)
    }

    async fn responses(&self) -> Collection<MongoResponseDocument> {
        self.database().await.collection(RESPONSE_COLLECTION)
    }

    async fn find_quiz(&self, id: Uuid) -> MongoResult<Option<QuizEntity>> {
        let collection: Collection<MongoQuizDocument> =
            self.database().await.collection(QUIZ_COLLECTION);
        collection
            .find_one(id_filter(id))
            .await
            .map_err(|source| MongoDaoError::LoadQuiz { id, source })?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn questions_for_quiz(&self, quiz_id: Uuid) -> MongoResult<Vec<QuestionEntity>> {
        let collection: Collection<MongoQuestionDocument> =
            self.database().await.collection(QUESTION_COLLECTION);
        let documents: Vec<MongoQuestionDocument> = collection
            .find(doc! {"quiz_id": quiz_id.to_string()})
            .sort(doc! {"order_index": 1})
            .await
            .map_err(|source| MongoDaoError::LoadQuiz { id: quiz_id, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadQuiz { id: quiz_id, source })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_session(&self, session: SessionEntity) -> MongoResult<()> {
        let id = session.id;
        let document: MongoSessionDocument = session.into();
        self.sessions()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| MongoDaoError::SaveSession { id, source })?;
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> MongoResult<Option<SessionEntity>> {
        self.sessions()
            .await
            .find_one(id_filter(id))
            .await
            .map_err(|source| MongoDaoError::LoadSession { id, source })?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn find_active_by_code(&self, code: u32) -> MongoResult<Option<SessionEntity>> {
        self.sessions()
            .await
            .find_one(doc! {"invitation_code": i64::from(code), "is_active": true})
            .await
            .map_err(|source| MongoDaoError::LookupCode { source })?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn try_activate(
        &self,
        session_id: Uuid,
        admin_id: Uuid,
        code: u32,
        now: SystemTime,
    ) -> MongoResult<ActivationOutcome> {
        let filter = doc! {
            "_id": session_id.to_string(),
            "admin_id": admin_id.to_string(),
            "is_active": false,
            "activated_to": Bson::Null,
        };
        let update = doc! {
            "$set": {
                "is_active": true,
                "invitation_code": i64::from(code),
                "activated_from": DateTime::from_system_time(now),
            }
        };

        match self.sessions().await.update_one(filter, update).await {
            Ok(result) if result.matched_count == 1 => return Ok(ActivationOutcome::Activated),
            Ok(_) => {}
            Err(err) if is_duplicate_key(&err) => return Ok(ActivationOutcome::CodeTaken),
            Err(source) => return Err(MongoDaoError::SaveSession { id: session_id, source }),
        }

        // Nothing matched: classify why from the current document.
        let Some(current) = self.find_session(session_id).await? else {
            return Ok(ActivationOutcome::NotFound);
        };
        let outcome = if current.admin_id != admin_id {
            ActivationOutcome::NotOwner
        } else if current.activated_to.is_some() {
            ActivationOutcome::Closed
        } else if let (true, Some(existing)) = (current.is_active, current.invitation_code) {
            ActivationOutcome::AlreadyActive { code: existing }
        } else {
            // The document changed between the update and the read; let the caller retry.
            ActivationOutcome::CodeTaken
        };
        Ok(outcome)
    }

    async fn open_question(&self, session_id: Uuid, question_id: Uuid) -> MongoResult<()> {
        self.sessions()
            .await
            .update_one(
                id_filter(session_id),
                doc! {"$set": {
                    "current_question_id": question_id.to_string(),
                    "is_question_active": true,
                }},
            )
            .await
            .map_err(|source| MongoDaoError::SaveSession { id: session_id, source })?;
        Ok(())
    }

    async fn close_question(&self, session_id: Uuid, question_id: Uuid) -> MongoResult<u64> {
        let graded = self
            .responses()
            .await
            .update_many(
                doc! {
                    "session_id": session_id.to_string(),
                    "question_id": question_id.to_string(),
                    "is_graded": false,
                },
                doc! {"$set": {
                    "submitted_keys": Bson::Array(Vec::new()),
                    "calculated_score": 0_i64,
                    "is_graded": true,
                }},
            )
            .await
            .map_err(|source| MongoDaoError::CloseQuestion {
                session_id,
                question_id,
                source,
            })?;

        self.sessions()
            .await
            .update_one(
                id_filter(session_id),
                doc! {"$set": {
                    "current_question_id": Bson::Null,
                    "is_question_active": false,
                }},
            )
            .await
            .map_err(|source| MongoDaoError::SaveSession { id: session_id, source })?;

        Ok(graded.modified_count)
    }

    async fn deactivate(&self, session_id: Uuid, now: SystemTime) -> MongoResult<bool> {
        let result = self
            .sessions()
            .await
            .update_one(
                doc! {"_id": session_id.to_string(), "activated_to": Bson::Null},
                doc! {
                    "$set": {
                        "is_active": false,
                        "activated_to": DateTime::from_system_time(now),
                        "current_question_id": Bson::Null,
                        "is_question_active": false,
                    },
                    "$unset": {"invitation_code": ""},
                },
            )
            .await
            .map_err(|source| MongoDaoError::SaveSession { id: session_id, source })?;
        Ok(result.modified_count == 1)
    }

    async fn find_member(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> MongoResult<Option<ParticipationEntity>> {
        self.participations()
            .await
            .find_one(doc! {"session_id": session_id.to_string(), "user_id": user_id.to_string()})
            .await
            .map_err(|source| MongoDaoError::LoadParticipations { session_id, source })?
            .map(TryInto::try_into)
            .transpose()
    }

    /// Upsert the participant's response rows; existing rows are left untouched.
    async fn ensure_responses(
        &self,
        participation: &ParticipationEntity,
        rows: &ResponseRows,
    ) -> MongoResult<()> {
        let responses = self.responses().await;
        let missed = rows.missed.iter().map(|id| (*id, true));
        let pending = rows.pending.iter().map(|id| (*id, false));
        for (question_id, closed) in missed.chain(pending) {
            let score = if closed { Bson::Int64(0) } else { Bson::Null };
            responses
                .update_one(
                    doc! {
                        "participation_id": participation.id.to_string(),
                        "question_id": question_id.to_string(),
                    },
                    doc! {"$setOnInsert": {
                        "_id": Uuid::new_v4().to_string(),
                        "session_id": participation.session_id.to_string(),
                        "submitted_keys": Bson::Array(Vec::new()),
                        "response_time_ms": Bson::Null,
                        "calculated_score": score,
                        "is_graded": closed,
                    }},
                )
                .upsert(true)
                .await
                .map_err(|source| MongoDaoError::SaveResponses {
                    participation_id: participation.id,
                    source,
                })?;
        }
        Ok(())
    }

    async fn join_participation(
        &self,
        participation: ParticipationEntity,
        rows: ResponseRows,
    ) -> MongoResult<ParticipationEntity> {
        if let Some(user_id) = participation.user_id {
            if let Some(existing) = self.find_member(participation.session_id, user_id).await? {
                self.ensure_responses(&existing, &rows).await?;
                return Ok(existing);
            }
        }

        let document: MongoParticipationDocument = participation.clone().into();
        let joined = match self.participations().await.insert_one(&document).await {
            Ok(_) => participation,
            Err(err) if is_duplicate_key(&err) => {
                // Lost a race against the same user joining from another socket.
                let user_id = participation.user_id.unwrap_or_default();
                self.find_member(participation.session_id, user_id)
                    .await?
                    .ok_or_else(|| MongoDaoError::Malformed {
                        collection: PARTICIPATION_COLLECTION,
                        message: "duplicate participation vanished".into(),
                    })?
            }
            Err(source) => {
                return Err(MongoDaoError::SaveParticipation {
                    id: participation.id,
                    source,
                });
            }
        };

        self.ensure_responses(&joined, &rows).await?;
        Ok(joined)
    }

    async fn find_participation(&self, id: Uuid) -> MongoResult<Option<ParticipationEntity>> {
        self.participations()
            .await
            .find_one(id_filter(id))
            .await
            .map_err(|source| MongoDaoError::LoadParticipation { id, source })?
            .map(TryInto::try_into)
            .transpose()
    }

    async fn grade_response(
        &self,
        participation_id: Uuid,
        question_id: Uuid,
        grade: Grade,
    ) -> MongoResult<bool> {
        let response_time_ms = i64::try_from(grade.response_time_ms).unwrap_or(i64::MAX);
        let result = self
            .responses()
            .await
            .update_one(
                doc! {
                    "participation_id": participation_id.to_string(),
                    "question_id": question_id.to_string(),
                    "is_graded": false,
                },
                doc! {"$set": {
                    "submitted_keys": grade_keys(&grade.submitted_keys),
                    "response_time_ms": response_time_ms,
                    "calculated_score": grade.score,
                    "is_graded": true,
                }},
            )
            .await
            .map_err(|source| MongoDaoError::GradeResponse {
                participation_id,
                source,
            })?;
        Ok(result.modified_count == 1)
    }

    async fn list_participations(&self, session_id: Uuid) -> MongoResult<Vec<ParticipationEntity>> {
        let documents: Vec<MongoParticipationDocument> = self
            .participations()
            .await
            .find(doc! {"session_id": session_id.to_string()})
            .sort(doc! {"created_at": 1})
            .await
            .map_err(|source| MongoDaoError::LoadParticipations { session_id, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadParticipations { session_id, source })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_responses(&self, session_id: Uuid) -> MongoResult<Vec<ResponseEntity>> {
        let documents: Vec<MongoResponseDocument> = self
            .responses()
            .await
            .find(doc! {"session_id": session_id.to_string()})
            .await
            .map_err(|source| MongoDaoError::LoadResponses { session_id, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadResponses { session_id, source })?;

        documents.into_iter().map(TryInto::try_into).collect()
    }
}

impl SessionStore for MongoSessionStore {
    fn find_quiz(&self, quiz_id: Uuid) -> BoxFuture<'static, StorageResult<Option<QuizEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_quiz(quiz_id).await.map_err(Into::into) })
    }

    fn questions_for_quiz(
        &self,
        quiz_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<QuestionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.questions_for_quiz(quiz_id).await.map_err(Into::into) })
    }

    fn create_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.create_session(session).await.map_err(Into::into) })
    }

    fn find_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session(id).await.map_err(Into::into) })
    }

    fn find_active_by_code(
        &self,
        code: u32,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_active_by_code(code).await.map_err(Into::into) })
    }

    fn try_activate(
        &self,
        session_id: Uuid,
        admin_id: Uuid,
        code: u32,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<ActivationOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .try_activate(session_id, admin_id, code, now)
                .await
                .map_err(Into::into)
        })
    }

    fn open_question(
        &self,
        session_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .open_question(session_id, question_id)
                .await
                .map_err(Into::into)
        })
    }

    fn close_question(
        &self,
        session_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<u64>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .close_question(session_id, question_id)
                .await
                .map_err(Into::into)
        })
    }

    fn deactivate(
        &self,
        session_id: Uuid,
        now: SystemTime,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.deactivate(session_id, now).await.map_err(Into::into) })
    }

    fn join_participation(
        &self,
        participation: ParticipationEntity,
        rows: ResponseRows,
    ) -> BoxFuture<'static, StorageResult<ParticipationEntity>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .join_participation(participation, rows)
                .await
                .map_err(Into::into)
        })
    }

    fn find_participation(
        &self,
        id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipationEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_participation(id).await.map_err(Into::into) })
    }

    fn grade_response(
        &self,
        participation_id: Uuid,
        question_id: Uuid,
        grade: Grade,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .grade_response(participation_id, question_id, grade)
                .await
                .map_err(Into::into)
        })
    }

    fn list_participations(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipationEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_participations(session_id).await.map_err(Into::into) })
    }

    fn list_responses(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ResponseEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_responses(session_id).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            if store.inner.ping().await.is_ok() {
                return Ok(());
            }
            store.inner.reconnect().await.map_err(Into::into)
        })
    }
}
