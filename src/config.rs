//! Application-level configuration loading: engine timings, the token directory and seed quizzes.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{QuestionEntity, QuestionType, QuizEntity},
    services::identity::Role,
};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "QUIZ_LIVE_CONFIG_PATH";

#[derive(Debug, Clone, Default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    pub engine: EngineConfig,
    pub users: Vec<UserConfig>,
    pub quizzes: Vec<SeedQuiz>,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json(&contents) {
                Ok(app_config) => {
                    info!(
                        path = %path.display(),
                        users = app_config.users.len(),
                        quizzes = app_config.quizzes.len(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a configuration document. Missing sections take their defaults.
    pub fn from_json(contents: &str) -> serde_json::Result<Self> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    engine: EngineConfig,
    users: Vec<UserConfig>,
    quizzes: Vec<SeedQuiz>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        Self {
            engine: value.engine,
            users: value.users,
            quizzes: value.quizzes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Timings of the live session engine.
pub struct EngineConfig {
    /// Delay between announcing a question and opening its answer window.
    pub countdown_secs: u64,
    /// How long results stay on screen before the next question; 0 waits for the admin.
    pub reveal_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Silent keep-alive intervals tolerated before a socket is dropped.
    pub keepalive_missed_limit: u32,
    /// Per-frame write timeout on a socket.
    pub send_timeout_ms: u64,
    /// How long a player socket may take to send its join frame.
    pub join_timeout_secs: u64,
    /// Upper bound on the storage work of one phase transition.
    pub transition_timeout_secs: u64,
    /// Delay before retrying a transition whose storage work failed.
    pub grading_retry_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 3,
            reveal_secs: 5,
            keepalive_interval_secs: 5,
            keepalive_missed_limit: 3,
            send_timeout_ms: 2000,
            join_timeout_secs: 10,
            transition_timeout_secs: 5,
            grading_retry_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn countdown(&self) -> Duration {
        Duration::from_secs(self.countdown_secs)
    }

    /// Reveal hold, or `None` when the admin advances manually.
    pub fn reveal(&self) -> Option<Duration> {
        (self.reveal_secs > 0).then(|| Duration::from_secs(self.reveal_secs))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.transition_timeout_secs)
    }

    pub fn grading_retry(&self) -> Duration {
        Duration::from_millis(self.grading_retry_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
/// One bearer token accepted by the built-in token directory.
pub struct UserConfig {
    pub token: String,
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
/// Quiz loaded into the in-memory store at startup.
pub struct SeedQuiz {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub questions: Vec<SeedQuestion>,
}

#[derive(Debug, Clone, Deserialize)]
/// Question of a [`SeedQuiz`], served in list order.
pub struct SeedQuestion {
    pub text: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_keys: Vec<usize>,
    #[serde(default = "default_question_type")]
    pub question_type: QuestionType,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u32,
    #[serde(default = "default_points_weight")]
    pub points_weight: u32,
    #[serde(default)]
    pub media_url: Option<String>,
}

impl SeedQuiz {
    /// Split the seed into the rows the store keeps.
    pub fn to_entities(&self) -> (QuizEntity, Vec<QuestionEntity>) {
        let quiz = QuizEntity {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title.clone(),
        };
        let questions = self
            .questions
            .iter()
            .enumerate()
            .map(|(position, question)| QuestionEntity {
                id: Uuid::new_v4(),
                quiz_id: self.id,
                order_index: position as u32,
                text: question.text.clone(),
                options: question.options.clone(),
                correct_keys: question.correct_keys.clone(),
                question_type: question.question_type,
                duration_secs: question.duration_secs,
                points_weight: question.points_weight,
                media_url: question.media_url.clone(),
            })
            .collect();
        (quiz, questions)
    }
}

fn default_question_type() -> QuestionType {
    QuestionType::SingleChoice
}

fn default_duration_secs() -> u32 {
    20
}

fn default_points_weight() -> u32 {
    10
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = AppConfig::from_json(r#"{"engine": {"reveal_secs": 0}}"#).unwrap();
        assert_eq!(config.engine.countdown_secs, 3);
        assert_eq!(config.engine.reveal(), None);
        assert!(config.users.is_empty());
    }

    #[test]
    fn seed_questions_keep_list_order() {
        let config = AppConfig::from_json(
            r#"{
                "users": [{"token": "t", "user_id": "6f1c8a36-3c55-4a8e-9d59-2b9c1f0c7a11", "role": "admin"}],
                "quizzes": [{
                    "id": "0b7e3c9e-8f0d-4a64-9f43-6f3f5a2d1c01",
                    "owner_id": "6f1c8a36-3c55-4a8e-9d59-2b9c1f0c7a11",
                    "title": "Capitals",
                    "questions": [
                        {"text": "France?", "options": ["Paris", "Lyon"], "correct_keys": [0]},
                        {"text": "Mood?", "options": ["Good", "Bad"], "question_type": "survey"}
                    ]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.users[0].role, Role::Admin);
        let (quiz, questions) = config.quizzes[0].to_entities();
        assert_eq!(quiz.title, "Capitals");
        assert_eq!(questions[0].order_index, 0);
        assert_eq!(questions[1].order_index, 1);
        assert_eq!(questions[1].question_type, QuestionType::Survey);
        assert_eq!(questions[0].duration_secs, 20);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        assert!(AppConfig::from_json("{\"engine\": 4}").is_err());
    }
}
