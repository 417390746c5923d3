/// Database model definitions.
pub mod models;
/// Session, participation and response persistence.
pub mod session_store;
/// Storage abstraction layer for database operations.
pub mod storage;
