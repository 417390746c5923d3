/// Invitation code allocation.
pub mod allocator;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Bearer token resolution.
pub mod identity;
/// Ranking projection over the response ledger.
pub mod leaderboard;
/// Answer scoring rules.
pub mod scoring;
/// Live session phase engine.
pub mod session_engine;
/// Session REST operations.
pub mod session_service;
/// WebSocket connection and message handling service.
pub mod websocket_service;
/// Outbound WebSocket events and fan-out helpers.
pub mod ws_events;
