//! Async sync engine: dispatch, push subscriptions, reconciliation and reaping.

/// Engine tunables.
pub mod config;
/// Online/offline tracking.
pub mod connectivity;
/// State shared between engine components.
pub mod context;
/// Sends queued mutations to the remote service.
pub mod dispatcher;
/// Event stream types emitted by the engine.
pub mod events;
/// Engine entry point and handle.
pub mod handle;
/// Push-channel subscriptions.
pub mod listener;
/// Stuck-job reaper.
pub mod reaper;
/// Folding authoritative state into local state.
pub mod reconcile;
/// Session value passed to remote calls.
pub mod session;
