//! In-memory queue, optimistic projection, and index helpers.

/// Helper index aliases.
pub mod indices;
/// Optimistic state applier owning every [`optimistic::LocalRecordState`].
pub mod optimistic;
/// Ordered, write-through mutation queue.
pub mod queue;
