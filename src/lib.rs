//! Offline-first appointment scheduling engine.
//!
//! Each establishment gets a [`engine::Scheduler`] that assembles day
//! and month views from three layers: a TTL cache of remote reads, the
//! remote store itself, and the journaled queue of not-yet-confirmed
//! local mutations overlaid on top. Writes validate, journal, and
//! return; delivery to the remote store happens in the foreground when
//! it is reachable and through the background replayer when it is not.
//! The journal makes the queue survive restarts, and client-generated
//! ids make re-delivery idempotent.

pub mod cache;
pub mod engine;
pub mod establishment;
pub mod journal;
pub mod limits;
pub mod localtime;
pub mod model;
pub mod notify;
pub mod observability;
pub mod outbox;
pub mod remote;
pub mod replayer;
