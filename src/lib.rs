//! parkd is a campus parking reservation engine that speaks the PostgreSQL
//! wire protocol. Clients connect with any Postgres driver; the database
//! name in the startup message selects the campus, and a small SQL dialect
//! covers inventory, availability, booking, and LISTEN/NOTIFY streams of
//! reservation events.
//!
//! State lives in memory behind per-building locks and is made durable by
//! a group-commit write-ahead log per campus.

pub mod auth;
pub mod calendar;
pub mod campus;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod window;
pub mod wire;
