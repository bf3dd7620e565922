//! Persistent store: synchronous SQLite access plus the async handle wrapping it (§4.1).

mod db;
mod db_actions;
mod db_events;
mod db_gates;
mod db_jobs;
mod db_misc;
mod db_outbox;
mod db_webhooks;
mod db_worktrees;
mod handle;
pub mod models;

pub use db::ConductorDb;
pub use db_events::EnrichedEvent;
pub use db_webhooks::InsertDeliveryOutcome;
pub use handle::StoreHandle;
