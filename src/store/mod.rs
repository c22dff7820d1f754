//! Durable per-agent stores backed by embedded SQLite
//!
//! Each store wraps one `rusqlite::Connection` behind a mutex: SQLite wants a
//! single writer, and every operation here commits independently. The only
//! multi-statement unit is the backlog's delete-with-descendants, which runs
//! in its own transaction.

pub mod backlog;
pub mod inbox;

pub use self::backlog::{
    render_xml, BacklogItem, BacklogStatus, BacklogStore, BacklogType, BacklogUpdate,
};
pub use self::inbox::{InboxMessage, InboxStore, Priority};
