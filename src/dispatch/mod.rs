// src/dispatch/mod.rs

//! Budget-aware dispatch of tool calls from an external reasoning process.
//!
//! Each call is parsed into a [`ToolCall`], priced from the static cost table,
//! checked against the session [`Budget`](crate::models::Budget) and charged
//! before it runs. Tool failures are charged and returned as results; only
//! budget exhaustion, the iteration ceiling, the wall clock or an explicit
//! finalize end a session.

mod dispatcher;
mod providers;
mod session;
mod tool;

pub use dispatcher::{Dispatcher, Outcome};
pub use providers::{
    MarkdownRenderer, PageSource, ResultRenderer, SearchHit, SearchProvider, SpecialistProvider,
    dedupe_hits,
};
pub use session::{BudgetSnapshot, Session, SessionState, TerminationReason};
pub use tool::{ToolCall, ToolKind, clean_query};
