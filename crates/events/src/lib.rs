//! Progress event bus for docflow runs
//!
//! Run drivers publish lifecycle events here; the CLI, the HTTP server and
//! tests subscribe per run and receive a finite, ordered stream.

mod bus;
mod types;

pub use bus::{EventBus, EventStream};
pub use types::*;
