mod health;
mod runs;
pub mod sse;

pub use health::*;
pub use runs::*;
