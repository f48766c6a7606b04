pub mod classifier;
pub mod types;


pub use classifier::{classify, parse_retry_hint};
pub use types::*;
