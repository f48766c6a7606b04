pub mod selector;
pub mod types;


pub use selector::ProviderSelector;
pub use types::*;
