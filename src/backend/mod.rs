pub mod adapter;
pub mod mock;
pub mod registry;
pub mod types;

pub use adapter::BackendAdapter;
pub use mock::MockBackend;
pub use registry::BackendRegistry;
pub use types::*;
