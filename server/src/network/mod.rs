pub mod mocks;
pub mod tokio;
