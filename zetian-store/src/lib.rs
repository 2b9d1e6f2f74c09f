pub mod error;
pub mod message;
pub mod store;

pub use error::StoreError;
pub use message::{HeaderView, ReceivedMessage};
pub use store::{FailureMode, MemoryStore, MessageStore, NullStore, TestStore};
