// Core types and storage for the Roster user directory

pub mod store;
pub mod types;

pub use store::{JsonUserStore, StoreError};
pub use types::{NewUser, User};
