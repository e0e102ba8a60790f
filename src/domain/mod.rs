//! Domain model shared by the bus surface and the provider adapters

pub mod user;

pub use user::{AlternateEmail, TokenSet, User, UserMetadata};
