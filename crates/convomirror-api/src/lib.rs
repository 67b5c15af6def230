//! HTTP implementations of the sync engine's remote collaborators.
//!
//! [`HttpRemoteApi`] speaks to the conversation service with `reqwest`,
//! handling pagination parameters, the 401 refresh-and-retry-once pattern
//! and the attachment exchange endpoints. [`StaticCredentials`] is the
//! simplest credential provider: a fixed session token handed over at
//! construction.

pub mod client;
pub mod credentials;

pub use client::HttpRemoteApi;
pub use credentials::StaticCredentials;
