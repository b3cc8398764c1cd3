//! Portico Common: types shared by every portico crate.
//!
//! Wire error codes, the API error body, the device record and the
//! device-store collaborator interface, plus small helpers for paths,
//! JSON persistence and bounded in-memory caches.

pub mod api;
pub mod cache;
pub mod capability;
pub mod device;
pub mod error;
pub mod http;
pub mod id;
pub mod paths;
pub mod persist;
pub mod test;
