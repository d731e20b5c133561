#![deny(clippy::all)]

pub mod association;
pub mod dimse;
pub mod find;
pub mod record;
pub mod retrieve;
pub mod storescp;

pub use dimse::Error;
