//! Library crate for stubfs: a passthrough filesystem whose regular files
//! are stub records pointing at objects in a remote append-once store.

pub mod config;
pub mod error;
pub mod fuse;
pub mod paths;
pub mod session;
pub mod store;
pub mod stub;
pub mod vfs;
