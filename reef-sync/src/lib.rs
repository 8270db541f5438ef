#![warn(missing_docs)]
//! Reef wallet chain sync engine
//!
//! Keeps account chain heads consistent with a remote block source, resolving reorganizations
//! through the recent history cache and staging decrypted transactions in a write queue.
//!
//! Entrypoint: [`crate::sync::Scanner`]

#[allow(missing_docs)]
pub mod assets;
#[allow(missing_docs)]
pub mod cache;
#[allow(missing_docs)]
pub mod client;
pub mod error;
#[allow(missing_docs)]
pub mod history;
#[allow(missing_docs)]
pub mod primitives;
#[allow(missing_docs)]
pub mod processor;
#[allow(missing_docs)]
pub mod reverse;
#[allow(missing_docs)]
pub mod sync;
pub mod traits;
pub mod walker;
#[allow(missing_docs)]
pub mod write_queue;

#[cfg(any(test, feature = "test-elevation"))]
#[allow(missing_docs)]
pub mod testutils;
