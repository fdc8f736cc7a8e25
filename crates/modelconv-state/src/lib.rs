//! modelconv-state: results ledger persistence
//!
//! A workspace owns one ledger file per named operation (for example the
//! top-level `convert_model` operation). Each file holds the complete,
//! ordered list of attempt results for that name.
//!
//! - `dump(name, results)` replaces the list for `name` as one unit
//!   (last writer wins per name).
//! - `load(name)` returns the persisted list, or an empty list when the
//!   name was never written.
//!
//! The ledger lives inside the workspace so it survives the host/container
//! boundary: a sandboxed run writes it, the host reads it back afterwards.

pub mod error;
pub mod store;

pub use error::{StateError, StateResult};
pub use store::{ResultsStore, RESULTS_DIR};
