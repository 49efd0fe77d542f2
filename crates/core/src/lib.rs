//! lotline-core: domain vocabulary for batch custody tracing.
//!
//! - [`Phase`], [`Status`], [`Decision`] and the [`transition`] rule that
//!   every store and ledger agrees on
//! - [`Evidence`] and [`CollectionDetails`] with field validation
//! - [`Fingerprint`], the deterministic public verification artifact
//!
//! Nothing in this crate performs I/O.

pub mod evidence;
pub mod fingerprint;
pub mod phase;

pub use evidence::{CollectionDetails, DocumentRef, Evidence, FieldIssue, Location, WeatherReading};
pub use fingerprint::{identifier_hash, Fingerprint, GRID_SIZE};
pub use phase::{is_terminal_state, transition, Decision, ParseVocabularyError, Phase, Status};
