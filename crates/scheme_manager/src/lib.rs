//! # Scheme Manager
//!
//! The scheme-lifecycle scheduler and the signal-acquisition control plane
//! it drives. A single worker thread owns the enabled/idle scheme maps and
//! the wall-clock timeline; document intake from the transport goes through
//! pending slots guarded by a dedicated mutex. Whenever the manifest or the
//! enabled set changes, the worker re-derives the per-protocol decoder
//! dictionaries plus the inspection and fetch matrices and fans them out to
//! the registered listeners.

mod extractor;
mod manager;
mod partial;
mod state;
mod timeline;

pub use extractor::{extract_decoder_dictionaries, extract_matrices, raw_buffer_configs};
pub use manager::{SchemeManager, SchemeManagerConfig};
pub use partial::PartialSignalRegistry;
pub use state::SchemeState;
pub use timeline::{Timeline, TimelineEntry};
