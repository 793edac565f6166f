// Core kernel pieces: session state, completeness scanning, MIME formatting,
// execution coordination, inspection, and the engine/publisher seams.
pub mod channel;
pub mod completeness;
pub mod engine;
pub mod error;
pub mod execute;
pub mod inspect;
pub mod mime;
pub mod session;
