//! Person detection.
//!
//! Backends share the `DetectorBackend` trait. `BackendChain` picks the first
//! one that initialises: the accelerator, then the CPU model.

mod backend;
pub mod backends;
mod result;
mod selection;

pub use backend::DetectorBackend;
pub use backends::{HardwareBackend, SoftwareBackend, SoftwareSettings, StubBackend};
pub use result::{Detection, PERSON_LABEL};
pub use selection::BackendChain;
