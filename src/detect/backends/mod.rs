pub mod hardware;
pub mod software;
pub mod stub;

pub use hardware::HardwareBackend;
pub use software::{parse_ssd_output, SoftwareBackend, SoftwareSettings};
pub use stub::StubBackend;
