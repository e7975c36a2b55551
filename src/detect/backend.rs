use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Person detector.
///
/// Implementations return boxes already clamped to the frame, in their own
/// order. The order is significant: the pipeline classifies boxes in the
/// order given and stops at the first uniform match.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// The frame is read-only and must not be retained past the call.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
