//! Progress reporting for long-running flash operations

/// Progress update callbacks
///
/// Implementations are driven once per programmed sector; `current` counts
/// completed sectors out of the `total` announced by `init`.
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}
