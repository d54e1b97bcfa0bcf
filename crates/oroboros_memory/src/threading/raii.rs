//! Construct/destruct closure pairs bound to a scope.

/// Runs one closure on creation and another on drop. Move only.
///
/// ```rust,ignore
/// let _guard = RaiiFunction::new(|| println!("enter"), || println!("leave"));
/// ```
#[must_use = "the destruct closure runs when the guard is dropped"]
pub struct RaiiFunction {
    destruct: Option<Box<dyn FnOnce() + Send>>,
}

impl RaiiFunction {
    /// Runs `construct` immediately and arms `destruct` for drop.
    pub fn new(construct: impl FnOnce(), destruct: impl FnOnce() + Send + 'static) -> Self {
        construct();
        Self {
            destruct: Some(Box::new(destruct)),
        }
    }

    /// Arms `destruct` without a construct step.
    pub fn on_drop(destruct: impl FnOnce() + Send + 'static) -> Self {
        Self::new(|| {}, destruct)
    }

    /// Disarms the guard; the destruct closure will never run.
    pub fn dismiss(mut self) {
        self.destruct = None;
    }
}

impl Drop for RaiiFunction {
    fn drop(&mut self) {
        if let Some(destruct) = self.destruct.take() {
            destruct();
        }
    }
}

impl std::fmt::Debug for RaiiFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaiiFunction")
            .field("armed", &self.destruct.is_some())
            .finish()
    }
}
