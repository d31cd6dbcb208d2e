//! Per-composite render state machine.

/// Lifecycle of one chunk or the overview
///
/// ```text
/// Clean --mark_dirty--> Dirty --start_render--> Rendering --finish--> Clean
///                                                   |                   ^
///                                              mark_dirty               |
///                                                   v                   |
///                                        DirtyWhileRendering --finish--> Dirty
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderState {
    /// Composite reflects every committed write
    #[default]
    Clean,
    /// At least one write since the last completed render; a job is pending
    Dirty,
    /// A render is in flight and nothing changed since it started
    Rendering,
    /// A render is in flight and more writes arrived after it started
    DirtyWhileRendering,
}

impl RenderState {
    /// Record a write. Returns `true` when a new render job must be queued.
    ///
    /// Repeated calls while already dirty are absorbed.
    pub fn mark_dirty(&mut self) -> bool {
        match *self {
            RenderState::Clean => {
                *self = RenderState::Dirty;
                true
            }
            RenderState::Rendering => {
                *self = RenderState::DirtyWhileRendering;
                false
            }
            RenderState::Dirty | RenderState::DirtyWhileRendering => false,
        }
    }

    /// Claim a pending render. Returns `false` if there is nothing to render.
    pub fn start_render(&mut self) -> bool {
        if *self == RenderState::Dirty {
            *self = RenderState::Rendering;
            true
        } else {
            false
        }
    }

    /// A render committed. Returns `true` when another pass is needed.
    pub fn finish_render(&mut self) -> bool {
        match *self {
            RenderState::Rendering => {
                *self = RenderState::Clean;
                false
            }
            RenderState::DirtyWhileRendering => {
                *self = RenderState::Dirty;
                true
            }
            RenderState::Clean | RenderState::Dirty => false,
        }
    }

    /// A render failed without committing; the composite is still stale.
    pub fn abort_render(&mut self) {
        if self.is_rendering() {
            *self = RenderState::Dirty;
        }
    }

    #[inline]
    pub fn is_rendering(&self) -> bool {
        matches!(self, RenderState::Rendering | RenderState::DirtyWhileRendering)
    }

    /// Composite lags behind tile state
    #[inline]
    pub fn is_stale(&self) -> bool {
        *self != RenderState::Clean
    }
}
