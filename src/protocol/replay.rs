/// Sliding window anti-replay protection for packet ids.
///
/// A 128-bit bitmap tracks which ids have been seen below the highest
/// accepted id. Duplicates and ids that fell behind the window are
/// rejected.
const WINDOW_SIZE: u32 = 128;

/// Replay filter over 32-bit packet or replay ids.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    /// Bit 0 = `top`, bit 1 = `top - 1`, etc.
    bitmap: u128,
    top: u32,
    initialized: bool,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` would be accepted, without updating state.
    pub fn check(&self, id: u32) -> bool {
        if !self.initialized || id > self.top {
            return true;
        }
        let diff = self.top - id;
        diff < WINDOW_SIZE && self.bitmap & (1u128 << diff) == 0
    }

    /// Mark `id` as received. Call only after the packet authenticated.
    pub fn update(&mut self, id: u32) {
        if !self.initialized {
            self.initialized = true;
            self.top = id;
            self.bitmap = 1;
            return;
        }

        if id > self.top {
            let shift = id - self.top;
            self.bitmap = if shift >= WINDOW_SIZE {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.top = id;
        } else {
            let diff = self.top - id;
            if diff < WINDOW_SIZE {
                self.bitmap |= 1u128 << diff;
            }
        }
    }

    /// Check and mark in one step.
    pub fn check_and_update(&mut self, id: u32) -> bool {
        if self.check(id) {
            self.update(id);
            true
        } else {
            false
        }
    }

    /// Highest id accepted so far.
    pub fn top(&self) -> u32 {
        self.top
    }

    /// Forget every id seen.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
