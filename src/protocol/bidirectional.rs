/// A pair of independently evolving inbound/outbound values that can be
/// restored to a fixed reset value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidirectionalState<T: Clone> {
    /// Inbound value
    pub inbound: T,
    /// Outbound value
    pub outbound: T,
    reset_value: T,
}

impl<T: Clone> BidirectionalState<T> {
    /// Both directions start at `value`.
    pub fn new(value: T) -> Self {
        Self {
            inbound: value.clone(),
            outbound: value.clone(),
            reset_value: value,
        }
    }

    /// Restore both directions to the reset value.
    pub fn reset(&mut self) {
        self.inbound = self.reset_value.clone();
        self.outbound = self.reset_value.clone();
    }
}
