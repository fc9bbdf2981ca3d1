use flowx_core::{BalancerConfig, FlowXError, SharedClock};
use parking_lot::Mutex;

use crate::p2c::{Backend, NodeStat, P2cBuilder, P2cPicker, Pick};

/// Owns the current picker and replaces it whenever the ready set changes.
///
/// ## Rebuild Semantics
/// Scores are not carried across rebuilds: every update starts each backend
/// from the neutral seed. Picks already in flight keep reporting to the
/// picker that issued them.
pub struct Balancer<C> {
    builder: P2cBuilder,
    picker: Mutex<P2cPicker<C>>,
}

impl<C> Balancer<C> {
    pub fn new(conf: BalancerConfig, clock: SharedClock) -> Self {
        Self::with_builder(P2cBuilder::new(conf, clock))
    }

    pub fn with_builder(builder: P2cBuilder) -> Self {
        let picker = builder.build(Vec::<Backend<C>>::new());
        Self {
            builder,
            picker: Mutex::new(picker),
        }
    }

    /// Rebuilds the picker over `ready`.
    pub fn update<I>(&self, ready: I)
    where
        I: IntoIterator<Item = Backend<C>>,
    {
        let picker = self.builder.build(ready);
        *self.picker.lock() = picker;
    }

    pub fn picker(&self) -> P2cPicker<C> {
        self.picker.lock().clone()
    }

    pub fn stats(&self) -> Vec<NodeStat> {
        self.picker().stats()
    }
}

impl<C: Clone> Balancer<C> {
    pub fn pick(&self) -> Result<Pick<C>, FlowXError> {
        self.picker().pick()
    }
}
