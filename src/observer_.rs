use std::{fmt, sync::Arc};

/// Receives property-change notifications from a lock.
///
/// Purely an observer: the lock never reads anything back from it, and the
/// callback runs on whichever thread changed the property, possibly while
/// the lock is held. Keep it short and never call back into the lock.
pub trait PropertyObserver: Send + Sync {
    fn property_changed(&self, name: &'static str);
}

impl<F> PropertyObserver for F
where
    F: Fn(&'static str) + Send + Sync,
{
    fn property_changed(&self, name: &'static str) {
        self(name)
    }
}

pub(super) const PROP_DEPTH: &str = "depth";
pub(super) const PROP_IS_HELD: &str = "is_held";
pub(super) const PROP_DISPOSAL_STATE: &str = "disposal_state";

#[derive(Clone, Default)]
pub(super) struct ObserverSlot(Option<Arc<dyn PropertyObserver>>);

impl ObserverSlot {
    pub const fn new(observer: Option<Arc<dyn PropertyObserver>>) -> Self {
        ObserverSlot(observer)
    }

    #[inline]
    pub fn notify(&self, name: &'static str) {
        if let Option::Some(o) = &self.0 {
            o.property_changed(name)
        }
    }
}

impl fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = if self.0.is_some() { "Some(..)" } else { "None" };
        write!(f, "ObserverSlot({x})")
    }
}
