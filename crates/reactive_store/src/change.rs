/// A committed transition from `old` to `new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<V> {
    pub old: V,
    pub new: V,
}

impl<V: PartialEq> Change<V> {
    /// Returns `None` when nothing actually changed.
    pub fn if_changed(old: V, new: V) -> Option<Self> {
        match old == new {
            true => None,
            false => Some(Self {
                old,
                new,
            }),
        }
    }
}

impl<V> Change<V> {
    /// Always produces a change, for payloads that cannot be compared.
    pub fn unchecked(old: V, new: V) -> Self {
        Self {
            old,
            new,
        }
    }

    pub fn map<U>(&self, f: impl Fn(&V) -> U) -> Change<U> {
        Change {
            old: f(&self.old),
            new: f(&self.new),
        }
    }
}

/// Decides whether an (old, new) pair is worth notifying about.
pub(crate) type Detector<V> = fn(V, V) -> Option<Change<V>>;

pub(crate) fn equality_detector<V: PartialEq>() -> Detector<V> {
    Change::if_changed
}

pub(crate) fn always_detector<V>() -> Detector<V> {
    |old, new| Some(Change::unchecked(old, new))
}
