use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::flag::Flag;

/// Holds the flag definitions a local provider evaluates from.
///
/// A fetched definition set is published as one immutable snapshot behind a
/// single atomic reference; readers take the current snapshot without locking
/// and never observe a partially-applied update. Replacing the snapshot does
/// not disturb evaluations already holding the previous one.
#[derive(Default)]
pub(crate) struct FlagStore {
    definitions: ArcSwapOption<HashMap<String, Flag>>,
}

impl FlagStore {
    pub(crate) fn new() -> Self {
        FlagStore::default()
    }

    /// Publishes a freshly parsed definition set, replacing the previous one
    /// wholesale. There is no partial merge.
    pub(crate) fn replace(&self, flags: HashMap<String, Flag>) {
        self.definitions.store(Some(Arc::new(flags)));
    }

    /// The current snapshot, or None before the first successful fetch.
    pub(crate) fn snapshot(&self) -> Option<Arc<HashMap<String, Flag>>> {
        self.definitions.load_full()
    }

    /// True once any definition set has been published, even an empty one.
    /// A later failed fetch leaves the store untouched, so this never goes
    /// back to false.
    pub(crate) fn ready(&self) -> bool {
        self.definitions.load().is_some()
    }
}
