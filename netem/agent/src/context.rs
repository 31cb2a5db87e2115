use std::fmt;
use std::sync::Arc;

use crate::sets::SetStore;

/// Shared handles threaded through the profile tree.
pub struct Ctx<E> {
    pub emitter: Arc<E>,
    pub sets: Arc<SetStore<E>>,
    pub client: kube::Client,
}

impl<E> fmt::Debug for Ctx<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ctx")
            .field("client", &"kube::Client")
            .finish()
    }
}

impl<E> Clone for Ctx<E> {
    fn clone(&self) -> Self {
        Self {
            emitter: self.emitter.clone(),
            sets: self.sets.clone(),
            client: self.client.clone(),
        }
    }
}
