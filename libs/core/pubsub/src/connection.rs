use std::sync::{Arc, RwLock};

/// The driver's shared transport handle.
///
/// Callers clone the `Arc` out and release the lock before doing any I/O.
/// `take` empties the slot exactly once, after which the driver is closed.
pub(crate) struct Connection<T: ?Sized> {
    slot: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Connection<T> {
    pub(crate) fn new(transport: Arc<T>) -> Self {
        Self {
            slot: RwLock::new(Some(transport)),
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn take(&self) -> Option<Arc<T>> {
        self.slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_once() {
        let connection: Connection<str> = Connection::new(Arc::from("redis"));
        assert_eq!(connection.get().as_deref(), Some("redis"));
        assert!(connection.take().is_some());
        assert!(connection.take().is_none());
        assert!(connection.get().is_none());
    }
}
