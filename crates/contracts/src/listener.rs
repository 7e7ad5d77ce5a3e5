//! Listener fan-out primitives.
//!
//! Components publish derived artifacts through shared callback lists; a
//! subscriber is an `Arc`'d closure so it can be invoked from any worker.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    ActiveSchemes, AgentError, CustomDecoderFormat, DecoderDictionary, FetchMatrix,
    InspectionMatrix, NetworkProtocol, RawSignalBufferConfig, SignalId, SyncId,
};

/// Thread-safe list of subscriber callbacks.
pub struct CallbackList<T: ?Sized> {
    subscribers: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> CallbackList<T> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: Arc<T>) {
        self.subscribers.write().push(callback);
    }

    /// Invoke `f` for each subscriber, in subscription order.
    pub fn notify(&self, f: impl Fn(&T)) {
        for subscriber in self.subscribers.read().iter() {
            f(subscriber);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

impl<T: ?Sized> Default for CallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-protocol dictionary update. `None` pauses the protocol's sources.
pub type DictionaryChangeCallback =
    dyn Fn(Option<Arc<DecoderDictionary>>, NetworkProtocol) + Send + Sync;

pub type InspectionMatrixCallback = dyn Fn(Arc<InspectionMatrix>) + Send + Sync;

pub type FetchMatrixCallback = dyn Fn(Arc<FetchMatrix>) + Send + Sync;

pub type ActiveSchemesCallback = dyn Fn(Arc<ActiveSchemes>) + Send + Sync;

/// Fires on manifest change with the new manifest id and the signal id to
/// custom decoder map.
pub type CustomDecoderMapCallback =
    dyn Fn(&SyncId, Arc<HashMap<SignalId, CustomDecoderFormat>>) + Send + Sync;

/// Fires with the full set of known document ids whenever it changes.
pub type CheckinCallback = dyn Fn(&[SyncId]) + Send + Sync;

/// Raw-buffer reconfiguration for string and complex signals.
pub type RawBufferConfigCallback = dyn Fn(&[RawSignalBufferConfig]) + Send + Sync;

/// Unrecoverable source failure, surfaced to the supervisor.
pub type FatalErrorCallback = dyn Fn(&AgentError) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_notify_reaches_all_subscribers() {
        let list: CallbackList<dyn Fn(u32) + Send + Sync> = CallbackList::new();
        let total = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let total = total.clone();
            list.subscribe(Arc::new(move |value| {
                total.fetch_add(value, Ordering::Relaxed);
            }));
        }
        list.notify(|cb| cb(5));
        assert_eq!(total.load(Ordering::Relaxed), 15);
        assert_eq!(list.len(), 3);
    }
}
