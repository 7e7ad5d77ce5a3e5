//! Custom data source: embedder-defined signals matched by decoder key.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use contracts::{
    AgentError, CustomDecoderMethod, DecoderDictionary, InterfaceId, NetworkProtocol, SignalId,
    SignalType, Timestamp, WaitEvent,
};

/// One reading produced by the embedder's adapter.
#[derive(Debug, Clone)]
pub struct CustomSample {
    pub decoder_key: String,
    pub value: f64,
    pub timestamp_ms: Timestamp,
}

/// A sample matched against the active dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedCustomSignal {
    pub signal_id: SignalId,
    pub signal_type: SignalType,
    pub value: f64,
    pub timestamp_ms: Timestamp,
}

pub type CustomSignalConsumer = Arc<dyn Fn(CollectedCustomSignal) + Send + Sync>;

/// Where the readings come from (a GPS poller, a UDS client, ...).
pub trait CustomSourceAdapter: Send {
    fn poll(&mut self) -> Vec<CustomSample>;
}

struct Shared {
    decoders: Mutex<Option<BTreeMap<String, CustomDecoderMethod>>>,
    wait: WaitEvent,
    should_stop: AtomicBool,
}

pub struct CustomDataSource {
    interface_id: InterfaceId,
    idle_time_ms: u64,
    consumer: CustomSignalConsumer,
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CustomDataSource {
    pub fn new(interface_id: InterfaceId, idle_time_ms: u64, consumer: CustomSignalConsumer) -> Self {
        Self {
            interface_id,
            idle_time_ms,
            consumer,
            shared: Arc::new(Shared {
                decoders: Mutex::new(None),
                wait: WaitEvent::new(),
                should_stop: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn connect(&self, mut adapter: Box<dyn CustomSourceAdapter>) -> Result<(), AgentError> {
        let mut thread = self.thread.lock();
        if thread.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Err(AgentError::SourceLifecycle {
                message: format!("custom source {} already connected", self.interface_id),
            });
        }
        self.shared.should_stop.store(false, Ordering::Relaxed);
        let shared = self.shared.clone();
        let consumer = self.consumer.clone();
        let idle_time_ms = self.idle_time_ms;
        let interface_id = self.interface_id.clone();
        let handle = thread::Builder::new()
            .name(format!("custom-source-{interface_id}"))
            .spawn(move || {
                run_worker(shared, &mut *adapter, consumer, idle_time_ms);
            })
            .map_err(|e| AgentError::SourceLifecycle {
                message: format!("failed to spawn custom source worker: {e}"),
            })?;
        *thread = Some(handle);
        info!(interface = %self.interface_id, "custom data source connected");
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut thread = self.thread.lock();
        self.shared.should_stop.store(true, Ordering::Relaxed);
        self.shared.wait.notify();
        if let Some(handle) = thread.take() {
            let _ = handle.join();
        }
        self.shared.should_stop.store(false, Ordering::Relaxed);
        debug!(interface = %self.interface_id, "custom data source disconnected");
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Dictionary listener entry point; picks this source's interface slice.
    pub fn on_dictionary_change(
        &self,
        dictionary: Option<Arc<DecoderDictionary>>,
        protocol: NetworkProtocol,
    ) {
        if protocol != NetworkProtocol::Custom {
            return;
        }
        let decoders = match dictionary {
            None => None,
            Some(dictionary) => match dictionary.as_custom() {
                Some(custom) => custom.decoders.get(&self.interface_id).cloned(),
                None => {
                    warn!(
                        interface = %self.interface_id,
                        "dictionary variant mismatch for custom decoding, pausing"
                    );
                    None
                }
            },
        };
        let resumed = decoders.is_some();
        *self.shared.decoders.lock() = decoders;
        if resumed {
            trace!(interface = %self.interface_id, "resuming custom acquisition");
            self.shared.wait.notify();
        }
    }
}

impl Drop for CustomDataSource {
    fn drop(&mut self) {
        if self.is_alive() {
            self.disconnect();
        }
    }
}

fn run_worker(
    shared: Arc<Shared>,
    adapter: &mut dyn CustomSourceAdapter,
    consumer: CustomSignalConsumer,
    idle_time_ms: u64,
) {
    loop {
        if shared.should_stop.load(Ordering::Relaxed) {
            break;
        }
        let decoders = shared.decoders.lock().clone();
        let Some(decoders) = decoders else {
            shared.wait.wait();
            continue;
        };

        let samples = adapter.poll();
        let mut matched = 0usize;
        for sample in samples {
            let Some(method) = decoders.get(&sample.decoder_key) else {
                trace!(key = %sample.decoder_key, "sample without active decoder, dropped");
                continue;
            };
            matched += 1;
            consumer(CollectedCustomSignal {
                signal_id: method.signal_id,
                signal_type: method.signal_type,
                value: sample.value,
                timestamp_ms: sample.timestamp_ms,
            });
        }
        if matched == 0 {
            shared.wait.wait_timeout(Duration::from_millis(idle_time_ms));
        }
    }
}
