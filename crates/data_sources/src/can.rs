//! Raw CAN data source.
//!
//! State machine: Created -> Connected -> Running <-> Sleeping -> Stopped.
//! The worker snapshots the current dictionary under a short lock, receives
//! one batch of frames, timestamps and dispatches them, then idles until
//! frames, a dictionary or stop arrive.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use contracts::{
    AgentError, CanDecoderDictionary, ChannelNumericId, Clock, DecoderDictionary,
    FatalErrorCallback, NetworkProtocol, Timestamp, WaitEvent,
};

use crate::endpoint::{
    CanEndpointFactory, CanEndpointOptions, EndpointError, RawCanEndpoint, ReceivedCanFrame,
};

/// Frames fetched from the endpoint in one batch.
const RECEIVE_BATCH_SIZE: usize = 10;

/// Which receive timestamp to trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanTimestampType {
    /// Stamp frames with the wall clock at poll time.
    Polling,
    /// Kernel software receive timestamp.
    #[default]
    KernelSoftware,
    /// Hardware timestamp from the controller.
    KernelHardware,
}

#[derive(Debug, Clone)]
pub struct CanSourceConfig {
    pub channel_id: ChannelNumericId,
    pub interface_name: String,
    pub timestamp_type: CanTimestampType,
    /// Fail `connect` instead of degrading when the interface lacks FD
    /// support.
    pub force_can_fd: bool,
    pub idle_time_ms: u64,
}

/// One received frame handed to the consumer together with the dictionary
/// snapshot it should be decoded against.
#[derive(Debug, Clone)]
pub struct CanFrameSample {
    pub channel_id: ChannelNumericId,
    pub frame_id: u32,
    pub payload: Bytes,
    pub timestamp_ms: Timestamp,
}

pub type CanFrameConsumer = Arc<dyn Fn(&CanFrameSample, &CanDecoderDictionary) + Send + Sync>;

/// Counters mirrored into the metrics exporter, kept here so tests can
/// observe them per source.
#[derive(Debug, Default)]
pub struct CanSourceStats {
    pub received_frames: AtomicU64,
    pub non_monotonic_frames: AtomicU64,
    pub polling_timestamp_fallbacks: AtomicU64,
    pub receive_errors: AtomicU64,
}

struct Shared {
    dictionary: Mutex<Option<Arc<DecoderDictionary>>>,
    wait: WaitEvent,
    should_stop: AtomicBool,
    stats: CanSourceStats,
}

pub struct CanDataSource {
    config: CanSourceConfig,
    factory: Arc<dyn CanEndpointFactory>,
    consumer: CanFrameConsumer,
    clock: Arc<dyn Clock>,
    fatal: Mutex<Option<Arc<FatalErrorCallback>>>,
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CanDataSource {
    pub fn new(
        config: CanSourceConfig,
        factory: Arc<dyn CanEndpointFactory>,
        consumer: CanFrameConsumer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            factory,
            consumer,
            clock,
            fatal: Mutex::new(None),
            shared: Arc::new(Shared {
                dictionary: Mutex::new(None),
                wait: WaitEvent::new(),
                should_stop: AtomicBool::new(false),
                stats: CanSourceStats::default(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Supervisor hook for unrecoverable failures (interface removed).
    pub fn set_fatal_error_callback(&self, callback: Arc<FatalErrorCallback>) {
        *self.fatal.lock() = Some(callback);
    }

    /// Open the endpoint and start the worker.
    pub fn connect(&self) -> Result<(), AgentError> {
        let mut thread = self.thread.lock();
        if thread.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Err(AgentError::SourceLifecycle {
                message: format!("CAN source {} already connected", self.config.channel_id),
            });
        }

        let options = CanEndpointOptions {
            interface_name: self.config.interface_name.clone(),
            enable_fd: true,
            require_fd: self.config.force_can_fd,
            enable_kernel_timestamps: self.config.timestamp_type != CanTimestampType::Polling,
        };
        let endpoint = self
            .factory
            .open(&options)
            .map_err(|e| AgentError::endpoint(&self.config.interface_name, e.to_string()))?;

        self.shared.should_stop.store(false, Ordering::Relaxed);
        let worker = CanWorker {
            config: self.config.clone(),
            consumer: self.consumer.clone(),
            clock: self.clock.clone(),
            fatal: self.fatal.lock().clone(),
            shared: self.shared.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("can-source-{}", self.config.channel_id + 1))
            .spawn(move || worker.run(endpoint))
            .map_err(|e| AgentError::SourceLifecycle {
                message: format!("failed to spawn CAN worker: {e}"),
            })?;
        *thread = Some(handle);
        info!(
            channel = self.config.channel_id,
            interface = %self.config.interface_name,
            "CAN data source connected"
        );
        Ok(())
    }

    /// Stop the worker; the endpoint is released on every worker exit path.
    pub fn disconnect(&self) {
        let mut thread = self.thread.lock();
        self.shared.should_stop.store(true, Ordering::Relaxed);
        self.shared.wait.notify();
        if let Some(handle) = thread.take() {
            let _ = handle.join();
        }
        self.shared.should_stop.store(false, Ordering::Relaxed);
        debug!(channel = self.config.channel_id, "CAN data source disconnected");
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> &CanSourceStats {
        &self.shared.stats
    }

    /// Dictionary listener entry point. Foreign protocols are ignored; a
    /// null or variant-mismatched dictionary puts the worker to sleep.
    pub fn on_dictionary_change(
        &self,
        dictionary: Option<Arc<DecoderDictionary>>,
        protocol: NetworkProtocol,
    ) {
        if protocol != NetworkProtocol::RawCan {
            return;
        }
        let dictionary = match dictionary {
            Some(dictionary) if dictionary.as_can().is_none() => {
                warn!(
                    channel = self.config.channel_id,
                    "dictionary variant mismatch for raw CAN, pausing"
                );
                None
            }
            other => other,
        };
        let resumed = dictionary.is_some();
        *self.shared.dictionary.lock() = dictionary;
        if resumed {
            trace!(channel = self.config.channel_id, "resuming acquisition");
            self.shared.wait.notify();
        } else {
            trace!(
                channel = self.config.channel_id,
                "no decoder dictionary, worker will sleep"
            );
        }
    }
}

impl Drop for CanDataSource {
    fn drop(&mut self) {
        if self.is_alive() {
            self.disconnect();
        }
    }
}

struct CanWorker {
    config: CanSourceConfig,
    consumer: CanFrameConsumer,
    clock: Arc<dyn Clock>,
    fatal: Option<Arc<FatalErrorCallback>>,
    shared: Arc<Shared>,
}

impl CanWorker {
    fn run(self, mut endpoint: Box<dyn RawCanEndpoint>) {
        let mut last_frame_time: Timestamp = 0;
        // After a sleep the kernel queue may hold frames from before the
        // dictionary existed; the first batch after waking is discarded.
        let mut woke_up_from_sleep = false;

        loop {
            if self.shared.should_stop.load(Ordering::Relaxed) {
                break;
            }

            let dictionary = self.shared.dictionary.lock().clone();
            let Some(dictionary) = dictionary else {
                trace!(channel = self.config.channel_id, "no dictionary, sleeping");
                self.shared.wait.wait();
                woke_up_from_sleep = true;
                continue;
            };

            let frames = match endpoint.receive_batch(RECEIVE_BATCH_SIZE) {
                Ok(frames) => frames,
                Err(EndpointError::DeviceRemoved) => {
                    error!(
                        interface = %self.config.interface_name,
                        "network interface was removed"
                    );
                    if let Some(fatal) = &self.fatal {
                        fatal(&AgentError::DeviceRemoved {
                            interface: self.config.interface_name.clone(),
                        });
                    }
                    break;
                }
                Err(EndpointError::NetworkDown) => {
                    // Endpoint stays open; consumption resumes with the network.
                    error!(
                        interface = %self.config.interface_name,
                        "network down or unreachable"
                    );
                    Vec::new()
                }
                Err(e) => {
                    self.shared.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("can_source_receive_errors").increment(1);
                    warn!(error = %e, "CAN receive failed");
                    Vec::new()
                }
            };

            let received = frames.len();
            if !woke_up_from_sleep {
                for frame in &frames {
                    self.dispatch(frame, &dictionary, &mut last_frame_time);
                }
            }

            if received < RECEIVE_BATCH_SIZE {
                self.shared
                    .wait
                    .wait_timeout(Duration::from_millis(self.config.idle_time_ms));
                woke_up_from_sleep = false;
            }
        }

        endpoint.close();
        debug!(channel = self.config.channel_id, "CAN worker exited");
    }

    fn dispatch(
        &self,
        frame: &ReceivedCanFrame,
        dictionary: &DecoderDictionary,
        last_frame_time: &mut Timestamp,
    ) {
        let timestamp_ms = self.extract_timestamp(frame);
        if timestamp_ms < *last_frame_time {
            self.shared
                .stats
                .non_monotonic_frames
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!("can_source_non_monotonic_frames").increment(1);
        }
        *last_frame_time = timestamp_ms;
        self.shared.stats.received_frames.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("can_source_received_frames").increment(1);

        if let Some(can) = dictionary.as_can() {
            let sample = CanFrameSample {
                channel_id: self.config.channel_id,
                frame_id: frame.frame.id,
                payload: frame.frame.payload.clone(),
                timestamp_ms,
            };
            (self.consumer)(&sample, can);
        }
    }

    /// Timestamp by configured type, falling back to the wall clock when the
    /// kernel did not attach one.
    fn extract_timestamp(&self, frame: &ReceivedCanFrame) -> Timestamp {
        let kernel = match self.config.timestamp_type {
            CanTimestampType::Polling => None,
            CanTimestampType::KernelSoftware => frame.software_timestamp_ms,
            CanTimestampType::KernelHardware => frame.hardware_timestamp_ms,
        };
        match kernel.filter(|t| *t != 0) {
            Some(timestamp) => timestamp,
            None => {
                if self.config.timestamp_type != CanTimestampType::Polling {
                    self.shared
                        .stats
                        .polling_timestamp_fallbacks
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("can_source_polling_timestamp_fallbacks").increment(1);
                }
                self.clock.system_time_since_epoch_ms()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCanEndpointFactory, MockCanNetwork};
    use contracts::{SystemClock, SignalId};
    use std::sync::atomic::AtomicUsize;

    fn config(timestamp_type: CanTimestampType) -> CanSourceConfig {
        CanSourceConfig {
            channel_id: 0,
            interface_name: "vcan0".to_string(),
            timestamp_type,
            force_can_fd: false,
            idle_time_ms: 5,
        }
    }

    fn can_dictionary() -> Arc<DecoderDictionary> {
        let mut dictionary = CanDecoderDictionary::default();
        dictionary.signal_ids_to_collect.insert(SignalId(1));
        dictionary.decoder_methods.entry(0).or_default();
        Arc::new(DecoderDictionary::Can(dictionary))
    }

    #[test]
    fn test_non_monotonic_timestamps_counted_once() {
        // Timestamps [100, 200, 150, 300]: exactly one regression.
        let network = MockCanNetwork::new();
        for timestamp in [100u64, 200, 150, 300] {
            network.push_frame(0x123, &[0u8; 8], Some(timestamp));
        }
        let factory = Arc::new(MockCanEndpointFactory::new(network.clone()));

        let dispatched = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let dispatched = dispatched.clone();
            Arc::new(move |_: &CanFrameSample, _: &CanDecoderDictionary| {
                dispatched.fetch_add(1, Ordering::Relaxed);
            })
        };
        let source = CanDataSource::new(
            config(CanTimestampType::KernelSoftware),
            factory,
            consumer,
            SystemClock::shared(),
        );
        source.on_dictionary_change(Some(can_dictionary()), NetworkProtocol::RawCan);
        source.connect().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while dispatched.load(Ordering::Relaxed) < 4 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        source.disconnect();

        assert_eq!(dispatched.load(Ordering::Relaxed), 4);
        assert_eq!(source.stats().non_monotonic_frames.load(Ordering::Relaxed), 1);
        assert_eq!(source.stats().received_frames.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_worker_sleeps_without_dictionary() {
        let network = MockCanNetwork::new();
        network.push_frame(0x123, &[0u8; 8], Some(100));
        let factory = Arc::new(MockCanEndpointFactory::new(network.clone()));

        let dispatched = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let dispatched = dispatched.clone();
            Arc::new(move |_: &CanFrameSample, _: &CanDecoderDictionary| {
                dispatched.fetch_add(1, Ordering::Relaxed);
            })
        };
        let source = CanDataSource::new(
            config(CanTimestampType::KernelSoftware),
            factory,
            consumer,
            SystemClock::shared(),
        );
        source.connect().unwrap();
        thread::sleep(Duration::from_millis(50));
        // No dictionary: nothing may be consumed.
        assert_eq!(dispatched.load(Ordering::Relaxed), 0);

        // Waking with a dictionary discards the stale pre-wake batch, then
        // fresh frames flow.
        source.on_dictionary_change(Some(can_dictionary()), NetworkProtocol::RawCan);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while dispatched.load(Ordering::Relaxed) == 0 && std::time::Instant::now() < deadline {
            network.push_frame(0x124, &[0u8; 8], Some(200));
            thread::sleep(Duration::from_millis(10));
        }
        source.disconnect();
        assert!(dispatched.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_foreign_protocol_dictionary_ignored() {
        let network = MockCanNetwork::new();
        let factory = Arc::new(MockCanEndpointFactory::new(network));
        let source = CanDataSource::new(
            config(CanTimestampType::Polling),
            factory,
            Arc::new(|_: &CanFrameSample, _: &CanDecoderDictionary| {}),
            SystemClock::shared(),
        );
        source.on_dictionary_change(Some(can_dictionary()), NetworkProtocol::Obd);
        assert!(source.shared.dictionary.lock().is_none());
    }

    #[test]
    fn test_force_fd_fails_connect_on_unsupported_interface() {
        let network = MockCanNetwork::new();
        network.set_fd_supported(false);
        let factory = Arc::new(MockCanEndpointFactory::new(network));
        let mut cfg = config(CanTimestampType::Polling);
        cfg.force_can_fd = true;
        let source = CanDataSource::new(
            cfg,
            factory,
            Arc::new(|_: &CanFrameSample, _: &CanDecoderDictionary| {}),
            SystemClock::shared(),
        );
        assert!(source.connect().is_err());
        assert!(!source.is_alive());
    }

    #[test]
    fn test_device_removed_surfaces_to_supervisor() {
        let network = MockCanNetwork::new();
        let factory = Arc::new(MockCanEndpointFactory::new(network.clone()));
        let source = CanDataSource::new(
            config(CanTimestampType::Polling),
            factory,
            Arc::new(|_: &CanFrameSample, _: &CanDecoderDictionary| {}),
            SystemClock::shared(),
        );
        let fatal_seen = Arc::new(AtomicBool::new(false));
        {
            let fatal_seen = fatal_seen.clone();
            source.set_fatal_error_callback(Arc::new(move |error| {
                assert!(matches!(error, AgentError::DeviceRemoved { .. }));
                fatal_seen.store(true, Ordering::Relaxed);
            }));
        }
        source.on_dictionary_change(Some(can_dictionary()), NetworkProtocol::RawCan);
        source.connect().unwrap();
        network.fail_next_receive(EndpointError::DeviceRemoved);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fatal_seen.load(Ordering::Relaxed) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(fatal_seen.load(Ordering::Relaxed));
        source.disconnect();
    }
}
