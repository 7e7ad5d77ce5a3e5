//! OBD-over-CAN module.
//!
//! Two phases: ECU discovery (service-01/PID-00 broadcast, standard then
//! extended ids, retried until something answers) and steady state (periodic
//! emission-PID requests partitioned across ECUs, periodic DTC requests when
//! an active condition asks for them).

mod ecu;
mod types;

pub use types::{DtcInfo, BROADCAST_EXTENDED_ID, BROADCAST_ID, SERVICE_CURRENT_DATA, SERVICE_STORED_DTCS};
pub(crate) use types::{is_ecu_response_id, tx_id_for_rx_id, P2_TIMEOUT_MS};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use contracts::{
    AgentError, CanMessageFormat, Clock, DecoderDictionary, InspectionMatrix, MonotonicTimer,
    NetworkProtocol, Pid, Timestamp, WaitEvent,
};

use crate::endpoint::{CanFrame, ObdTransport, RawCanEndpoint};
use ecu::ObdEcu;

#[derive(Debug, Clone)]
pub struct ObdConfig {
    pub gateway_interface: String,
    /// 0 disables PID polling.
    pub pid_request_interval_s: u64,
    /// 0 disables DTC polling.
    pub dtc_request_interval_s: u64,
    /// Send requests on the functional broadcast address.
    pub broadcast_requests: bool,
}

/// One positive ECU response, undecoded.
#[derive(Debug, Clone)]
pub struct ObdResponse {
    pub ecu_rx_id: u32,
    pub service_id: u8,
    pub payload: Bytes,
    pub timestamp_ms: Timestamp,
}

pub type ObdResponseConsumer = Arc<dyn Fn(ObdResponse) + Send + Sync>;
pub type DtcConsumer = Arc<dyn Fn(DtcInfo) + Send + Sync>;

#[derive(Default)]
struct DictionaryState {
    pid_formats: BTreeMap<Pid, CanMessageFormat>,
    requested_pids: Vec<Pid>,
}

struct Shared {
    dictionary: Mutex<DictionaryState>,
    dictionary_available: AtomicBool,
    should_request_dtcs: AtomicBool,
    should_stop: AtomicBool,
    /// Steady-state pacing.
    wait: WaitEvent,
    /// Waiting for a dictionary or a DTC enable.
    data_wait: WaitEvent,
}

pub struct ObdOverCanModule {
    config: ObdConfig,
    transport: Arc<dyn ObdTransport>,
    clock: Arc<dyn Clock>,
    response_consumer: ObdResponseConsumer,
    dtc_consumer: DtcConsumer,
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ObdOverCanModule {
    pub fn new(
        config: ObdConfig,
        transport: Arc<dyn ObdTransport>,
        clock: Arc<dyn Clock>,
        response_consumer: ObdResponseConsumer,
        dtc_consumer: DtcConsumer,
    ) -> Self {
        Self {
            config,
            transport,
            clock,
            response_consumer,
            dtc_consumer,
            shared: Arc::new(Shared {
                dictionary: Mutex::new(DictionaryState::default()),
                dictionary_available: AtomicBool::new(false),
                should_request_dtcs: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                wait: WaitEvent::new(),
                data_wait: WaitEvent::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the worker. With both intervals at 0 there is nothing to do and
    /// no thread is started.
    pub fn connect(&self) -> Result<(), AgentError> {
        if self.config.pid_request_interval_s == 0 && self.config.dtc_request_interval_s == 0 {
            trace!("both OBD intervals are 0, worker not started");
            return Ok(());
        }
        let mut thread = self.thread.lock();
        if thread.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Err(AgentError::SourceLifecycle {
                message: "OBD module already connected".to_string(),
            });
        }
        self.shared.should_stop.store(false, Ordering::Relaxed);
        self.shared.dictionary_available.store(false, Ordering::Relaxed);
        self.shared.should_request_dtcs.store(false, Ordering::Relaxed);
        let worker = ObdWorker {
            config: self.config.clone(),
            transport: self.transport.clone(),
            clock: self.clock.clone(),
            response_consumer: self.response_consumer.clone(),
            dtc_consumer: self.dtc_consumer.clone(),
            shared: self.shared.clone(),
        };
        let handle = thread::Builder::new()
            .name("obd-module".to_string())
            .spawn(move || worker.run())
            .map_err(|e| AgentError::SourceLifecycle {
                message: format!("failed to spawn OBD worker: {e}"),
            })?;
        *thread = Some(handle);
        info!(interface = %self.config.gateway_interface, "OBD module connected");
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut thread = self.thread.lock();
        self.shared.should_stop.store(true, Ordering::Relaxed);
        self.shared.wait.notify();
        self.shared.data_wait.notify();
        if let Some(handle) = thread.take() {
            let _ = handle.join();
        }
        self.shared.should_stop.store(false, Ordering::Relaxed);
        debug!("OBD module disconnected");
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Dictionary listener entry point; only the OBD protocol is relevant.
    pub fn on_dictionary_change(
        &self,
        dictionary: Option<Arc<DecoderDictionary>>,
        protocol: NetworkProtocol,
    ) {
        if protocol != NetworkProtocol::Obd {
            return;
        }
        let mut state = self.shared.dictionary.lock();
        state.pid_formats.clear();
        state.requested_pids.clear();

        let Some(dictionary) = dictionary else {
            trace!("empty OBD dictionary, module will pause PID requests");
            return;
        };
        let Some(can) = dictionary.as_can() else {
            warn!("dictionary variant mismatch for OBD, ignoring");
            return;
        };
        // OBD has one logical port; anything else is a malformed dictionary.
        if can.decoder_methods.len() != 1 {
            warn!(
                channels = can.decoder_methods.len(),
                "OBD dictionary must hold exactly one channel, ignoring"
            );
            return;
        }
        if let Some(methods) = can.decoder_methods.values().next() {
            for (frame_id, method) in methods {
                let pid = *frame_id as Pid;
                let collected = method
                    .format
                    .signals
                    .iter()
                    .any(|signal| can.signal_ids_to_collect.contains(&signal.signal_id));
                if collected {
                    state.requested_pids.push(pid);
                }
                state.pid_formats.insert(pid, method.format.clone());
            }
        }
        state.requested_pids.sort_unstable();
        debug!(pids = state.requested_pids.len(), "OBD dictionary updated");
        drop(state);

        self.shared.dictionary_available.store(true, Ordering::Relaxed);
        self.shared.data_wait.notify();
        self.shared.wait.notify();
    }

    /// Enables DTC requests while at least one active condition wants them.
    pub fn on_inspection_matrix_change(&self, matrix: Arc<InspectionMatrix>) {
        let wants_dtcs = matrix
            .conditions
            .iter()
            .any(|condition| condition.include_active_dtcs);
        self.shared
            .should_request_dtcs
            .store(wants_dtcs, Ordering::Relaxed);
        if wants_dtcs {
            info!("DTC requests enabled by inspection matrix");
            self.shared.data_wait.notify();
        }
    }
}

impl Drop for ObdOverCanModule {
    fn drop(&mut self) {
        if self.is_alive() {
            self.disconnect();
        }
    }
}

struct ObdWorker {
    config: ObdConfig,
    transport: Arc<dyn ObdTransport>,
    clock: Arc<dyn Clock>,
    response_consumer: ObdResponseConsumer,
    dtc_consumer: DtcConsumer,
    shared: Arc<Shared>,
}

impl ObdWorker {
    fn should_stop(&self) -> bool {
        self.shared.should_stop.load(Ordering::Relaxed)
    }

    fn run(self) {
        let Some(mut ecus) = self.discover_ecus() else {
            return;
        };
        self.steady_state(&mut ecus);
        for ecu in &mut ecus {
            ecu.close();
        }
    }

    /// Broadcast service-01/PID-00 until ECUs answer. Returns `None` when
    /// stopped or when channel setup fails unrecoverably.
    fn discover_ecus(&self) -> Option<Vec<ObdEcu>> {
        while !self.should_stop() {
            let dictionary_empty = self.shared.dictionary.lock().requested_pids.is_empty();
            if dictionary_empty && !self.shared.should_request_dtcs.load(Ordering::Relaxed) {
                trace!("no OBD dictionary and DTC requests disabled, module sleeping");
                self.shared.data_wait.wait();
                continue;
            }

            let mut extended = false;
            let mut responses = self.detect_ecu_ids(extended);
            if responses.is_empty() {
                extended = true;
                responses = self.detect_ecu_ids(extended);
            }
            trace!(count = responses.len(), extended, "ECU detection pass finished");

            if responses.is_empty() {
                self.shared.wait.wait_timeout(Duration::from_secs(1));
                continue;
            }

            let broadcast = if self.config.broadcast_requests {
                match self.transport.open_broadcast(extended) {
                    Ok(endpoint) => Some(Arc::new(Mutex::new(endpoint))),
                    Err(e) => {
                        error!(error = %e, "failed to open broadcast channel");
                        return None;
                    }
                }
            } else {
                None
            };

            let unique_ids: BTreeSet<u32> = responses.into_iter().collect();
            let mut ecus = Vec::with_capacity(unique_ids.len());
            for rx_id in unique_ids {
                let tx_id = tx_id_for_rx_id(rx_id, extended);
                match self.transport.open_channel(rx_id, tx_id, extended) {
                    Ok(channel) => {
                        ecus.push(ObdEcu::new(rx_id, channel, broadcast.clone(), self.clock.clone()))
                    }
                    Err(e) => {
                        error!(rx_id, error = %e, "failed to open ECU channel");
                        return None;
                    }
                }
            }
            info!(count = ecus.len(), extended, "ECUs initialized");
            return Some(ecus);
        }
        None
    }

    /// One detection pass: broadcast, then collect responses in the ECU id
    /// range for up to a second.
    fn detect_ecu_ids(&self, extended: bool) -> Vec<u32> {
        let mut endpoint = match self.transport.open_raw() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(error = %e, "failed to open raw endpoint for ECU detection");
                return Vec::new();
            }
        };

        let request = CanFrame {
            id: if extended { BROADCAST_EXTENDED_ID } else { BROADCAST_ID },
            extended,
            payload: Bytes::from_static(&[0x02, SERVICE_CURRENT_DATA, 0x00, 0, 0, 0, 0, 0]),
        };
        if let Err(e) = endpoint.send(&request) {
            error!(error = %e, "failed to send detection broadcast");
            endpoint.close();
            return Vec::new();
        }

        let mut responses = Vec::new();
        let timer = MonotonicTimer::new(self.clock.clone());
        while !self.should_stop() && timer.elapsed_ms() <= 1000 {
            match endpoint.receive_batch(16) {
                Ok(frames) if frames.is_empty() => {
                    // An empty poll after at least one response means the bus
                    // went quiet.
                    if !responses.is_empty() {
                        break;
                    }
                    self.shared
                        .wait
                        .wait_timeout(Duration::from_millis(P2_TIMEOUT_MS));
                }
                Ok(frames) => {
                    for frame in frames {
                        if is_ecu_response_id(frame.frame.id, extended) {
                            trace!(rx_id = format_args!("{:X}", frame.frame.id), "ECU responded");
                            responses.push(frame.frame.id);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "ECU detection receive failed");
                    break;
                }
            }
        }
        endpoint.close();
        responses
    }

    fn steady_state(&self, ecus: &mut [ObdEcu]) {
        let mut pid_timer = MonotonicTimer::new(self.clock.clone());
        let mut dtc_timer = MonotonicTimer::new(self.clock.clone());
        let mut has_acquired_supported_pids = false;

        while !self.should_stop() {
            if self.shared.dictionary_available.swap(false, Ordering::Relaxed)
                && has_acquired_supported_pids
            {
                // New dictionary over known ECUs: redo the partitioning.
                self.assign_pids_to_ecus(ecus);
            }

            if self.config.pid_request_interval_s > 0
                && pid_timer.elapsed_seconds() >= self.config.pid_request_interval_s
            {
                pid_timer.reset();
                let requested_empty = self.shared.dictionary.lock().requested_pids.is_empty();
                if !requested_empty {
                    if !has_acquired_supported_pids {
                        has_acquired_supported_pids = true;
                        self.acquire_and_assign(ecus);
                        pid_timer.reset();
                    }
                    for index in 0..ecus.len() {
                        match ecus[index].request_emission_pids(self.response_consumer.as_ref()) {
                            Ok(requests) => self.flush_other_ecus(ecus, index, requests),
                            Err(e) => warn!(error = %e, "emission PID request failed"),
                        }
                    }
                }
            }

            if self.config.dtc_request_interval_s > 0
                && dtc_timer.elapsed_seconds() >= self.config.dtc_request_interval_s
            {
                dtc_timer.reset();
                if self.shared.should_request_dtcs.load(Ordering::Relaxed) {
                    let mut info = DtcInfo {
                        receive_time_ms: self.clock.system_time_since_epoch_ms(),
                        codes: Vec::new(),
                    };
                    let mut any_success = false;
                    for index in 0..ecus.len() {
                        match ecus[index].request_stored_dtcs(&mut info) {
                            Ok((success, requests)) => {
                                any_success |= success;
                                self.flush_other_ecus(ecus, index, requests);
                            }
                            Err(e) => warn!(error = %e, "DTC request failed"),
                        }
                    }
                    // An empty code list is still a result: it means no ECU
                    // reported stored DTCs.
                    if any_success {
                        (self.dtc_consumer)(info);
                    }
                }
            }

            let sleep_ms = self.next_sleep_ms(&pid_timer, &dtc_timer);
            match sleep_ms {
                Some(sleep_ms) => {
                    trace!(sleep_ms, "OBD module waiting for next cycle");
                    self.shared.wait.wait_timeout(Duration::from_millis(sleep_ms));
                }
                None => {
                    warn!("OBD request cycle overdue");
                }
            }
        }
    }

    fn acquire_and_assign(&self, ecus: &mut [ObdEcu]) {
        for index in 0..ecus.len() {
            match ecus[index].acquire_supported_pids() {
                Ok(requests) => self.flush_other_ecus(ecus, index, requests),
                Err(e) => warn!(error = %e, "supported PID acquisition failed"),
            }
        }
        self.assign_pids_to_ecus(ecus);
    }

    /// Partition the requested PIDs: each PID goes to the first ECU that
    /// supports it and is never reassigned afterwards.
    fn assign_pids_to_ecus(&self, ecus: &mut [ObdEcu]) {
        let requested = self.shared.dictionary.lock().requested_pids.clone();
        let mut assigned = BTreeSet::new();
        for ecu in ecus.iter_mut() {
            ecu.assign_pids(&requested, &mut assigned);
            debug!(
                rx_id = format_args!("{:X}", ecu.rx_id()),
                assigned = ecu.assigned_pids().len(),
                "PIDs assigned"
            );
        }
    }

    /// After broadcast requests other ECUs answer too; drain their queues
    /// within one P2 budget so stale responses never pile up.
    fn flush_other_ecus(&self, ecus: &mut [ObdEcu], except: usize, request_count: usize) {
        if !self.config.broadcast_requests {
            return;
        }
        let mut budget = Duration::from_millis(P2_TIMEOUT_MS);
        for (index, ecu) in ecus.iter_mut().enumerate() {
            if index == except {
                continue;
            }
            for _ in 0..request_count {
                let spent = ecu.flush(budget);
                budget = budget.saturating_sub(spent);
                if budget.is_zero() {
                    return;
                }
            }
        }
    }

    /// Smaller remaining interval across the enabled timers; `None` when
    /// already overdue.
    fn next_sleep_ms(&self, pid_timer: &MonotonicTimer, dtc_timer: &MonotonicTimer) -> Option<u64> {
        let mut sleep_ms = u64::MAX;
        for (interval_s, timer) in [
            (self.config.pid_request_interval_s, pid_timer),
            (self.config.dtc_request_interval_s, dtc_timer),
        ] {
            if interval_s > 0 {
                let target = interval_s * 1000;
                let elapsed = timer.elapsed_ms();
                if elapsed >= target {
                    return None;
                }
                sleep_ms = sleep_ms.min(target - elapsed);
            }
        }
        Some(sleep_ms)
    }
}
