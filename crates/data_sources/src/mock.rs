//! Mock endpoints and transports.
//!
//! Simulated CAN buses and OBD ECUs behind the same endpoint traits the real
//! bindings implement. Used by the test suites and for running the agent
//! without vehicle hardware.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use contracts::Pid;

use crate::endpoint::{
    CanEndpointFactory, CanEndpointOptions, CanFrame, EndpointError, IsoTpEndpoint, ObdTransport,
    RawCanEndpoint, ReceivedCanFrame,
};
use crate::obd::{BROADCAST_EXTENDED_ID, BROADCAST_ID, SERVICE_CURRENT_DATA, SERVICE_STORED_DTCS};

/// Shared state of a simulated raw CAN bus.
#[derive(Default)]
struct CanNetworkState {
    frames: VecDeque<ReceivedCanFrame>,
    sent: Vec<CanFrame>,
    fd_supported: bool,
    fail_next_receive: Option<EndpointError>,
}

/// Handle to a simulated CAN bus; clones share the same bus.
#[derive(Clone)]
pub struct MockCanNetwork {
    state: Arc<Mutex<CanNetworkState>>,
}

impl MockCanNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CanNetworkState {
                fd_supported: true,
                ..Default::default()
            })),
        }
    }

    /// Queue an inbound frame, optionally carrying a kernel timestamp.
    pub fn push_frame(&self, id: u32, payload: &[u8], software_timestamp_ms: Option<u64>) {
        self.state.lock().frames.push_back(ReceivedCanFrame {
            frame: CanFrame {
                id,
                extended: false,
                payload: Bytes::copy_from_slice(payload),
            },
            software_timestamp_ms,
            hardware_timestamp_ms: software_timestamp_ms,
        });
    }

    pub fn set_fd_supported(&self, supported: bool) {
        self.state.lock().fd_supported = supported;
    }

    pub fn fail_next_receive(&self, error: EndpointError) {
        self.state.lock().fail_next_receive = Some(error);
    }

    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.state.lock().sent.clone()
    }
}

impl Default for MockCanNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockCanEndpointFactory {
    network: MockCanNetwork,
}

impl MockCanEndpointFactory {
    pub fn new(network: MockCanNetwork) -> Self {
        Self { network }
    }
}

impl CanEndpointFactory for MockCanEndpointFactory {
    fn open(&self, options: &CanEndpointOptions) -> Result<Box<dyn RawCanEndpoint>, EndpointError> {
        if options.require_fd && !self.network.state.lock().fd_supported {
            return Err(EndpointError::Unsupported(format!(
                "FD frames not supported on {}",
                options.interface_name
            )));
        }
        Ok(Box::new(MockCanEndpoint {
            network: self.network.clone(),
        }))
    }
}

struct MockCanEndpoint {
    network: MockCanNetwork,
}

impl RawCanEndpoint for MockCanEndpoint {
    fn receive_batch(&mut self, max_frames: usize) -> Result<Vec<ReceivedCanFrame>, EndpointError> {
        let mut state = self.network.state.lock();
        if let Some(error) = state.fail_next_receive.take() {
            return Err(error);
        }
        let count = state.frames.len().min(max_frames);
        Ok(state.frames.drain(..count).collect())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), EndpointError> {
        self.network.state.lock().sent.push(frame.clone());
        Ok(())
    }

    fn close(&mut self) {}
}

/// One simulated ECU.
struct EcuSpec {
    rx_id: u32,
    extended: bool,
    supported_pids: BTreeSet<Pid>,
    pid_payloads: BTreeMap<Pid, Vec<u8>>,
    stored_dtcs: Vec<u16>,
}

impl EcuSpec {
    /// 4-byte support bitmask for the range `(base, base + 0x20]`.
    fn support_mask(&self, base: Pid) -> [u8; 4] {
        let mut mask = [0u8; 4];
        for offset in 0..32u16 {
            let pid = u16::from(base) + 1 + offset;
            if pid <= 0xFF && self.supported_pids.contains(&(pid as Pid)) {
                mask[(offset / 8) as usize] |= 0x80 >> (offset % 8);
            }
        }
        mask
    }

    fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        match request.first()? {
            &SERVICE_CURRENT_DATA => {
                let mut response = vec![0x40 | SERVICE_CURRENT_DATA];
                for pid in &request[1..] {
                    if pid % 0x20 == 0 {
                        response.push(*pid);
                        response.extend(self.support_mask(*pid));
                    } else if self.supported_pids.contains(pid) {
                        response.push(*pid);
                        response.extend(
                            self.pid_payloads
                                .get(pid)
                                .cloned()
                                .unwrap_or_else(|| vec![0, 0]),
                        );
                    }
                }
                Some(response)
            }
            &SERVICE_STORED_DTCS => {
                let mut response = vec![0x40 | SERVICE_STORED_DTCS, self.stored_dtcs.len() as u8];
                for dtc in &self.stored_dtcs {
                    response.extend(dtc.to_be_bytes());
                }
                Some(response)
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct ObdNetworkState {
    ecus: Vec<EcuSpec>,
    /// rx id -> pending inbound responses for that ECU's channel.
    queues: HashMap<u32, VecDeque<Bytes>>,
    /// (rx id, request bytes) in send order, broadcast logged per ECU.
    request_log: Vec<(u32, Vec<u8>)>,
    opened_channels: Vec<(u32, u32, bool)>,
}

/// Handle to a simulated OBD gateway with a configurable set of ECUs.
#[derive(Clone)]
pub struct MockObdNetwork {
    state: Arc<Mutex<ObdNetworkState>>,
}

impl MockObdNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ObdNetworkState::default())),
        }
    }

    pub fn add_ecu(&self, rx_id: u32, extended: bool, supported_pids: &[Pid]) {
        self.state.lock().ecus.push(EcuSpec {
            rx_id,
            extended,
            supported_pids: supported_pids.iter().copied().collect(),
            pid_payloads: BTreeMap::new(),
            stored_dtcs: Vec::new(),
        });
    }

    pub fn set_pid_payload(&self, rx_id: u32, pid: Pid, payload: &[u8]) {
        let mut state = self.state.lock();
        if let Some(ecu) = state.ecus.iter_mut().find(|e| e.rx_id == rx_id) {
            ecu.pid_payloads.insert(pid, payload.to_vec());
        }
    }

    pub fn set_stored_dtcs(&self, rx_id: u32, dtcs: &[u16]) {
        let mut state = self.state.lock();
        if let Some(ecu) = state.ecus.iter_mut().find(|e| e.rx_id == rx_id) {
            ecu.stored_dtcs = dtcs.to_vec();
        }
    }

    /// Every request sent to `rx_id`, oldest first.
    pub fn requests_for(&self, rx_id: u32) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .request_log
            .iter()
            .filter(|(id, _)| *id == rx_id)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn opened_channels(&self) -> Vec<(u32, u32, bool)> {
        self.state.lock().opened_channels.clone()
    }
}

impl Default for MockObdNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockObdTransport {
    network: MockObdNetwork,
}

impl MockObdTransport {
    pub fn new(network: MockObdNetwork) -> Self {
        Self { network }
    }
}

impl ObdTransport for MockObdTransport {
    fn open_raw(&self) -> Result<Box<dyn RawCanEndpoint>, EndpointError> {
        Ok(Box::new(MockObdRawEndpoint {
            network: self.network.clone(),
            pending: VecDeque::new(),
        }))
    }

    fn open_channel(
        &self,
        rx_id: u32,
        tx_id: u32,
        extended: bool,
    ) -> Result<Box<dyn IsoTpEndpoint>, EndpointError> {
        let mut state = self.network.state.lock();
        state.opened_channels.push((rx_id, tx_id, extended));
        state.queues.entry(rx_id).or_default();
        Ok(Box::new(MockIsoTpChannel {
            network: self.network.clone(),
            rx_id: Some(rx_id),
        }))
    }

    fn open_broadcast(&self, _extended: bool) -> Result<Box<dyn IsoTpEndpoint>, EndpointError> {
        Ok(Box::new(MockIsoTpChannel {
            network: self.network.clone(),
            rx_id: None,
        }))
    }
}

/// Raw endpoint answering service-01/PID-00 discovery broadcasts.
struct MockObdRawEndpoint {
    network: MockObdNetwork,
    pending: VecDeque<ReceivedCanFrame>,
}

impl RawCanEndpoint for MockObdRawEndpoint {
    fn receive_batch(&mut self, max_frames: usize) -> Result<Vec<ReceivedCanFrame>, EndpointError> {
        let count = self.pending.len().min(max_frames);
        Ok(self.pending.drain(..count).collect())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), EndpointError> {
        let extended = frame.id == BROADCAST_EXTENDED_ID;
        if (frame.id == BROADCAST_ID || extended) && frame.payload.len() >= 3 {
            let state = self.network.state.lock();
            for ecu in state.ecus.iter().filter(|e| e.extended == extended) {
                let mut payload = vec![0x06, 0x41, 0x00];
                payload.extend(ecu.support_mask(0x00));
                self.pending.push_back(ReceivedCanFrame {
                    frame: CanFrame {
                        id: ecu.rx_id,
                        extended,
                        payload: Bytes::from(payload),
                    },
                    software_timestamp_ms: None,
                    hardware_timestamp_ms: None,
                });
            }
        }
        Ok(())
    }

    fn close(&mut self) {}
}

/// ISO-TP channel to one ECU (`rx_id` set) or the broadcast address.
struct MockIsoTpChannel {
    network: MockObdNetwork,
    rx_id: Option<u32>,
}

impl IsoTpEndpoint for MockIsoTpChannel {
    fn send(&mut self, payload: &[u8]) -> Result<(), EndpointError> {
        let mut state = self.network.state.lock();
        let targets: Vec<u32> = match self.rx_id {
            Some(rx_id) => vec![rx_id],
            // Functional broadcast: every ECU hears it and answers on its
            // own channel.
            None => state.ecus.iter().map(|e| e.rx_id).collect(),
        };
        for rx_id in targets {
            state.request_log.push((rx_id, payload.to_vec()));
            let response = state
                .ecus
                .iter()
                .find(|e| e.rx_id == rx_id)
                .and_then(|ecu| ecu.respond(payload));
            if let Some(response) = response {
                state
                    .queues
                    .entry(rx_id)
                    .or_default()
                    .push_back(Bytes::from(response));
            }
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Option<Bytes>, EndpointError> {
        let Some(rx_id) = self.rx_id else {
            return Ok(None);
        };
        Ok(self
            .network
            .state
            .lock()
            .queues
            .get_mut(&rx_id)
            .and_then(|queue| queue.pop_front()))
    }

    fn close(&mut self) {}
}
