//! Per-ECU request/response handling.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use contracts::{Clock, Pid};

use crate::endpoint::{EndpointError, IsoTpEndpoint};
use crate::obd::types::{
    decode_stored_dtcs_response, decode_supported_pids_response, DtcInfo, MAX_PIDS_PER_REQUEST,
    P2_TIMEOUT_MS, SERVICE_CURRENT_DATA, SERVICE_STORED_DTCS, SUPPORTED_PID_RANGES,
};
use crate::obd::ObdResponse;

/// One detected ECU: its channel, the PIDs it reports as supported and the
/// subset this agent assigned to it.
pub struct ObdEcu {
    rx_id: u32,
    channel: Box<dyn IsoTpEndpoint>,
    /// Shared functional-broadcast channel; requests go out here when
    /// broadcast mode is on, responses still arrive per ECU.
    broadcast: Option<Arc<Mutex<Box<dyn IsoTpEndpoint>>>>,
    clock: Arc<dyn Clock>,
    supported_pids: Vec<Pid>,
    assigned_pids: Vec<Pid>,
}

impl ObdEcu {
    pub fn new(
        rx_id: u32,
        channel: Box<dyn IsoTpEndpoint>,
        broadcast: Option<Arc<Mutex<Box<dyn IsoTpEndpoint>>>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rx_id,
            channel,
            broadcast,
            clock,
            supported_pids: Vec::new(),
            assigned_pids: Vec::new(),
        }
    }

    pub fn rx_id(&self) -> u32 {
        self.rx_id
    }

    pub fn supports(&self, pid: Pid) -> bool {
        self.supported_pids.binary_search(&pid).is_ok()
    }

    pub fn assigned_pids(&self) -> &[Pid] {
        &self.assigned_pids
    }

    fn send_request(&mut self, payload: &[u8]) -> Result<(), EndpointError> {
        match &self.broadcast {
            Some(broadcast) => broadcast.lock().send(payload),
            None => self.channel.send(payload),
        }
    }

    /// Query the supported-PID bitmask ranges. Returns the number of
    /// requests sent, for broadcast flushing.
    pub fn acquire_supported_pids(&mut self) -> Result<usize, EndpointError> {
        self.supported_pids.clear();
        let mut requests = 0;
        for chunk in SUPPORTED_PID_RANGES.chunks(MAX_PIDS_PER_REQUEST) {
            let mut request = vec![SERVICE_CURRENT_DATA];
            request.extend_from_slice(chunk);
            self.send_request(&request)?;
            requests += 1;
            match self.channel.receive(Duration::from_millis(P2_TIMEOUT_MS))? {
                Some(response) => {
                    decode_supported_pids_response(&response, &mut self.supported_pids)
                }
                None => trace!(rx_id = self.rx_id, "no supported-PID response"),
            }
        }
        self.supported_pids.sort_unstable();
        self.supported_pids.dedup();
        trace!(
            rx_id = self.rx_id,
            supported = self.supported_pids.len(),
            "supported PIDs acquired"
        );
        Ok(requests)
    }

    /// Take every requested PID this ECU supports and nobody claimed yet.
    /// A PID assigned once stays with its ECU.
    pub fn assign_pids(&mut self, requested: &[Pid], already_assigned: &mut BTreeSet<Pid>) {
        self.assigned_pids = requested
            .iter()
            .copied()
            .filter(|pid| self.supports(*pid) && !already_assigned.contains(pid))
            .collect();
        already_assigned.extend(self.assigned_pids.iter().copied());
    }

    /// Request the assigned emission PIDs and hand each positive response to
    /// the consumer. Returns the number of requests sent.
    pub fn request_emission_pids(
        &mut self,
        consumer: &dyn Fn(ObdResponse),
    ) -> Result<usize, EndpointError> {
        let chunks: Vec<Vec<Pid>> = self
            .assigned_pids
            .chunks(MAX_PIDS_PER_REQUEST)
            .map(|chunk| chunk.to_vec())
            .collect();
        let mut requests = 0;
        for chunk in chunks {
            let mut request = vec![SERVICE_CURRENT_DATA];
            request.extend_from_slice(&chunk);
            self.send_request(&request)?;
            requests += 1;
            match self.channel.receive(Duration::from_millis(P2_TIMEOUT_MS))? {
                Some(response) if response.first() == Some(&(0x40 | SERVICE_CURRENT_DATA)) => {
                    metrics::counter!("obd_pid_responses").increment(1);
                    consumer(ObdResponse {
                        ecu_rx_id: self.rx_id,
                        service_id: SERVICE_CURRENT_DATA,
                        payload: response,
                        timestamp_ms: self.clock.system_time_since_epoch_ms(),
                    });
                }
                Some(response) => {
                    warn!(
                        rx_id = self.rx_id,
                        header = response.first().copied().unwrap_or(0),
                        "negative or malformed PID response"
                    );
                }
                None => {
                    metrics::counter!("obd_request_timeouts").increment(1);
                    trace!(rx_id = self.rx_id, "PID request timed out");
                }
            }
        }
        Ok(requests)
    }

    /// Request stored DTCs, appending decoded codes to `info`. Returns
    /// (got a valid response, requests sent).
    pub fn request_stored_dtcs(&mut self, info: &mut DtcInfo) -> Result<(bool, usize), EndpointError> {
        self.send_request(&[SERVICE_STORED_DTCS])?;
        match self.channel.receive(Duration::from_millis(P2_TIMEOUT_MS))? {
            Some(response) => Ok((decode_stored_dtcs_response(&response, &mut info.codes), 1)),
            None => Ok((false, 1)),
        }
    }

    /// Drain one pending broadcast response within `budget`, returning the
    /// time spent.
    pub fn flush(&mut self, budget: Duration) -> Duration {
        let started = Instant::now();
        match self.channel.receive(budget) {
            Ok(Some(stale)) => {
                trace!(rx_id = self.rx_id, bytes = stale.len(), "flushed broadcast response")
            }
            Ok(None) => {}
            Err(e) => warn!(rx_id = self.rx_id, error = %e, "flush receive failed"),
        }
        started.elapsed()
    }

    pub fn close(&mut self) {
        self.channel.close();
    }
}
