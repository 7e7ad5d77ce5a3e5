//! Pipeline wiring: translator, store, scheme manager and data sources.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use contracts::{ChannelIdTranslator, Clock, SystemClock, WaitEvent};
use data_sources::{
    CanDataSource, CanEndpointFactory, CanSourceConfig, ObdConfig, ObdOverCanModule, ObdTransport,
};
use persistence::FileDocumentStore;
use scheme_manager::{SchemeManager, SchemeManagerConfig};

use crate::config::AgentConfig;

/// The wired-up agent. Endpoint bindings are injected so the same wiring
/// serves the real buses and the bundled simulator.
pub struct AgentPipeline {
    scheme_manager: Arc<SchemeManager>,
    can_sources: Vec<Arc<CanDataSource>>,
    obd_module: Option<Arc<ObdOverCanModule>>,
    fatal: Arc<WaitEvent>,
}

impl AgentPipeline {
    pub fn build(
        config: &AgentConfig,
        can_factory: Arc<dyn CanEndpointFactory>,
        obd_transport: Option<Arc<dyn ObdTransport>>,
    ) -> Result<Self> {
        let clock: Arc<dyn Clock> = SystemClock::shared();
        let fatal = Arc::new(WaitEvent::new());

        let mut translator = ChannelIdTranslator::new();
        for interface in &config.can_interfaces {
            translator.add(interface.interface_id.clone());
        }

        let store = Arc::new(
            FileDocumentStore::new(&config.persistence_dir)
                .context("failed to open persistence directory")?,
        );
        let scheme_manager = Arc::new(SchemeManager::new(
            store,
            translator.clone(),
            clock.clone(),
            SchemeManagerConfig {
                idle_time_ms: config.idle_time_ms,
            },
        ));

        let mut can_sources = Vec::new();
        for interface in &config.can_interfaces {
            let channel_id = translator.channel_numeric_id(&interface.interface_id);
            // Downstream decoding happens in the inspection pipeline; this
            // seam only accounts for the frames we hand over.
            let consumer = Arc::new(
                move |sample: &data_sources::CanFrameSample, _: &contracts::CanDecoderDictionary| {
                    debug!(
                        channel = sample.channel_id,
                        frame_id = format_args!("{:X}", sample.frame_id),
                        timestamp = sample.timestamp_ms,
                        "frame received"
                    );
                },
            );
            let source = Arc::new(CanDataSource::new(
                CanSourceConfig {
                    channel_id,
                    interface_name: interface.name.clone(),
                    timestamp_type: interface.timestamp_type,
                    force_can_fd: interface.force_can_fd,
                    idle_time_ms: interface.idle_time_ms,
                },
                can_factory.clone(),
                consumer,
                clock.clone(),
            ));
            {
                let fatal = fatal.clone();
                source.set_fatal_error_callback(Arc::new(move |e| {
                    error!(error = %e, "fatal data source error");
                    fatal.notify();
                }));
            }
            {
                let source = source.clone();
                scheme_manager.subscribe_dictionary_changed(Arc::new(
                    move |dictionary, protocol| source.on_dictionary_change(dictionary, protocol),
                ));
            }
            can_sources.push(source);
        }

        let obd_module = match (&config.obd, obd_transport) {
            (Some(obd), Some(transport)) => {
                let module = Arc::new(ObdOverCanModule::new(
                    ObdConfig {
                        gateway_interface: obd.gateway_interface.clone(),
                        pid_request_interval_s: obd.pid_request_interval_s,
                        dtc_request_interval_s: obd.dtc_request_interval_s,
                        broadcast_requests: obd.broadcast_requests,
                    },
                    transport,
                    clock.clone(),
                    Arc::new(|response| {
                        debug!(
                            ecu = format_args!("{:X}", response.ecu_rx_id),
                            bytes = response.payload.len(),
                            "OBD response received"
                        );
                    }),
                    Arc::new(|info| {
                        info!(codes = info.codes.len(), "stored DTCs received");
                    }),
                ));
                {
                    let module = module.clone();
                    scheme_manager.subscribe_dictionary_changed(Arc::new(
                        move |dictionary, protocol| module.on_dictionary_change(dictionary, protocol),
                    ));
                }
                {
                    let module = module.clone();
                    scheme_manager.subscribe_inspection_matrix_changed(Arc::new(move |matrix| {
                        module.on_inspection_matrix_change(matrix)
                    }));
                }
                Some(module)
            }
            _ => None,
        };

        scheme_manager.subscribe_checkin_documents_changed(Arc::new(|documents| {
            info!(documents = documents.len(), "checkin document set changed");
        }));

        Ok(Self {
            scheme_manager,
            can_sources,
            obd_module,
            fatal,
        })
    }

    /// Transport-facing document ingress.
    pub fn scheme_manager(&self) -> &Arc<SchemeManager> {
        &self.scheme_manager
    }

    pub fn start(&self) -> Result<()> {
        for source in &self.can_sources {
            source.connect().context("CAN source failed to connect")?;
        }
        if let Some(obd) = &self.obd_module {
            obd.connect().context("OBD module failed to connect")?;
        }
        if !self.scheme_manager.start() {
            anyhow::bail!("scheme manager failed to start");
        }
        info!(
            can_sources = self.can_sources.len(),
            obd = self.obd_module.is_some(),
            "agent pipeline started"
        );
        Ok(())
    }

    /// Block until a fatal source error is reported.
    pub fn wait_for_fatal_error(&self) {
        self.fatal.wait();
    }

    pub fn shutdown(&self) {
        self.scheme_manager.stop();
        if let Some(obd) = &self.obd_module {
            obd.disconnect();
        }
        for source in &self.can_sources {
            source.disconnect();
        }
        info!("agent pipeline shut down");
    }
}
