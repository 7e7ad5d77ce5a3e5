//! Scheme manager: ingress, worker thread and listener fan-out.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use contracts::{
    ActiveSchemes, CallbackList, CheckinCallback, ChannelIdTranslator, Clock,
    CustomDecoderMapCallback, DictionaryChangeCallback, FetchMatrixCallback,
    InspectionMatrixCallback, ActiveSchemesCallback, RawBufferConfigCallback, SyncId, WaitEvent,
};
use persistence::{DocumentSlot, DocumentStore};

use crate::extractor::{extract_decoder_dictionaries, extract_matrices, raw_buffer_configs};
use crate::partial::PartialSignalRegistry;
use crate::state::SchemeState;

const DEFAULT_IDLE_TIME_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct SchemeManagerConfig {
    /// Upper bound on one worker sleep. 0 keeps the default.
    pub idle_time_ms: u64,
}

impl Default for SchemeManagerConfig {
    fn default() -> Self {
        Self {
            idle_time_ms: DEFAULT_IDLE_TIME_MS,
        }
    }
}

/// Pending document slots filled by ingress, drained by the worker. This is
/// the only state ingress ever touches.
#[derive(Default)]
struct Intake {
    pending_manifest: Option<Bytes>,
    pending_schemes: Option<Bytes>,
    pending_templates: Option<Bytes>,
    known_scheme_ids: Vec<SyncId>,
}

#[derive(Default)]
struct Listeners {
    dictionary: CallbackList<DictionaryChangeCallback>,
    inspection: CallbackList<InspectionMatrixCallback>,
    fetch: CallbackList<FetchMatrixCallback>,
    active_schemes: CallbackList<ActiveSchemesCallback>,
    custom_map: CallbackList<CustomDecoderMapCallback>,
    checkin: CallbackList<CheckinCallback>,
    raw_buffer: CallbackList<RawBufferConfigCallback>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    store: Arc<dyn DocumentStore>,
    translator: ChannelIdTranslator,
    idle_time_ms: u64,
    should_stop: AtomicBool,
    wait: WaitEvent,
    intake: Mutex<Intake>,
    listeners: Listeners,
}

/// Owns the worker thread that serializes every state change to the scheme
/// maps and timeline. Ingress methods are callable from any thread and
/// return after queueing.
pub struct SchemeManager {
    inner: Arc<Inner>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SchemeManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        translator: ChannelIdTranslator,
        clock: Arc<dyn Clock>,
        config: SchemeManagerConfig,
    ) -> Self {
        let idle_time_ms = if config.idle_time_ms == 0 {
            DEFAULT_IDLE_TIME_MS
        } else {
            config.idle_time_ms
        };
        Self {
            inner: Arc::new(Inner {
                clock,
                store,
                translator,
                idle_time_ms,
                should_stop: AtomicBool::new(false),
                wait: WaitEvent::new(),
                intake: Mutex::new(Intake::default()),
                listeners: Listeners::default(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> bool {
        let mut thread = self.thread.lock();
        if thread.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            warn!("scheme manager already running");
            return false;
        }
        self.inner.should_stop.store(false, Ordering::Relaxed);
        let inner = self.inner.clone();
        match thread::Builder::new()
            .name("scheme-manager".to_string())
            .spawn(move || Worker::new(inner).run())
        {
            Ok(handle) => {
                *thread = Some(handle);
                info!("scheme manager thread started");
                true
            }
            Err(e) => {
                error!(error = %e, "scheme manager thread failed to start");
                false
            }
        }
    }

    /// Idempotent; safe to call on a never-started manager.
    pub fn stop(&self) {
        let mut thread = self.thread.lock();
        self.inner.should_stop.store(true, Ordering::Relaxed);
        self.inner.wait.notify();
        if let Some(handle) = thread.take() {
            let _ = handle.join();
        }
        self.inner.should_stop.store(false, Ordering::Relaxed);
        info!("scheme manager thread stopped");
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Queue a serialized decoder manifest received from the transport.
    pub fn on_decoder_manifest(&self, payload: Bytes) {
        self.inner.intake.lock().pending_manifest = Some(payload);
        self.inner.wait.notify();
    }

    /// Queue a serialized collection-scheme list received from the transport.
    pub fn on_collection_scheme_list(&self, payload: Bytes) {
        self.inner.intake.lock().pending_schemes = Some(payload);
        self.inner.wait.notify();
    }

    /// Queue a serialized state-template diff.
    pub fn on_state_templates(&self, payload: Bytes) {
        self.inner.intake.lock().pending_templates = Some(payload);
        self.inner.wait.notify();
    }

    /// Snapshot of the scheme ids in the last adopted list.
    pub fn scheme_arns(&self) -> Vec<SyncId> {
        self.inner.intake.lock().known_scheme_ids.clone()
    }

    pub fn subscribe_dictionary_changed(&self, callback: Arc<DictionaryChangeCallback>) {
        self.inner.listeners.dictionary.subscribe(callback);
    }

    pub fn subscribe_inspection_matrix_changed(&self, callback: Arc<InspectionMatrixCallback>) {
        self.inner.listeners.inspection.subscribe(callback);
    }

    pub fn subscribe_fetch_matrix_changed(&self, callback: Arc<FetchMatrixCallback>) {
        self.inner.listeners.fetch.subscribe(callback);
    }

    pub fn subscribe_active_schemes_changed(&self, callback: Arc<ActiveSchemesCallback>) {
        self.inner.listeners.active_schemes.subscribe(callback);
    }

    pub fn subscribe_custom_decoder_map_changed(&self, callback: Arc<CustomDecoderMapCallback>) {
        self.inner.listeners.custom_map.subscribe(callback);
    }

    pub fn subscribe_checkin_documents_changed(&self, callback: Arc<CheckinCallback>) {
        self.inner.listeners.checkin.subscribe(callback);
    }

    pub fn subscribe_raw_buffer_config_changed(&self, callback: Arc<RawBufferConfigCallback>) {
        self.inner.listeners.raw_buffer.subscribe(callback);
    }
}

impl Drop for SchemeManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-side state; lives entirely on the worker thread.
struct Worker {
    inner: Arc<Inner>,
    state: SchemeState,
    registry: PartialSignalRegistry,
}

impl Worker {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            state: SchemeState::new(),
            registry: PartialSignalRegistry::new(),
        }
    }

    fn run(mut self) {
        self.retrieve_persisted_documents();

        let mut initial_checkin = true;
        loop {
            let (manifest_payload, schemes_payload, templates_payload) = {
                let mut intake = self.inner.intake.lock();
                (
                    intake.pending_manifest.take(),
                    intake.pending_schemes.take(),
                    intake.pending_templates.take(),
                )
            };

            let mut manifest_changed = false;
            let mut enabled_changed = false;
            let mut templates_changed = false;

            if let Some(payload) = manifest_payload {
                manifest_changed = self.process_decoder_manifest(&payload);
            }
            if let Some(payload) = schemes_payload {
                enabled_changed = self.process_scheme_list(&payload);
            }
            if let Some(payload) = templates_payload {
                templates_changed = self.process_state_templates(&payload);
            }

            let now = self.inner.clock.time_since_epoch();
            if self.state.check_timeline(now) {
                enabled_changed = true;
            }

            let documents_changed = manifest_changed || enabled_changed || templates_changed;
            if documents_changed || initial_checkin {
                initial_checkin = false;
                let documents = self.state.checkin_documents();
                self.inner
                    .listeners
                    .checkin
                    .notify(|callback| callback(&documents));
            }

            if documents_changed {
                self.extract_and_publish(manifest_changed, enabled_changed);
            }

            // Sleep until the next timeline edge, an ingress notification or
            // stop, whichever comes first. Wall clock on purpose: timeline
            // entries are absolute points in time and must follow clock jumps.
            let now_ms = self.inner.clock.system_time_since_epoch_ms();
            match self.state.next_wake_time() {
                None => self.inner.wait.wait(),
                Some(top) if now_ms >= top => {
                    // Next edge already due, go straight into the next cycle.
                }
                Some(top) => {
                    let wait_ms = (top - now_ms).min(self.inner.idle_time_ms);
                    trace!(wait_ms, "scheme manager going to wait");
                    self.inner.wait.wait_timeout(Duration::from_millis(wait_ms));
                }
            }

            if self.inner.should_stop.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    /// Best-effort bootstrap from the persistent store: feed the last-known
    /// documents back through the regular processing path.
    fn retrieve_persisted_documents(&mut self) {
        let mut intake = self.inner.intake.lock();
        {
            let slot = DocumentSlot::CollectionSchemeList;
            let pending = &mut intake.pending_schemes;
            match self.inner.store.load(slot) {
                Ok(Some(payload)) if pending.is_none() => {
                    debug!(slot = slot.name(), bytes = payload.len(), "retrieved persisted document");
                    *pending = Some(Bytes::from(payload));
                }
                Ok(_) => {}
                Err(e) => warn!(slot = slot.name(), error = %e, "failed to retrieve persisted document"),
            }
        }
        {
            let slot = DocumentSlot::DecoderManifest;
            let pending = &mut intake.pending_manifest;
            match self.inner.store.load(slot) {
                Ok(Some(payload)) if pending.is_none() => {
                    debug!(slot = slot.name(), bytes = payload.len(), "retrieved persisted document");
                    *pending = Some(Bytes::from(payload));
                }
                Ok(_) => {}
                Err(e) => warn!(slot = slot.name(), error = %e, "failed to retrieve persisted document"),
            }
        }
        {
            let slot = DocumentSlot::StateTemplateList;
            let pending = &mut intake.pending_templates;
            match self.inner.store.load(slot) {
                Ok(Some(payload)) if pending.is_none() => {
                    debug!(slot = slot.name(), bytes = payload.len(), "retrieved persisted document");
                    *pending = Some(Bytes::from(payload));
                }
                Ok(_) => {}
                Err(e) => warn!(slot = slot.name(), error = %e, "failed to retrieve persisted document"),
            }
        }
    }

    fn process_decoder_manifest(&mut self, payload: &Bytes) -> bool {
        let manifest = match document_loader::build_decoder_manifest(payload) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(error = %e, "failed to build incoming decoder manifest");
                metrics::counter!("scheme_manager_document_errors").increment(1);
                return false;
            }
        };
        if manifest.sync_id == self.state.current_manifest_id() {
            trace!(sync_id = %manifest.sync_id, "ignoring decoder manifest with unchanged sync id");
            return false;
        }
        info!(
            old = %self.state.current_manifest_id(),
            new = %manifest.sync_id,
            enabled = self.state.enabled.len(),
            idle = self.state.idle.len(),
            "replacing decoder manifest"
        );
        self.registry.reset_epoch(&manifest.sync_id);
        let manifest = Arc::new(manifest);
        if let Err(e) = self.inner.store.save(DocumentSlot::DecoderManifest, payload) {
            warn!(error = %e, "failed to persist decoder manifest");
        }
        let custom_map = Arc::new(manifest.custom_decoders.clone());
        self.inner
            .listeners
            .custom_map
            .notify(|callback| callback(&manifest.sync_id, custom_map.clone()));
        self.state.current_manifest = Some(manifest);
        true
    }

    fn process_scheme_list(&mut self, payload: &Bytes) -> bool {
        let list = match document_loader::build_scheme_list(payload) {
            Ok(list) => list,
            Err(e) => {
                error!(error = %e, "incoming collection scheme list failed to build");
                metrics::counter!("scheme_manager_document_errors").increment(1);
                return false;
            }
        };
        if let Err(e) = self
            .inner
            .store
            .save(DocumentSlot::CollectionSchemeList, payload)
        {
            warn!(error = %e, "failed to persist collection scheme list");
        }
        self.inner.intake.lock().known_scheme_ids = list.scheme_ids();

        let now = self.inner.clock.time_since_epoch();
        if self.state.is_scheme_loaded() {
            self.state.reconcile(&list, now)
        } else {
            self.state.rebuild(&list, now)
        }
    }

    fn process_state_templates(&mut self, payload: &Bytes) -> bool {
        let diff = match document_loader::build_state_templates(payload) {
            Ok(diff) => diff,
            Err(e) => {
                error!(error = %e, "incoming state templates failed to build");
                metrics::counter!("scheme_manager_document_errors").increment(1);
                return false;
            }
        };
        let modified = self.state.apply_state_templates(&diff);
        if modified {
            self.persist_state_templates(diff.version);
        }
        modified
    }

    /// The installed template set round-trips through the diff format, so
    /// startup retrieval replays it like a regular arrival.
    fn persist_state_templates(&self, version: u64) {
        let snapshot = contracts::StateTemplatesDiff {
            version,
            add: self
                .state
                .state_templates
                .values()
                .map(|template| (**template).clone())
                .collect(),
            remove: Vec::new(),
        };
        match serde_json::to_vec(&snapshot) {
            Ok(payload) => {
                if let Err(e) = self
                    .inner
                    .store
                    .save(DocumentSlot::StateTemplateList, &payload)
                {
                    warn!(error = %e, "failed to persist state templates");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize state templates"),
        }
    }

    fn extract_and_publish(&mut self, manifest_changed: bool, enabled_changed: bool) {
        let scheme_set_changed = manifest_changed || enabled_changed;

        if scheme_set_changed {
            // All-or-nothing: components interested in whole schemes only get
            // them once every retained scheme agrees with the manifest.
            let mut active = ActiveSchemes::default();
            if self.state.schemes_in_sync_with_manifest() {
                active.schemes = self.state.enabled.values().cloned().collect();
            }
            let active = Arc::new(active);
            self.inner
                .listeners
                .active_schemes
                .notify(|callback| callback(active.clone()));
        }

        let dictionaries =
            extract_decoder_dictionaries(&self.state, &self.inner.translator, &mut self.registry);
        let matrices = scheme_set_changed
            .then(|| extract_matrices(&self.state, &mut self.registry));

        // Dictionaries are published before the matrices: dictionary
        // extraction allocates the synthetic ids the matrices refer to, and
        // consumers are expected to tolerate the dictionary running slightly
        // ahead.
        for (protocol, dictionary) in &dictionaries {
            self.inner
                .listeners
                .dictionary
                .notify(|callback| callback(dictionary.clone(), *protocol));
        }

        if let Some((inspection, fetch)) = matrices {
            info!(
                manifest = %self.state.current_manifest_id(),
                enabled = self.state.enabled.len(),
                conditions = inspection.conditions.len(),
                "activated collection schemes"
            );
            let inspection = Arc::new(inspection);
            self.inner
                .listeners
                .inspection
                .notify(|callback| callback(inspection.clone()));
            let fetch = Arc::new(fetch);
            self.inner
                .listeners
                .fetch
                .notify(|callback| callback(fetch.clone()));
        }

        let buffer_configs = raw_buffer_configs(&dictionaries);
        info!(
            signals = buffer_configs.len(),
            "updating raw buffer configuration"
        );
        self.inner
            .listeners
            .raw_buffer
            .notify(|callback| callback(&buffer_configs));
    }
}
