//! Worker-confined scheduler state: enabled/idle maps, timeline, installed
//! documents.
//!
//! Only the manager's worker thread touches this; ingress never reaches in
//! here directly.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{info, trace};

use contracts::{
    CollectionScheme, DecoderManifest, SchemeList, StateTemplate, StateTemplatesDiff, SyncId,
    TimePoint, Timestamp,
};

use crate::timeline::Timeline;

#[derive(Default)]
pub struct SchemeState {
    /// Schemes currently inside their activation window.
    pub enabled: BTreeMap<SyncId, Arc<CollectionScheme>>,
    /// Schemes waiting for their start time.
    pub idle: BTreeMap<SyncId, Arc<CollectionScheme>>,
    pub timeline: Timeline,
    pub current_manifest: Option<Arc<DecoderManifest>>,
    pub state_templates: BTreeMap<SyncId, Arc<StateTemplate>>,
    last_templates_version: u64,
}

impl SchemeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync id of the installed manifest, empty when none was installed yet.
    pub fn current_manifest_id(&self) -> &str {
        self.current_manifest
            .as_ref()
            .map(|m| m.sync_id.as_str())
            .unwrap_or("")
    }

    pub fn is_scheme_loaded(&self) -> bool {
        !self.enabled.is_empty() || !self.idle.is_empty()
    }

    /// True when every retained scheme references the installed manifest.
    pub fn schemes_in_sync_with_manifest(&self) -> bool {
        let current = self.current_manifest_id();
        self.enabled
            .values()
            .chain(self.idle.values())
            .all(|scheme| {
                let in_sync = scheme.decoder_manifest_id == current;
                if !in_sync {
                    info!(
                        scheme_manifest = %scheme.decoder_manifest_id,
                        current_manifest = %current,
                        "decoder manifest out of sync"
                    );
                }
                in_sync
            })
    }

    /// Document ids reported on the next checkin: enabled, idle, manifest,
    /// state templates. The maps are disjoint so every id appears once.
    pub fn checkin_documents(&self) -> Vec<SyncId> {
        let mut documents: Vec<SyncId> = self.enabled.keys().cloned().collect();
        documents.extend(self.idle.keys().cloned());
        if let Some(manifest) = &self.current_manifest {
            documents.push(manifest.sync_id.clone());
        }
        documents.extend(self.state_templates.keys().cloned());
        documents
    }

    /// Rebuild both maps and the timeline from scratch. Used when no scheme
    /// is loaded yet. Returns true when a scheme got enabled immediately.
    pub fn rebuild(&mut self, list: &SchemeList, now: TimePoint) -> bool {
        let mut enabled_changed = false;
        for scheme in &list.schemes {
            let start = scheme.start_time_ms;
            let expiry = scheme.expiry_time_ms;
            if start == expiry {
                // Zero-duration window, can never be active.
                continue;
            }
            if start > now.system_time_ms {
                self.idle.insert(scheme.id.clone(), scheme.clone());
                self.timeline.push(start, scheme.id.clone());
                self.timeline.push(expiry, scheme.id.clone());
            } else if expiry > now.system_time_ms {
                // Start already passed, enable right away.
                self.enabled.insert(scheme.id.clone(), scheme.clone());
                self.timeline.push(expiry, scheme.id.clone());
                enabled_changed = true;
            }
        }
        trace!(
            enabled = self.enabled.len(),
            idle = self.idle.len(),
            "scheme maps rebuilt"
        );
        enabled_changed
    }

    /// Reconcile an incoming list against the loaded maps and timeline.
    /// Returns true when the enabled map changed.
    pub fn reconcile(&mut self, list: &SchemeList, now: TimePoint) -> bool {
        let mut enabled_changed = false;
        let mut incoming_ids: HashSet<&SyncId> = HashSet::with_capacity(list.schemes.len());
        let now_ms = now.system_time_ms;

        for scheme in &list.schemes {
            let start = scheme.start_time_ms;
            let expiry = scheme.expiry_time_ms;
            let id = &scheme.id;
            incoming_ids.insert(id);

            if start == expiry {
                // Zero-duration window: treated as never enabled.
                if self.enabled.remove(id).is_some() {
                    enabled_changed = true;
                }
                self.idle.remove(id);
                continue;
            }

            if let Some(current) = self.enabled.get(id).cloned() {
                // Already running: only the expiry (or a content change) matters.
                if expiry <= now_ms {
                    self.enabled.remove(id);
                    enabled_changed = true;
                    trace!(scheme_id = %id, expiry, "stopping enabled scheme");
                } else {
                    if expiry != current.expiry_time_ms {
                        self.enabled.insert(id.clone(), scheme.clone());
                        self.timeline.push(expiry, id.clone());
                    }
                    if **scheme != *current {
                        self.enabled.insert(id.clone(), scheme.clone());
                        enabled_changed = true;
                    }
                }
            } else if let Some(current) = self.idle.get(id).cloned() {
                if scheme.is_active_at(now_ms) {
                    self.idle.remove(id);
                    self.enabled.insert(id.clone(), scheme.clone());
                    self.timeline.push(expiry, id.clone());
                    enabled_changed = true;
                    trace!(scheme_id = %id, start, expiry, "starting idle scheme now");
                } else if start > now_ms
                    && (start != current.start_time_ms || expiry != current.expiry_time_ms)
                {
                    self.idle.insert(id.clone(), scheme.clone());
                    self.timeline.push(start, id.clone());
                    self.timeline.push(expiry, id.clone());
                } else {
                    self.idle.insert(id.clone(), scheme.clone());
                }
            } else {
                // New scheme: enable immediately when overdue, otherwise park it.
                trace!(scheme_id = %id, start, expiry, "adding new scheme");
                if scheme.is_active_at(now_ms) {
                    self.enabled.insert(id.clone(), scheme.clone());
                    self.timeline.push(expiry, id.clone());
                    enabled_changed = true;
                } else if start > now_ms {
                    self.idle.insert(id.clone(), scheme.clone());
                    self.timeline.push(start, id.clone());
                    self.timeline.push(expiry, id.clone());
                }
            }
        }

        // Anything the incoming list no longer mentions is gone.
        let removed_idle: Vec<SyncId> = self
            .idle
            .keys()
            .filter(|id| !incoming_ids.contains(id))
            .cloned()
            .collect();
        for id in &removed_idle {
            self.idle.remove(id);
        }
        let removed_enabled: Vec<SyncId> = self
            .enabled
            .keys()
            .filter(|id| !incoming_ids.contains(id))
            .cloned()
            .collect();
        for id in &removed_enabled {
            self.enabled.remove(id);
            enabled_changed = true;
        }
        if !removed_idle.is_empty() || !removed_enabled.is_empty() {
            trace!(
                idle = removed_idle.len(),
                enabled = removed_enabled.len(),
                "removed schemes missing from incoming list"
            );
        }

        enabled_changed
    }

    /// Pop every due timeline entry and flip the referenced schemes.
    ///
    /// Entry validity: an entry for an enabled scheme must match its expiry,
    /// an entry for an idle scheme must match its start; anything else is
    /// stale and silently discarded. Returns true when the enabled map
    /// changed.
    pub fn check_timeline(&mut self, now: TimePoint) -> bool {
        let mut enabled_changed = false;
        let now_ms = now.system_time_ms;

        if self
            .timeline
            .peek()
            .map(|top| top.time_ms > now_ms)
            .unwrap_or(true)
        {
            return false;
        }

        while let Some(top) = self.timeline.peek() {
            let top_time = top.time_ms;
            let scheme_id = top.scheme_id.clone();

            let (scheme, found_in_enabled) = match self.enabled.get(&scheme_id) {
                Some(scheme) => (scheme.clone(), true),
                None => match self.idle.get(&scheme_id) {
                    Some(scheme) => (scheme.clone(), false),
                    None => {
                        trace!(scheme_id = %scheme_id, "timeline entry for unknown scheme, discarding");
                        metrics::counter!("scheme_manager_stale_timeline_entries").increment(1);
                        self.timeline.pop();
                        continue;
                    }
                },
            };

            let time_of_interest = if found_in_enabled {
                scheme.expiry_time_ms
            } else {
                scheme.start_time_ms
            };
            if time_of_interest != top_time {
                trace!(
                    scheme_id = %scheme_id,
                    top_time,
                    expected = time_of_interest,
                    "timeline entry no longer matches scheme, discarding"
                );
                metrics::counter!("scheme_manager_stale_timeline_entries").increment(1);
                self.timeline.pop();
                continue;
            }

            if top_time > now_ms {
                // Next valid wake found, stop here.
                break;
            }

            enabled_changed = true;
            if found_in_enabled {
                info!(scheme_id = %scheme_id, expiry = top_time, "disabling expired scheme");
                self.enabled.remove(&scheme_id);
            } else {
                info!(scheme_id = %scheme_id, start = top_time, "enabling idle scheme");
                self.idle.remove(&scheme_id);
                self.enabled.insert(scheme_id, scheme);
            }
            self.timeline.pop();
        }

        enabled_changed
    }

    /// Apply a versioned add/remove diff over the installed state templates.
    /// Stale versions are ignored. Returns true when the set changed.
    pub fn apply_state_templates(&mut self, diff: &StateTemplatesDiff) -> bool {
        if diff.version < self.last_templates_version {
            trace!(
                version = diff.version,
                current = self.last_templates_version,
                "ignoring stale state templates diff"
            );
            return false;
        }
        self.last_templates_version = diff.version;

        let mut modified = false;
        for id in &diff.remove {
            if self.state_templates.remove(id).is_some() {
                modified = true;
            }
        }
        for template in &diff.add {
            if self.state_templates.contains_key(&template.id) {
                continue;
            }
            self.state_templates
                .insert(template.id.clone(), Arc::new(template.clone()));
            modified = true;
        }
        modified
    }

    /// Wall time of the earliest timeline entry, stale or not.
    pub fn next_wake_time(&self) -> Option<Timestamp> {
        self.timeline.peek().map(|top| top.time_ms)
    }
}
