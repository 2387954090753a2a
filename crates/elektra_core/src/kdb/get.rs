//! The read pipeline.
//!
//! Phases run in a fixed order across all selected backends: `init` (only
//! for backends not initialized yet), `resolver`, the optional
//! `cachecheck`, `prestorage`, `storage` and `poststorage`, with the
//! cross-cutting `procgetstorage` and `postgetstorage` hooks between
//! merging and re-dividing the data. All backends finish a phase before
//! any backend enters the next one.

use crate::error::{add_warning, set_error, KdbError, KdbResult};
use crate::global::GlobalPosition;
use crate::key::name::Namespace;
use crate::key::Key;
use crate::keyset::KeySet;
use crate::kdb::{
    call_backend, call_backend_init, check_parent, record_failure, unexpected_status,
    with_context, EntryPoint, GetOutcome, Kdb, MODULE,
};
use crate::mount::MountTable;
use crate::plugin::{Phase, PluginStatus, SharedKeySet};
use std::sync::Arc;
use tracing::debug;

impl Kdb {
    /// Retrieves the keys below (and at) the parent key.
    ///
    /// The result key set may already contain keys; keys outside the
    /// retrieved subtrees are preserved, keys inside them are replaced by
    /// the retrieved state (so keys deleted by another writer vanish).
    ///
    /// Returns [`GetOutcome::Unchanged`] and leaves the result key set
    /// untouched when nothing changed since the last call on this handle.
    ///
    /// # Errors
    ///
    /// On failure the result key set is unchanged and the error is also
    /// recorded in the parent key's metadata. Prior error and warning
    /// metadata on the parent key is cleared in any case.
    pub fn get(&mut self, ks: &mut KeySet, parent: &mut Key) -> KdbResult<GetOutcome> {
        let Some(precondition) = check_parent(parent) else {
            return Err(KdbError::interface(
                "parent key with read-only metadata passed",
            ));
        };
        if let Err(e) = precondition {
            set_error(parent, &e, MODULE);
            return Err(e);
        }

        let initial = parent.clone();
        let result = self.get_inner(ks, parent, &initial);

        // restore the parent key; its value reports the storage identifier
        // of the backend owning the parent
        parent.set_read_only_name(false);
        parent.set_read_only_value(false);
        parent.set_name_internal(initial.name().clone());
        let owner_id = self
            .backends
            .find_parent(initial.name())
            .and_then(|i| self.backends.get(i))
            .and_then(|b| b.mountpoint_id.clone());
        let _ = parent.set_string(owner_id.unwrap_or_default());

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                set_error(parent, &e, MODULE);
                Err(e)
            }
        }
    }

    fn get_inner(
        &mut self,
        ks: &mut KeySet,
        parent: &mut Key,
        initial: &Key,
    ) -> KdbResult<GetOutcome> {
        debug!(parent = %initial.name(), "kdbGet");
        let global = Arc::clone(&self.global);
        let selection = self.backends.selection_for(initial.name());

        init_backends(&mut self.backends, &selection, &global, parent)?;
        resolve_for_get(&mut self.backends, &selection, &global, parent)?;

        // drop up-to-date backends
        let updated: Vec<usize> = selection
            .iter()
            .copied()
            .filter(|&i| self.backends.get(i).is_some_and(|b| b.needs_update))
            .collect();
        if updated.is_empty() {
            debug!(parent = %initial.name(), "kdbGet: nothing changed");
            return Ok(GetOutcome::Unchanged);
        }

        // cachecheck: backends whose cached key set is still valid skip the
        // storage phases and reuse their working set
        let mut loading = Vec::with_capacity(updated.len());
        for &i in &updated {
            if !cache_check(&mut self.backends, i, &global, parent) {
                loading.push(i);
            }
        }

        run_get_phase(&mut self.backends, &loading, &global, parent, Phase::PreStorage)?;

        // prestorage transforms the medium; keys it may have produced are
        // discarded
        for &i in &loading {
            if let Some(backend) = self.backends.get_mut(i) {
                backend.keys.clear();
            }
        }

        run_get_phase(&mut self.backends, &loading, &global, parent, Phase::Storage)?;

        // the spec:/ subset runs poststorage first, the cross-cutting spec
        // processing depends on it
        let spec: Vec<usize> = loading
            .iter()
            .copied()
            .filter(|&i| {
                self.backends
                    .get(i)
                    .is_some_and(|b| b.mountpoint().namespace() == Namespace::Spec)
            })
            .collect();
        run_get_phase(&mut self.backends, &spec, &global, parent, Phase::PostStorage)?;

        // merge all per-backend sets
        let mut data_ks = KeySet::with_capacity(ks.len());
        self.backends.merge(&updated, &mut data_ks);

        // cross-cutting hooks on the merged set
        parent.set_name_internal(initial.name().clone());
        self.run_global(GlobalPosition::ProcGetStorage, &mut data_ks, parent)?;
        self.run_global(GlobalPosition::PostGetStorage, &mut data_ks, parent)?;

        // re-divide, the hooks may have moved keys between backends
        self.backends.divide(&updated, &data_ks).map_err(|e| {
            with_context(e, "couldn't divide keys into mountpoints before poststorage")
        })?;

        let non_spec: Vec<usize> = loading
            .iter()
            .copied()
            .filter(|i| !spec.contains(i))
            .collect();
        run_get_phase(&mut self.backends, &non_spec, &global, parent, Phase::PostStorage)?;

        // splice the retrieved subtrees into the caller's key set; cutting
        // first makes keys deleted in the storage disappear
        for &i in &updated {
            if let Some(mountpoint) = self.backends.get(i).map(|b| b.mountpoint().clone()) {
                ks.cut(&mountpoint);
            }
        }
        self.backends.merge(&updated, ks);
        ks.clear_sync_flags();

        for &i in &updated {
            if let Some(backend) = self.backends.get_mut(i) {
                backend.cache_id = backend.mountpoint_id.clone();
            }
        }

        debug!(parent = %initial.name(), keys = ks.len(), "kdbGet: updated");
        Ok(GetOutcome::Updated)
    }
}

fn init_backends(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
) -> KdbResult<()> {
    let mut first_error: Option<KdbError> = None;

    for &i in selection {
        let Some(backend) = table.get_mut(i) else {
            continue;
        };
        if backend.initialized {
            continue;
        }

        if !backend.plugin.lock().capabilities().init {
            let e = KdbError::interface(format!(
                "the mountpoint '{}' defined a plugin without an init function as a backend",
                backend.mountpoint
            ));
            record_failure(parent, &mut first_error, e, backend);
            continue;
        }

        match call_backend_init(backend, global, parent) {
            Ok(PluginStatus::Success) => backend.initialized = true,
            Ok(PluginStatus::NoUpdate) => {
                // successfully initialized as read-only
                backend.initialized = true;
                backend.read_only = true;
            }
            Ok(PluginStatus::CacheHit) => {
                let e = KdbError::plugin_misbehavior(format!(
                    "the init function for the backend plugin of the mountpoint '{}' reported \
                     a cache hit",
                    backend.mountpoint
                ));
                record_failure(parent, &mut first_error, e, backend);
            }
            Err(e) => {
                let e = with_context(
                    e,
                    format!(
                        "calling the init function for the backend plugin of the mountpoint \
                         '{}' has failed",
                        backend.mountpoint
                    ),
                );
                record_failure(parent, &mut first_error, e, backend);
            }
        }
    }

    match first_error {
        Some(e) => Err(with_context(
            e,
            "the init phase of kdbGet() has failed; see warnings for details",
        )),
        None => Ok(()),
    }
}

fn resolve_for_get(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
) -> KdbResult<()> {
    let mut first_error: Option<KdbError> = None;

    for &i in selection {
        let Some(backend) = table.get_mut(i) else {
            continue;
        };
        let previous_id = backend.mountpoint_id.take();
        backend.needs_update = false;

        if !EntryPoint::Get.provided_by(backend) {
            let e = KdbError::interface(format!(
                "the mountpoint '{}' defined a plugin without a get function as a backend",
                backend.mountpoint
            ));
            record_failure(parent, &mut first_error, e, backend);
            continue;
        }

        match call_backend(backend, global, parent, Phase::Resolver, EntryPoint::Get, false) {
            Ok(PluginStatus::Success) => {
                backend.mountpoint_id = Some(parent.string_value().to_string());
                backend.needs_update = true;
            }
            Ok(PluginStatus::NoUpdate) => {
                // a changed identifier forces an update even without one
                backend.needs_update = previous_id.as_deref() != Some(parent.string_value());
                backend.mountpoint_id = Some(parent.string_value().to_string());
            }
            Ok(status @ PluginStatus::CacheHit) => {
                if let Some(e) = unexpected_status(status, backend, Phase::Resolver, "kdbGet()") {
                    record_failure(parent, &mut first_error, e, backend);
                }
            }
            Err(e) => {
                let e = with_context(
                    e,
                    format!(
                        "calling the get function for the backend plugin of the mountpoint \
                         '{}' has failed during the resolver phase",
                        backend.mountpoint
                    ),
                );
                record_failure(parent, &mut first_error, e, backend);
            }
        }
    }

    match first_error {
        Some(e) => Err(with_context(
            e,
            "the resolver phase of kdbGet() has failed; see warnings for details",
        )),
        None => Ok(()),
    }
}

/// Runs the cachecheck phase for one backend. Returns true on a cache hit;
/// failures count as a miss and only warn.
fn cache_check(
    table: &mut MountTable,
    index: usize,
    global: &SharedKeySet,
    parent: &mut Key,
) -> bool {
    let Some(backend) = table.get_mut(index) else {
        return false;
    };
    if backend.cache_id.is_none() || !EntryPoint::Get.provided_by(backend) {
        return false;
    }

    match call_backend(backend, global, parent, Phase::CacheCheck, EntryPoint::Get, true) {
        Ok(PluginStatus::CacheHit) => true,
        Ok(_) => false,
        Err(e) => {
            add_warning(
                parent,
                &with_context(
                    e,
                    format!(
                        "the cachecheck phase for the mountpoint '{}' failed; falling back to \
                         the storage phases",
                        backend.mountpoint
                    ),
                ),
                MODULE,
            );
            false
        }
    }
}

fn run_get_phase(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
    phase: Phase,
) -> KdbResult<()> {
    let mut first_error: Option<KdbError> = None;

    for &i in selection {
        let Some(backend) = table.get_mut(i) else {
            continue;
        };

        if !EntryPoint::Get.provided_by(backend) {
            let e = KdbError::interface(format!(
                "the mountpoint '{}' defined a plugin without a get function as a backend",
                backend.mountpoint
            ));
            record_failure(parent, &mut first_error, e, backend);
            continue;
        }

        match call_backend(backend, global, parent, phase, EntryPoint::Get, true) {
            Ok(PluginStatus::Success | PluginStatus::NoUpdate) => {}
            Ok(status) => {
                if let Some(e) = unexpected_status(status, backend, phase, "kdbGet()") {
                    record_failure(parent, &mut first_error, e, backend);
                }
            }
            Err(e) => {
                let e = with_context(
                    e,
                    format!(
                        "calling the get function for the backend plugin of the mountpoint \
                         '{}' has failed during the {} phase",
                        backend.mountpoint,
                        phase.as_str()
                    ),
                );
                record_failure(parent, &mut first_error, e, backend);
            }
        }
    }

    match first_error {
        Some(e) => Err(with_context(
            e,
            format!(
                "the {} phase of kdbGet() has failed; see warnings for details",
                phase.as_str()
            ),
        )),
        None => Ok(()),
    }
}
