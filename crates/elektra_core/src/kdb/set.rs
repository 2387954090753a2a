//! The write pipeline with its two-phase commit.
//!
//! The pipeline works on a deep copy of the caller's key set, divided among
//! the selected backends. The resolver phase is the prepare step: it points
//! every backend at a temporary storage identifier and makes the following
//! phases safely revertible. The commit phase atomically swaps the
//! temporary storage for the live one; a failure anywhere between resolver
//! and commit rolls every selected backend back.

use crate::error::{add_warning, set_error, KdbError, KdbResult};
use crate::global::GlobalPosition;
use crate::key::Key;
use crate::keyset::KeySet;
use crate::kdb::{
    call_backend, check_parent, record_failure, unexpected_status, with_context, EntryPoint, Kdb,
    SetOutcome, MODULE,
};
use crate::mount::MountTable;
use crate::plugin::{Phase, PluginStatus, SharedKeySet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A failure inside the phase sequence, tagged with the phase it hit.
type PhaseFailure = (Phase, KdbError);

impl Kdb {
    /// Persists the keys below (and at) the parent key.
    ///
    /// A `get` for the same parent subtree must have run on this handle
    /// first; otherwise the call fails with a conflicting-state error.
    /// Writes are committed atomically across all touched backends, or
    /// rolled back together.
    ///
    /// # Errors
    ///
    /// On failure no storage is modified, the caller's key set is left
    /// untouched and the error is also recorded in the parent key's
    /// metadata.
    pub fn set(&mut self, ks: &mut KeySet, parent: &mut Key) -> KdbResult<SetOutcome> {
        let Some(precondition) = check_parent(parent) else {
            return Err(KdbError::interface(
                "parent key with read-only metadata passed",
            ));
        };
        if let Err(e) = precondition {
            set_error(parent, &e, MODULE);
            return Err(e);
        }

        // change detection: nothing dirty, nothing to do
        if !ks.needs_sync() && !ks.any_key_needs_sync() {
            return Ok(SetOutcome::NoChange);
        }

        let initial = parent.clone();
        let result = self.set_inner(ks, parent, &initial);

        parent.set_read_only_name(false);
        parent.set_read_only_value(false);
        parent.set_name_internal(initial.name().clone());

        match result {
            Ok(outcome) => {
                let owner_id = self
                    .backends
                    .find_parent(initial.name())
                    .and_then(|i| self.backends.get(i))
                    .and_then(|b| b.mountpoint_id.clone());
                let _ = parent.set_string(owner_id.unwrap_or_default());
                Ok(outcome)
            }
            Err(e) => {
                let _ = parent.set_string(initial.string_value());
                set_error(parent, &e, MODULE);
                Err(e)
            }
        }
    }

    fn set_inner(
        &mut self,
        ks: &mut KeySet,
        parent: &mut Key,
        initial: &Key,
    ) -> KdbResult<SetOutcome> {
        debug!(parent = %initial.name(), keys = ks.len(), "kdbSet");
        let global = Arc::clone(&self.global);
        let selection = self.backends.selection_for(initial.name());

        // a set is only valid after a get initialized the backends
        let mut uninitialized = false;
        for &i in &selection {
            let Some(backend) = self.backends.get(i) else {
                continue;
            };
            if !backend.is_initialized() {
                add_warning(
                    parent,
                    &KdbError::conflicting_state(format!(
                        "the mountpoint '{}' has not been initialized; retrieve the \
                         configuration before writing",
                        backend.mountpoint()
                    )),
                    MODULE,
                );
                uninitialized = true;
            }
        }
        if uninitialized {
            return Err(KdbError::conflicting_state(
                "one or more mountpoints have not been initialized; a get must run before a \
                 set on the same handle and parent subtree; see warnings for details",
            ));
        }

        // read-only backends are dropped; their keys are not written
        let mut writable = Vec::with_capacity(selection.len());
        for &i in &selection {
            let Some(backend) = self.backends.get(i) else {
                continue;
            };
            if backend.is_read_only() {
                if !ks.below(backend.mountpoint()).is_empty() {
                    add_warning(
                        parent,
                        &KdbError::interface(format!(
                            "the mountpoint '{}' was initialized as read-only; its keys are \
                             not written",
                            backend.mountpoint()
                        )),
                        MODULE,
                    );
                }
                continue;
            }
            writable.push(i);
        }

        // cross-cutting spec fold-in on the full key set
        self.run_global(GlobalPosition::PreSetStorage, ks, parent)?;

        // deep-copy snapshot: plugin transformations of the on-disk
        // representation must not leak back to the caller
        let snapshot = ks.deep_dup();
        self.backends.divide(&writable, &snapshot).map_err(|e| {
            with_context(e, "couldn't divide keys into mountpoints at the start of kdbSet")
        })?;

        // skip backends whose share is unchanged since the last get
        let changed: Vec<usize> = writable
            .iter()
            .copied()
            .filter(|&i| self.backends.get(i).is_some_and(|b| b.needs_update))
            .collect();
        if changed.is_empty() {
            debug!(parent = %initial.name(), "kdbSet: no backend has changes");
            return Ok(SetOutcome::NoChange);
        }

        // a panicking plugin must not leak temporary storage: the rollback
        // sequence runs for every backend that reached the resolver phase
        // before the panic resumes
        let phases = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_set_phases(&mut self.backends, &changed, &global, parent)
        }));
        let phases = match phases {
            Ok(result) => result,
            Err(payload) => {
                rollback(&mut self.backends, &changed, &global, parent);
                std::panic::resume_unwind(payload);
            }
        };

        match phases {
            Ok(()) => {
                ks.clear_sync_flags();
                for &i in &changed {
                    if let Some(backend) = self.backends.get_mut(i) {
                        backend.cache_id = backend.mountpoint_id.clone();
                    }
                }
                debug!(parent = %initial.name(), backends = changed.len(), "kdbSet: committed");
                Ok(SetOutcome::Committed)
            }
            Err((phase, e)) => {
                warn!(
                    parent = %initial.name(),
                    phase = phase.as_str(),
                    "kdbSet failed, rolling back"
                );
                self.advertise_failed_phase(phase);
                rollback(&mut self.backends, &changed, &global, parent);
                Err(e)
            }
        }
    }
}

fn run_set_phases(
    table: &mut MountTable,
    changed: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
) -> Result<(), PhaseFailure> {
    resolve_for_set(table, changed, global, parent)?;

    run_set_phase(table, changed, global, parent, Phase::PreStorage, EntryPoint::Set, true)?;

    // key set and parent key are read-only during storage and poststorage
    for &i in changed {
        if let Some(backend) = table.get_mut(i) {
            backend.keys.set_read_only(true);
        }
    }
    let stored = run_set_phase(table, changed, global, parent, Phase::Storage, EntryPoint::Set, true)
        .and_then(|()| {
            run_set_phase(table, changed, global, parent, Phase::PostStorage, EntryPoint::Set, true)
        });
    for &i in changed {
        if let Some(backend) = table.get_mut(i) {
            backend.keys.set_read_only(false);
        }
    }
    stored?;

    run_set_phase(table, changed, global, parent, Phase::PreCommit, EntryPoint::Commit, true)?;
    commit_backends(table, changed, global, parent)?;

    // postcommit failures no longer change the outcome
    run_blocked_phase(table, changed, global, parent, Phase::PostCommit, EntryPoint::Commit);

    Ok(())
}

fn resolve_for_set(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
) -> Result<(), PhaseFailure> {
    let mut first_error: Option<KdbError> = None;

    for &i in selection {
        let Some(backend) = table.get_mut(i) else {
            continue;
        };
        backend.mountpoint_id = None;

        if !EntryPoint::Set.provided_by(backend) {
            let e = KdbError::interface(format!(
                "the mountpoint '{}' defined a plugin without a set function as a backend and \
                 the plugin didn't initialize the mountpoint as read-only",
                backend.mountpoint
            ));
            record_failure(parent, &mut first_error, e, backend);
            continue;
        }

        match call_backend(backend, global, parent, Phase::Resolver, EntryPoint::Set, false) {
            Ok(PluginStatus::Success) => {
                backend.mountpoint_id = Some(parent.string_value().to_string());
            }
            Ok(PluginStatus::NoUpdate) => {
                add_warning(
                    parent,
                    &KdbError::interface(format!(
                        "the backend plugin of the mountpoint '{}' reported no-update during \
                         the resolver phase of kdbSet(); this is interpreted like success and \
                         the mountpoint still goes through the remaining phases",
                        backend.mountpoint
                    )),
                    MODULE,
                );
                backend.mountpoint_id = Some(parent.string_value().to_string());
            }
            Ok(status) => {
                if let Some(e) = unexpected_status(status, backend, Phase::Resolver, "kdbSet()") {
                    record_failure(parent, &mut first_error, e, backend);
                }
            }
            Err(e) => {
                let e = with_context(
                    e,
                    format!(
                        "calling the set function for the backend plugin of the mountpoint \
                         '{}' has failed during the resolver phase",
                        backend.mountpoint
                    ),
                );
                record_failure(parent, &mut first_error, e, backend);
            }
        }
    }

    match first_error {
        Some(e) => Err((
            Phase::Resolver,
            with_context(e, "the resolver phase of kdbSet() has failed; see warnings for details"),
        )),
        None => Ok(()),
    }
}

fn run_set_phase(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
    phase: Phase,
    entry: EntryPoint,
    lock_value: bool,
) -> Result<(), PhaseFailure> {
    let mut first_error: Option<KdbError> = None;

    for &i in selection {
        let Some(backend) = table.get_mut(i) else {
            continue;
        };

        if !entry.provided_by(backend) {
            let e = KdbError::interface(format!(
                "the mountpoint '{}' defined a plugin without a {} function as a backend and \
                 the plugin didn't initialize the mountpoint as read-only",
                backend.mountpoint,
                entry.as_str()
            ));
            record_failure(parent, &mut first_error, e, backend);
            continue;
        }

        match call_backend(backend, global, parent, phase, entry, lock_value) {
            Ok(PluginStatus::Success | PluginStatus::NoUpdate) => {}
            Ok(status) => {
                if let Some(e) = unexpected_status(status, backend, phase, "kdbSet()") {
                    record_failure(parent, &mut first_error, e, backend);
                }
            }
            Err(e) => {
                let e = with_context(
                    e,
                    format!(
                        "calling the {} function for the backend plugin of the mountpoint \
                         '{}' has failed during the {} phase",
                        entry.as_str(),
                        backend.mountpoint,
                        phase.as_str()
                    ),
                );
                record_failure(parent, &mut first_error, e, backend);
            }
        }
    }

    match first_error {
        Some(e) => Err((
            phase,
            with_context(
                e,
                format!(
                    "the {} phase of kdbSet() has failed; see warnings for details",
                    phase.as_str()
                ),
            ),
        )),
        None => Ok(()),
    }
}

/// The commit phase proper. After each backend committed, the storage
/// identifier it reports becomes the backend's new mountpoint id.
fn commit_backends(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
) -> Result<(), PhaseFailure> {
    let mut first_error: Option<KdbError> = None;

    for &i in selection {
        let Some(backend) = table.get_mut(i) else {
            continue;
        };

        if !EntryPoint::Commit.provided_by(backend) {
            let e = KdbError::interface(format!(
                "the mountpoint '{}' defined a plugin without a commit function as a backend \
                 and the plugin didn't initialize the mountpoint as read-only",
                backend.mountpoint
            ));
            record_failure(parent, &mut first_error, e, backend);
            continue;
        }

        match call_backend(backend, global, parent, Phase::Commit, EntryPoint::Commit, false) {
            Ok(PluginStatus::Success | PluginStatus::NoUpdate) => {
                backend.mountpoint_id = Some(parent.string_value().to_string());
            }
            Ok(status) => {
                if let Some(e) = unexpected_status(status, backend, Phase::Commit, "kdbSet()") {
                    record_failure(parent, &mut first_error, e, backend);
                }
            }
            Err(e) => {
                let e = with_context(
                    e,
                    format!(
                        "calling the commit function for the backend plugin of the mountpoint \
                         '{}' has failed during the commit phase",
                        backend.mountpoint
                    ),
                );
                record_failure(parent, &mut first_error, e, backend);
            }
        }
    }

    match first_error {
        Some(e) => Err((
            Phase::Commit,
            with_context(e, "the commit phase of kdbSet() has failed; see warnings for details"),
        )),
        None => Ok(()),
    }
}

/// Runs a phase whose errors are downgraded to warnings; the outcome of
/// the operation is already decided.
fn run_blocked_phase(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
    phase: Phase,
    entry: EntryPoint,
) {
    for &i in selection {
        let Some(backend) = table.get_mut(i) else {
            continue;
        };
        if !entry.provided_by(backend) {
            continue;
        }
        if let Err(e) = call_backend(backend, global, parent, phase, entry, true) {
            add_warning(
                parent,
                &with_context(
                    e,
                    format!(
                        "an error in the {} phase of the mountpoint '{}' was converted into a \
                         warning",
                        phase.as_str(),
                        backend.mountpoint
                    ),
                ),
                MODULE,
            );
        }
    }
}

/// Runs the rollback sequence for every selected backend. Every mutation
/// performed since the resolver phase must be reverted; rollback errors
/// become warnings.
fn rollback(
    table: &mut MountTable,
    selection: &[usize],
    global: &SharedKeySet,
    parent: &mut Key,
) {
    run_blocked_phase(table, selection, global, parent, Phase::PreRollback, EntryPoint::Error);
    run_blocked_phase(table, selection, global, parent, Phase::Rollback, EntryPoint::Error);
    run_blocked_phase(table, selection, global, parent, Phase::PostRollback, EntryPoint::Error);
}
