//! Workspace lifecycle rules
//!
//! Two pure functions run on every create/update of a Workspace:
//!
//! - [`admit`] rewrites the `internal.tenancy.canopy.dev/*` labels so they
//!   mirror `status.phase` and `status.initializers` exactly.
//! - [`validate`] rejects writes that break the lifecycle: a changed
//!   `spec.type`, an unset location or baseURL, a backward phase move, leaving
//!   `Initializing` with initializers pending, or entering `Ready` unplaced.
//!
//! Neither does I/O; both are safe to call on the request path.

use std::collections::BTreeMap;

use canopy_common::crd::{Workspace, WorkspacePhase};
use canopy_common::{Error, Result, INTERNAL_LABEL_PREFIX, WORKSPACE_PHASE_LABEL};
use kube::ResourceExt;

/// Prefix of the per-initializer label key
pub const INITIALIZER_LABEL_PREFIX: &str = "internal.tenancy.canopy.dev/initializer.";

/// Maximum length of the name segment of a label key
const MAX_LABEL_NAME_LEN: usize = 63;

/// Label key marking a pending initializer
///
/// Fails when `initializer.<token>` is not a valid label name segment.
pub fn initializer_label_key(token: &str) -> Result<String> {
    let name = format!("initializer.{token}");
    validate_label_name(&name)
        .map_err(|msg| Error::validation_for_field("", "status.initializers", msg))?;
    Ok(format!("{INTERNAL_LABEL_PREFIX}{name}"))
}

fn validate_label_name(name: &str) -> std::result::Result<(), String> {
    if name.len() > MAX_LABEL_NAME_LEN {
        return Err(format!(
            "label name {name:?} must be no more than {MAX_LABEL_NAME_LEN} characters"
        ));
    }
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_alphanumeric();
    let inner = |b: u8| alnum(b) || matches!(b, b'-' | b'_' | b'.');
    let valid = match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) => {
            alnum(first) && alnum(last) && bytes.iter().all(|&b| inner(b))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(format!(
            "label name {name:?} must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
        ))
    }
}

/// Labels that must be present on `ws`, derived from its status
pub fn derived_labels(ws: &Workspace) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    labels.insert(WORKSPACE_PHASE_LABEL.to_string(), ws.phase().to_string());
    for token in ws.initializers() {
        let key = initializer_label_key(token).map_err(|e| with_object(e, &ws.name_any()))?;
        labels.insert(key, String::new());
    }
    Ok(labels)
}

fn with_object(err: Error, object: &str) -> Error {
    match err {
        Error::Validation { message, field, .. } => Error::Validation {
            object: object.to_string(),
            message,
            field,
        },
        other => other,
    }
}

/// Synchronize the derived labels of `ws` with its status
///
/// User labels outside the internal prefix are left untouched. Running it on
/// an already-synchronized object changes nothing.
pub fn admit(ws: &mut Workspace) -> Result<()> {
    let derived = derived_labels(ws)?;
    let labels = ws.labels_mut();
    labels.retain(|k, _| !k.starts_with(INTERNAL_LABEL_PREFIX));
    labels.extend(derived);
    Ok(())
}

/// Check a create (`old == None`) or update against the lifecycle rules
pub fn validate(old: Option<&Workspace>, new: &Workspace) -> Result<()> {
    let name = new.name_any();
    let new_phase = new.phase();

    if let Some(old) = old {
        if old.spec.type_ != new.spec.type_ {
            return Err(Error::policy_violation_for_field(
                &name,
                "spec.type",
                format!(
                    "field is immutable: cannot change from {:?} to {:?}",
                    old.spec.type_, new.spec.type_
                ),
            ));
        }

        if old.current_location().is_some() && new.current_location().is_none() {
            return Err(Error::policy_violation_for_field(
                &name,
                "status.location.current",
                "cannot be unset",
            ));
        }

        if old.base_url().is_some() && new.base_url().is_none() {
            return Err(Error::policy_violation_for_field(
                &name,
                "status.baseURL",
                "cannot be unset",
            ));
        }

        let old_phase = old.phase();
        if new_phase < old_phase {
            return Err(Error::policy_violation_for_field(
                &name,
                "status.phase",
                format!("cannot transition from {old_phase:?} to {new_phase:?}"),
            ));
        }

        if old_phase == WorkspacePhase::Initializing
            && new_phase != WorkspacePhase::Initializing
            && !new.initializers().is_empty()
        {
            return Err(Error::policy_violation_for_field(
                &name,
                "status.initializers",
                format!("status.initializers must be empty for phase {new_phase}"),
            ));
        }

        if new_phase == WorkspacePhase::Ready && old_phase != WorkspacePhase::Ready {
            require_placement(&name, new)?;
        }
    } else if new_phase == WorkspacePhase::Ready {
        require_placement(&name, new)?;
    }

    Ok(())
}

fn require_placement(name: &str, ws: &Workspace) -> Result<()> {
    if ws.current_location().is_none() {
        return Err(Error::policy_violation_for_field(
            name,
            "status.location.current",
            "must be set for phase Ready",
        ));
    }
    if ws.base_url().is_none() {
        return Err(Error::policy_violation_for_field(
            name,
            "status.baseURL",
            "must be set for phase Ready",
        ));
    }
    Ok(())
}
