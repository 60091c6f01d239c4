//! User-namespace uid/gid mapping allocation and validation.
//!
//! A system container needs one continuous mapping range per id kind,
//! starting at container id 0, covering at least
//! [`ID_RANGE_MIN`](nestbox_shared::constants::idmap::ID_RANGE_MIN) ids, with
//! matching host uid and gid, and never mapping to host root. Id-shifting
//! mounts rely on the range being continuous, so a spec that splits it into
//! several contiguous sub-ranges is folded back into one entry.

use oci_spec::runtime::{Linux, LinuxIdMapping, LinuxIdMappingBuilder};

use nestbox_shared::constants::idmap::{DEFAULT_GID, DEFAULT_UID, ID_RANGE_MIN};
use nestbox_shared::errors::{NestboxResult, SpecError};

use crate::services::manager::Manager;

use super::build_err;

pub(crate) fn configure(linux: &mut Linux, mgr: &Manager) -> NestboxResult<()> {
    // Mapping overrides from the manager are honored verbatim; they carry a
    // peer container's mappings when a userns is shared.
    if mgr.enabled() {
        let cfg = mgr.config();
        if !cfg.uid_mappings.is_empty() {
            linux.set_uid_mappings(Some(cfg.uid_mappings.clone()));
        }
        if !cfg.gid_mappings.is_empty() {
            linux.set_gid_mappings(Some(cfg.gid_mappings.clone()));
        }
    }

    let no_uid = linux.uid_mappings().as_ref().is_none_or(|m| m.is_empty());
    let no_gid = linux.gid_mappings().as_ref().is_none_or(|m| m.is_empty());

    if no_uid && no_gid {
        alloc(linux, mgr)
    } else {
        validate(linux)?;
        Ok(())
    }
}

/// Allocate a fresh mapping range from the manager, or fall back to the
/// compiled-in default range when no manager is present.
fn alloc(linux: &mut Linux, mgr: &Manager) -> NestboxResult<()> {
    let (uid, gid) = match mgr.rpc() {
        Some(rpc) => rpc.req_subid(ID_RANGE_MIN)?,
        None => (DEFAULT_UID, DEFAULT_GID),
    };

    let uid_map = LinuxIdMappingBuilder::default()
        .container_id(0u32)
        .host_id(uid)
        .size(ID_RANGE_MIN)
        .build()
        .map_err(build_err)?;
    let gid_map = LinuxIdMappingBuilder::default()
        .container_id(0u32)
        .host_id(gid)
        .size(ID_RANGE_MIN)
        .build()
        .map_err(build_err)?;

    tracing::debug!(uid, gid, size = ID_RANGE_MIN, "allocated user-ns id mappings");

    linux.set_uid_mappings(Some(vec![uid_map]));
    linux.set_gid_mappings(Some(vec![gid_map]));
    Ok(())
}

/// Validate caller-provided mappings against system-container requirements,
/// folding contiguous sub-ranges into a single entry.
fn validate(linux: &mut Linux) -> Result<(), SpecError> {
    let uid_maps = linux.uid_mappings().clone().unwrap_or_default();
    let gid_maps = linux.gid_mappings().clone().unwrap_or_default();

    if uid_maps.is_empty() || gid_maps.is_empty() {
        return Err(SpecError::NoUserNsMapping);
    }

    let uid_maps = merge_contiguous(uid_maps, "uid")?;
    let gid_maps = merge_contiguous(gid_maps, "gid")?;

    let uid_map = &uid_maps[0];
    let gid_map = &gid_maps[0];

    if uid_map.container_id() != 0 || uid_map.size() < ID_RANGE_MIN {
        return Err(SpecError::BadMapping(format!(
            "uid mapping range must map at least {ID_RANGE_MIN} uids starting at uid 0; \
             found {uid_map:?}"
        )));
    }
    if gid_map.container_id() != 0 || gid_map.size() < ID_RANGE_MIN {
        return Err(SpecError::BadMapping(format!(
            "gid mapping range must map at least {ID_RANGE_MIN} gids starting at gid 0; \
             found {gid_map:?}"
        )));
    }
    if uid_map.host_id() != gid_map.host_id() {
        return Err(SpecError::BadMapping(format!(
            "uid and gid mappings must map to the same host id; found uid = {uid_map:?}, \
             gid = {gid_map:?}"
        )));
    }
    if uid_map.host_id() == 0 {
        return Err(SpecError::BadMapping(format!(
            "mapping to host id 0 breaks container isolation; found {uid_map:?}"
        )));
    }

    linux.set_uid_mappings(Some(uid_maps));
    linux.set_gid_mappings(Some(gid_maps));
    Ok(())
}

/// Sort mappings by container id and fold adjacent entries whose container
/// and host ranges are both contiguous. The result must be one range.
fn merge_contiguous(
    mut maps: Vec<LinuxIdMapping>,
    kind: &str,
) -> Result<Vec<LinuxIdMapping>, SpecError> {
    maps.sort_by_key(|m| m.container_id());

    let mut merged: Vec<LinuxIdMapping> = Vec::with_capacity(maps.len());
    for m in maps {
        match merged.last_mut() {
            Some(last)
                if u64::from(last.container_id()) + u64::from(last.size())
                    == u64::from(m.container_id())
                    && u64::from(last.host_id()) + u64::from(last.size())
                        == u64::from(m.host_id()) =>
            {
                *last = LinuxIdMappingBuilder::default()
                    .container_id(last.container_id())
                    .host_id(last.host_id())
                    .size(last.size() + m.size())
                    .build()
                    .map_err(build_err)?;
            }
            _ => merged.push(m),
        }
    }

    if merged.len() != 1 {
        return Err(SpecError::BadMapping(format!(
            "{kind} mappings must map a single continuous id range; found {} disjoint ranges",
            merged.len()
        )));
    }
    Ok(merged)
}
