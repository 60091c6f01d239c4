//! Slice set-operations used by the spec converter.
//!
//! Semantics are set-difference on ordered sequences: the input order of the
//! retained elements is preserved.

use oci_spec::runtime::Mount;

/// Remove from `list` every string that appears in `remove`.
pub fn string_slice_remove(list: &[String], remove: &[&str]) -> Vec<String> {
    list.iter()
        .filter(|s| !remove.contains(&s.as_str()))
        .cloned()
        .collect()
}

/// Remove from `list` every string matching `pred`.
pub fn string_slice_remove_match<F>(list: &[String], pred: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    list.iter().filter(|s| !pred(s)).cloned().collect()
}

/// Remove from `mounts` every mount that matches some element of `remove`
/// under `pred`. `pred(kept, removed)` is called with a candidate from
/// `mounts` and an element of `remove`.
pub fn mount_slice_remove<F>(mounts: Vec<Mount>, remove: &[Mount], pred: F) -> Vec<Mount>
where
    F: Fn(&Mount, &Mount) -> bool,
{
    mounts
        .into_iter()
        .filter(|m| !remove.iter().any(|r| pred(m, r)))
        .collect()
}
