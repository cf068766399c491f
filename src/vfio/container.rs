//! Process-wide VFIO container singleton: the `/dev/vfio/vfio` fd and the
//! table of IOMMU groups currently joined to it.
//!
//! Grounded on `vfio_pci_init`/`vfio_get_group_fd`/`vfio_clear_group` in
//! `vfio_pci.c`: the container is opened lazily on the first group join,
//! the IOMMU type is set exactly once (when the group count goes 0 -> 1),
//! and the container is closed again when the last group leaves. A fixed
//! eight-slot table stands in for the original's `MAX_IOMMU_GROUPS` array.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::error::VfioContainerError;

use super::{VFIO_GROUP_FLAGS_CONTAINER_SET, VFIO_GROUP_FLAGS_VIABLE, VFIO_MAX_GROUPS};

#[derive(Clone, Copy)]
struct GroupSlot {
    group_num: i32,
    group_fd: RawFd,
    ref_count: u32,
}

impl GroupSlot {
    const fn empty() -> Self {
        GroupSlot {
            group_num: -1,
            group_fd: -1,
            ref_count: 0,
        }
    }
}

struct State {
    container_fd: RawFd,
    active_groups: usize,
    groups: [GroupSlot; VFIO_MAX_GROUPS],
}

impl State {
    const fn new() -> Self {
        State {
            container_fd: -1,
            active_groups: 0,
            groups: [GroupSlot::empty(); VFIO_MAX_GROUPS],
        }
    }
}

static CONTAINER: Mutex<State> = Mutex::new(State::new());

/// Joins the IOMMU group that owns `device_name`, opening the container
/// and/or the group fresh if this is the first reference to either.
/// Returns the group fd, which the caller uses to fetch the device fd.
pub fn join_group(device_name: &str) -> Result<RawFd, VfioContainerError> {
    let group_num = super::resolve_group_num(device_name)?;
    let mut state = CONTAINER.lock().unwrap();

    if let Some(slot) = state.groups.iter_mut().find(|s| s.group_num == group_num) {
        slot.ref_count += 1;
        return Ok(slot.group_fd);
    }

    if state.container_fd < 0 {
        state.container_fd = super::open_container()?;
    }

    let group_fd = super::open_group(group_num)?;
    let status = super::group_status(group_fd, group_num);
    let status = match status {
        Ok(s) => s,
        Err(e) => {
            unsafe { libc::close(group_fd) };
            return Err(e);
        }
    };
    if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
        unsafe { libc::close(group_fd) };
        return Err(VfioContainerError::GroupNotViable(group_num));
    }
    if status.flags & VFIO_GROUP_FLAGS_CONTAINER_SET == 0 {
        if let Err(e) = super::set_container(group_fd, state.container_fd, group_num) {
            unsafe { libc::close(group_fd) };
            return Err(e);
        }
    }

    let idx = match state.groups.iter().position(|s| s.group_num == -1) {
        Some(idx) => idx,
        None => {
            unsafe { libc::close(group_fd) };
            return Err(VfioContainerError::GroupTableFull(VFIO_MAX_GROUPS));
        }
    };
    state.groups[idx] = GroupSlot {
        group_num,
        group_fd,
        ref_count: 1,
    };
    let first_group = state.active_groups == 0;
    state.active_groups += 1;

    if first_group {
        if let Err(e) = super::set_iommu_type(state.container_fd) {
            state.groups[idx] = GroupSlot::empty();
            state.active_groups -= 1;
            unsafe { libc::close(group_fd) };
            unsafe { libc::close(state.container_fd) };
            state.container_fd = -1;
            return Err(e);
        }
    }

    log::debug!("joined iommu group {} ({} active)", group_num, state.active_groups);
    Ok(group_fd)
}

/// Drops one reference on the group owning `group_fd`. Closes the group
/// once its reference count reaches zero, and closes the container once
/// no group references it at all.
pub fn leave_group(group_fd: RawFd) {
    let mut state = CONTAINER.lock().unwrap();
    let idx = match state.groups.iter().position(|s| s.group_fd == group_fd) {
        Some(idx) => idx,
        None => return,
    };

    state.groups[idx].ref_count -= 1;
    if state.groups[idx].ref_count > 0 {
        return;
    }

    unsafe { libc::close(group_fd) };
    let group_num = state.groups[idx].group_num;
    state.groups[idx] = GroupSlot::empty();
    state.active_groups -= 1;
    log::debug!("left iommu group {} ({} active)", group_num, state.active_groups);

    if state.active_groups == 0 {
        unsafe { libc::close(state.container_fd) };
        state.container_fd = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_slot_table_starts_empty() {
        let state = State::new();
        assert!(state.groups.iter().all(|s| s.group_num == -1));
        assert_eq!(state.active_groups, 0);
        assert_eq!(state.container_fd, -1);
    }

    #[test]
    fn leave_group_on_unknown_fd_is_a_noop() {
        // No group was ever opened with this fd value; must not panic or
        // touch the container.
        leave_group(987654);
    }
}
