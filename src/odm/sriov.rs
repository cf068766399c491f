//! SR-IOV VF-count observer: reads `sriov_numvfs` from sysfs, validates
//! it, and patches the VF-count field in `CTL`.
//!
//! No surviving C source covers this path directly (the retained
//! `odm_pf.c` variant predates SR-IOV support), so the sysfs path and
//! the `ffs(num_vfs) - 2` packing follow the register map in
//! `odm_pf.h` and the PF-side VF-count bring-up described alongside it.

use std::fs;

use crate::regs::{self, ODM_CTL};
use crate::shmem::PmemState;
use crate::vfio::device::BarRegion;

const SYSFS_PCI_DEV_PATH: &str = "/sys/bus/pci/devices";

fn is_valid_count(n: u32) -> bool {
    (2..=16).contains(&n) && n.is_power_of_two()
}

/// `ffs(num_vfs) - 2`: 2 -> 0, 4 -> 1, 8 -> 2, 16 -> 3.
fn ctl_field_for(num_vfs: u32) -> u64 {
    (num_vfs.trailing_zeros() - 1) as u64
}

fn read_sriov_numvfs(device_name: &str) -> Option<u32> {
    let path = format!("{}/{}/sriov_numvfs", SYSFS_PCI_DEV_PATH, device_name);
    let raw = fs::read_to_string(&path).ok()?;
    let trimmed = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).ok()
}

/// Recomputes `maxq_per_vf` and patches `CTL[5:4]` for `num_vfs`, if it
/// validates and differs from the stored total. Shared by `seed` (the
/// configured count at bring-up) and `observe` (a re-read off sysfs).
fn apply(bar: &BarRegion, pmem: &mut PmemState, num_vfs: u32) {
    if !is_valid_count(num_vfs) {
        log::error!("num_vfs {} is not a power of two in [2, 16]", num_vfs);
        return;
    }

    let maxq_per_vf = (32 / num_vfs) as i32;
    if maxq_per_vf == pmem.maxq_per_vf {
        return;
    }

    pmem.maxq_per_vf = maxq_per_vf;

    let field = ctl_field_for(num_vfs);
    let current = regs::reg_read(bar, ODM_CTL);
    let updated = (current & !(0x3 << 4)) | (field << 4);
    regs::reg_write(bar, ODM_CTL, updated);

    log::debug!("num_vfs={} maxq_per_vf={}", num_vfs, maxq_per_vf);
}

/// Seeds `CTL[5:4]` and `maxq_per_vf` from the configured `--num-vfs` at
/// bring-up, so a plain probe with no mailbox traffic still leaves `CTL`
/// reflecting the desired VF count instead of whatever was zero-initialized.
pub fn seed(bar: &BarRegion, pmem: &mut PmemState, num_vfs: u8) {
    apply(bar, pmem, num_vfs as u32);
}

/// Re-reads the SR-IOV VF count, and if it validates and differs from
/// the stored total, recomputes `maxq_per_vf` and patches `CTL[5:4]`.
/// Invalid or unreadable counts are logged and leave state unchanged.
pub fn observe(bar: &BarRegion, device_name: &str, pmem: &mut PmemState) {
    let num_vfs = match read_sriov_numvfs(device_name) {
        Some(n) => n,
        None => {
            log::error!("failed to read sriov_numvfs for {}", device_name);
            return;
        }
    };
    apply(bar, pmem, num_vfs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_field_matches_ffs_minus_two() {
        assert_eq!(ctl_field_for(2), 0);
        assert_eq!(ctl_field_for(4), 1);
        assert_eq!(ctl_field_for(8), 2);
        assert_eq!(ctl_field_for(16), 3);
    }

    #[test]
    fn validates_power_of_two_range() {
        assert!(is_valid_count(2));
        assert!(is_valid_count(16));
        assert!(!is_valid_count(1));
        assert!(!is_valid_count(3));
        assert!(!is_valid_count(32));
        assert!(!is_valid_count(0));
    }

    fn fake_bar(len: usize) -> BarRegion {
        let buf = vec![0u8; len].into_boxed_slice();
        BarRegion {
            index: 0,
            ptr: Box::into_raw(buf) as *mut u8,
            len,
        }
    }

    fn fake_pmem() -> PmemState {
        PmemState {
            dev_state: 0,
            maxq_per_vf: 0,
            vfs_in_use: 0,
            setup_done: [false; crate::shmem::ODM_MAX_VFS],
        }
    }

    #[test]
    fn seed_sets_ctl_bits_and_maxq_per_vf_for_num_vfs_four() {
        let bar = fake_bar(0x20000);
        let mut pmem = fake_pmem();
        seed(&bar, &mut pmem, 4);
        assert_eq!(pmem.maxq_per_vf, 8);
        let ctl = regs::reg_read(&bar, ODM_CTL);
        assert_eq!((ctl >> 4) & 0x3, 1);
    }
}
