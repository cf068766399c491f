//! VFIO PCI device handle: BAR enumeration/mmap and MSI-X vector count
//! discovery, built on top of the group fd handed back by `container`.
//!
//! Grounded on `vfio_pci_device_init`/`vfio_pci_device_exit` in
//! `vfio_pci.c`. Setup walks the regions and tears everything down again
//! in reverse order the moment any step fails, mirroring the C function's
//! `goto err_unmap` cascade with `Result`/early-return instead of labels.

use std::os::unix::io::RawFd;

use crate::error::{InterruptError, PciDeviceError};
use crate::interrupt::{self, InterruptCallback};

use super::{VFIO_IRQ_INFO_EVENTFD, VFIO_PCI_MSIX_IRQ_INDEX};

pub struct BarRegion {
    pub index: u32,
    pub ptr: *mut u8,
    pub len: usize,
}

// SAFETY: the mapping is a device BAR; callers coordinate access through
// the register-level read/write helpers, never through bare pointer use.
unsafe impl Send for BarRegion {}
// SAFETY: all register access goes through `regs::reg_read`/`reg_write`,
// which use volatile loads/stores; concurrent access from distinct
// mailbox workers targets distinct queue offsets by construction (see
// `mailbox::handle_queue_open`).
unsafe impl Sync for BarRegion {}

pub struct PciDevice {
    pub name: String,
    pub group_fd: RawFd,
    pub device_fd: RawFd,
    pub regions: Vec<BarRegion>,
    pub msix_efds: Vec<i32>,
}

impl PciDevice {
    /// Joins the device's IOMMU group, opens the device fd, enumerates and
    /// maps every non-empty BAR, and discovers the MSI-X vector count.
    /// Unwinds everything already acquired if any step after it fails.
    pub fn setup(name: &str) -> Result<PciDevice, PciDeviceError> {
        if name.len() >= 32 {
            return Err(PciDeviceError::NameTooLong(name.to_string()));
        }

        let group_fd = super::container::join_group(name)?;
        let device_fd = match super::get_device_fd(group_fd, name) {
            Ok(fd) => fd,
            Err(e) => {
                super::container::leave_group(group_fd);
                return Err(e);
            }
        };

        let result = (|| {
            let info = super::get_device_info(device_fd, name)?;
            let mut regions = Vec::new();
            let num_regions = info.num_regions.min(super::MAX_REGION_INDEX + 1);
            for index in 0..num_regions {
                let region_info = super::get_region_info(device_fd, index)?;
                if region_info.size == 0 {
                    continue;
                }
                match super::mmap_region(device_fd, &region_info) {
                    Ok((ptr, len)) => regions.push(BarRegion { index, ptr, len }),
                    Err(e) => {
                        for region in &regions {
                            unsafe { libc::munmap(region.ptr as *mut _, region.len) };
                        }
                        return Err(e);
                    }
                }
            }

            let irq_info = super::get_irq_info(device_fd, VFIO_PCI_MSIX_IRQ_INDEX).map_err(|e| {
                for region in &regions {
                    unsafe { libc::munmap(region.ptr as *mut _, region.len) };
                }
                e
            })?;
            if irq_info.flags & VFIO_IRQ_INFO_EVENTFD == 0 {
                for region in &regions {
                    unsafe { libc::munmap(region.ptr as *mut _, region.len) };
                }
                return Err(PciDeviceError::NoEventfdSupport);
            }
            if irq_info.count == 0 {
                for region in &regions {
                    unsafe { libc::munmap(region.ptr as *mut _, region.len) };
                }
                return Err(PciDeviceError::NoVectors);
            }

            Ok((regions, vec![-1i32; irq_info.count as usize]))
        })();

        match result {
            Ok((regions, msix_efds)) => Ok(PciDevice {
                name: name.to_string(),
                group_fd,
                device_fd,
                regions,
                msix_efds,
            }),
            Err(e) => {
                unsafe { libc::close(device_fd) };
                super::container::leave_group(group_fd);
                Err(e)
            }
        }
    }

    pub fn bar(&self, index: u32) -> Option<&BarRegion> {
        self.regions.iter().find(|r| r.index == index)
    }

    pub fn vector_count(&self) -> u32 {
        self.msix_efds.len() as u32
    }

    pub fn register_interrupt(&self, vector: u32, callback: InterruptCallback) -> Result<(), InterruptError> {
        let efd = self.armed_efd(vector)?;
        interrupt::register(efd, callback)
    }

    pub fn unregister_interrupt(&self, vector: u32) -> Result<(), InterruptError> {
        let efd = self.armed_efd(vector)?;
        interrupt::unregister(efd)
    }

    fn armed_efd(&self, vector: u32) -> Result<RawFd, InterruptError> {
        let efd = *self
            .msix_efds
            .get(vector as usize)
            .ok_or(InterruptError::VectorOutOfRange(vector, self.vector_count()))?;
        if efd < 0 {
            return Err(InterruptError::NotArmed(vector));
        }
        Ok(efd)
    }
}

impl Drop for PciDevice {
    fn drop(&mut self) {
        let _ = super::disable_all_msix(self.device_fd);
        for region in &self.regions {
            unsafe { libc::munmap(region.ptr as *mut _, region.len) };
        }
        unsafe { libc::close(self.device_fd) };
        super::container::leave_group(self.group_fd);
    }
}
