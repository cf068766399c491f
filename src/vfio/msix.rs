//! MSI-X vector arming: one eventfd per vector, committed to the kernel as
//! a whole table on every change.
//!
//! Grounded on `vfio_pci_irq_enable`/`vfio_pci_irq_disable` in
//! `vfio_pci_irq.c`, which always writes the full `-1`-padded eventfd
//! array rather than patching a single slot — `VFIO_DEVICE_SET_IRQS`
//! replaces the whole table on every call, so a partial write would drop
//! every other vector's eventfd.

use eventfd::eventfd;

use crate::error::MsixError;

use super::device::PciDevice;

/// Creates an eventfd for `vector`, commits the updated table, and wires
/// it into `device.msix_efds`. Fails if the vector is already armed.
pub fn enable_vector(device: &mut PciDevice, vector: u32) -> Result<(), MsixError> {
    let count = device.vector_count();
    let slot = device
        .msix_efds
        .get_mut(vector as usize)
        .ok_or(MsixError::VectorOutOfRange(vector, count))?;
    if *slot != -1 {
        return Err(MsixError::AlreadyEnabled(vector));
    }

    let fd = unsafe { eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(MsixError::CreateEventfd(std::io::Error::last_os_error()));
    }
    *slot = fd;

    if let Err(e) = super::commit_msix_eventfds(device.device_fd, &device.msix_efds) {
        device.msix_efds[vector as usize] = -1;
        unsafe { libc::close(fd) };
        return Err(MsixError::SetIrqs(e));
    }

    log::debug!("armed msix vector {} (fd {})", vector, fd);
    Ok(())
}

/// Closes the eventfd for `vector` and commits the updated table. Fails
/// if the vector is not currently armed.
pub fn disable_vector(device: &mut PciDevice, vector: u32) -> Result<(), MsixError> {
    let count = device.vector_count();
    let slot = device
        .msix_efds
        .get(vector as usize)
        .copied()
        .ok_or(MsixError::VectorOutOfRange(vector, count))?;
    if slot == -1 {
        return Err(MsixError::AlreadyDisabled(vector));
    }

    device.msix_efds[vector as usize] = -1;
    if let Err(e) = super::commit_msix_eventfds(device.device_fd, &device.msix_efds) {
        device.msix_efds[vector as usize] = slot;
        return Err(MsixError::SetIrqs(e));
    }

    let rc = unsafe { libc::close(slot) };
    if rc < 0 {
        return Err(MsixError::CloseEventfd(vector, std::io::Error::last_os_error()));
    }
    log::debug!("disarmed msix vector {}", vector);
    Ok(())
}

/// Disables every currently-armed vector in one pass, tolerating vectors
/// that were never armed.
pub fn disable_all(device: &mut PciDevice) -> Result<(), MsixError> {
    for vector in 0..device.vector_count() {
        if device.msix_efds[vector as usize] != -1 {
            disable_vector(device, vector)?;
        }
    }
    Ok(())
}
