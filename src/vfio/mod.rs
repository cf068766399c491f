//! Raw VFIO ioctl surface: struct layouts and ioctl numbers lifted from
//! `linux/vfio.h`, plus the small helper functions that wrap them in
//! `Result`. `container` and `device` build the higher-level container
//! and PCI device handle resources on top of these.

pub mod container;
pub mod device;
pub mod msix;

use std::ffi::CString;
use std::fs;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

use crate::error::{PciDeviceError, VfioContainerError};

// ioctl numbers are `_IO(';', VFIO_BASE + n)` with VFIO_BASE = 100 and no
// direction/size encoding, i.e. `0x3b00 + (100 + n)`. Extended with
// VFIO_DEVICE_GET_INFO following the same formula, since device-info
// queries are needed here but weren't previously.
pub const VFIO_GET_API_VERSION: u64 = 15204;
pub const VFIO_CHECK_EXTENSION: u64 = 15205;
pub const VFIO_SET_IOMMU: u64 = 15206;
pub const VFIO_GROUP_GET_STATUS: u64 = 15207;
pub const VFIO_GROUP_SET_CONTAINER: u64 = 15208;
pub const VFIO_GROUP_GET_DEVICE_FD: u64 = 15210;
pub const VFIO_DEVICE_GET_INFO: u64 = 15211;
pub const VFIO_DEVICE_GET_REGION_INFO: u64 = 15212;
pub const VFIO_DEVICE_GET_IRQ_INFO: u64 = 15213;
pub const VFIO_DEVICE_SET_IRQS: u64 = 15214;

pub const VFIO_API_VERSION: i32 = 0;
pub const VFIO_TYPE1_IOMMU: u64 = 1;

pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;
pub const VFIO_GROUP_FLAGS_CONTAINER_SET: u32 = 1 << 1;

pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;
pub const VFIO_IRQ_INFO_EVENTFD: u32 = 1 << 0;
pub const VFIO_PCI_MSIX_IRQ_INDEX: u32 = 2;

pub const VFIO_MAX_GROUPS: usize = 8;
pub const MAX_REGION_INDEX: u32 = 5;

const SYSFS_PCI_DEV_PATH: &str = "/sys/bus/pci/devices";

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Default)]
pub struct vfio_group_status {
    pub argsz: u32,
    pub flags: u32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Default)]
pub struct vfio_device_info {
    pub argsz: u32,
    pub flags: u32,
    pub num_regions: u32,
    pub num_irqs: u32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Default)]
pub struct vfio_region_info {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub cap_offset: u32,
    pub size: u64,
    pub offset: u64,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Default)]
pub struct vfio_irq_info {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub count: u32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
pub struct vfio_irq_set_header {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub start: u32,
    pub count: u32,
}

/// Resolves the IOMMU group number for a PCI BDF by following the
/// `iommu_group` symlink and parsing its last path segment.
pub fn resolve_group_num(device_name: &str) -> Result<i32, VfioContainerError> {
    let link = format!("{}/{}/iommu_group", SYSFS_PCI_DEV_PATH, device_name);
    let target = fs::read_link(&link)
        .map_err(|e| VfioContainerError::ResolveGroup(device_name.to_string(), e))?;
    let tail = target
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| VfioContainerError::MalformedGroupLink(device_name.to_string()))?;
    tail.parse::<i32>()
        .map_err(|_| VfioContainerError::MalformedGroupLink(device_name.to_string()))
}

pub fn open_container() -> Result<RawFd, VfioContainerError> {
    let path = CString::new("/dev/vfio/vfio").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(VfioContainerError::OpenContainer(std::io::Error::last_os_error()));
    }
    Ok(fd)
}

pub fn open_group(group_num: i32) -> Result<RawFd, VfioContainerError> {
    let path = CString::new(format!("/dev/vfio/{}", group_num)).unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(VfioContainerError::OpenGroup(group_num, std::io::Error::last_os_error()));
    }
    Ok(fd)
}

pub fn group_status(group_fd: RawFd, group_num: i32) -> Result<vfio_group_status, VfioContainerError> {
    let mut status = vfio_group_status {
        argsz: mem::size_of::<vfio_group_status>() as u32,
        flags: 0,
    };
    let rc = unsafe { libc::ioctl(group_fd, VFIO_GROUP_GET_STATUS, &mut status) };
    if rc < 0 {
        return Err(VfioContainerError::GroupStatus(group_num, std::io::Error::last_os_error()));
    }
    Ok(status)
}

pub fn set_container(group_fd: RawFd, container_fd: RawFd, group_num: i32) -> Result<(), VfioContainerError> {
    let rc = unsafe { libc::ioctl(group_fd, VFIO_GROUP_SET_CONTAINER, &container_fd) };
    if rc < 0 {
        return Err(VfioContainerError::SetContainer(group_num, std::io::Error::last_os_error()));
    }
    Ok(())
}

pub fn set_iommu_type(container_fd: RawFd) -> Result<(), VfioContainerError> {
    let rc = unsafe { libc::ioctl(container_fd, VFIO_SET_IOMMU, VFIO_TYPE1_IOMMU) };
    if rc < 0 {
        return Err(VfioContainerError::SetIommuType(std::io::Error::last_os_error()));
    }
    Ok(())
}

pub fn get_device_fd(group_fd: RawFd, name: &str) -> Result<RawFd, PciDeviceError> {
    let cname = CString::new(name).unwrap();
    let fd = unsafe { libc::ioctl(group_fd, VFIO_GROUP_GET_DEVICE_FD, cname.as_ptr()) };
    if fd < 0 {
        return Err(PciDeviceError::GetDeviceFd(name.to_string(), std::io::Error::last_os_error()));
    }
    Ok(fd)
}

pub fn get_device_info(device_fd: RawFd, name: &str) -> Result<vfio_device_info, PciDeviceError> {
    let mut info = vfio_device_info {
        argsz: mem::size_of::<vfio_device_info>() as u32,
        ..Default::default()
    };
    let rc = unsafe { libc::ioctl(device_fd, VFIO_DEVICE_GET_INFO, &mut info) };
    if rc < 0 {
        return Err(PciDeviceError::GetDeviceInfo(name.to_string(), std::io::Error::last_os_error()));
    }
    Ok(info)
}

pub fn get_region_info(device_fd: RawFd, index: u32) -> Result<vfio_region_info, PciDeviceError> {
    let mut info = vfio_region_info {
        argsz: mem::size_of::<vfio_region_info>() as u32,
        index,
        ..Default::default()
    };
    let rc = unsafe { libc::ioctl(device_fd, VFIO_DEVICE_GET_REGION_INFO, &mut info) };
    if rc < 0 {
        return Err(PciDeviceError::GetRegionInfo(index, std::io::Error::last_os_error()));
    }
    Ok(info)
}

/// Memory-maps a BAR region read/write/shared at the kernel-reported
/// offset within the device fd.
pub fn mmap_region(device_fd: RawFd, info: &vfio_region_info) -> Result<(*mut u8, usize), PciDeviceError> {
    let len = info.size as usize;
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            device_fd,
            info.offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(PciDeviceError::Mmap(info.index, std::io::Error::last_os_error()));
    }
    Ok((ptr as *mut u8, len))
}

pub fn get_irq_info(device_fd: RawFd, index: u32) -> Result<vfio_irq_info, PciDeviceError> {
    let mut info = vfio_irq_info {
        argsz: mem::size_of::<vfio_irq_info>() as u32,
        index,
        ..Default::default()
    };
    let rc = unsafe { libc::ioctl(device_fd, VFIO_DEVICE_GET_IRQ_INFO, &mut info) };
    if rc < 0 {
        return Err(PciDeviceError::GetIrqInfo(std::io::Error::last_os_error()));
    }
    Ok(info)
}

/// Commits the full MSI-X eventfd table (`-1` for disarmed slots) to the
/// kernel in a single `VFIO_DEVICE_SET_IRQS` call.
pub fn commit_msix_eventfds(device_fd: RawFd, efds: &[i32]) -> std::io::Result<()> {
    let header_len = mem::size_of::<vfio_irq_set_header>();
    let data_len = efds.len() * mem::size_of::<i32>();
    let mut buf = vec![0u8; header_len + data_len];

    let header = vfio_irq_set_header {
        argsz: buf.len() as u32,
        flags: VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
        index: VFIO_PCI_MSIX_IRQ_INDEX,
        start: 0,
        count: efds.len() as u32,
    };
    unsafe {
        ptr::write(buf.as_mut_ptr() as *mut vfio_irq_set_header, header);
        let data_ptr = buf.as_mut_ptr().add(header_len) as *mut i32;
        ptr::copy_nonoverlapping(efds.as_ptr(), data_ptr, efds.len());
    }

    let rc = unsafe { libc::ioctl(device_fd, VFIO_DEVICE_SET_IRQS, buf.as_ptr()) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Issues the all-zero-count `SET_IRQS` call that drops every vector in
/// one shot, used on teardown.
pub fn disable_all_msix(device_fd: RawFd) -> std::io::Result<()> {
    let header = vfio_irq_set_header {
        argsz: mem::size_of::<vfio_irq_set_header>() as u32,
        flags: VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
        index: VFIO_PCI_MSIX_IRQ_INDEX,
        start: 0,
        count: 0,
    };
    let rc = unsafe { libc::ioctl(device_fd, VFIO_DEVICE_SET_IRQS, &header) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn iommu_group_symlink_exists(device_name: &str) -> bool {
    Path::new(&format!("{}/{}/iommu_group", SYSFS_PCI_DEV_PATH, device_name)).exists()
}
