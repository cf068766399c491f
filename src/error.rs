use thiserror::Error;

/// Errors raised while joining or leaving a VFIO IOMMU group, or while
/// managing the process-wide container singleton.
#[derive(Debug, Error)]
pub enum VfioContainerError {
    #[error("failed to open /dev/vfio/vfio: {0}")]
    OpenContainer(#[source] std::io::Error),
    #[error("failed to set IOMMU type on container: {0}")]
    SetIommuType(#[source] std::io::Error),
    #[error("failed to resolve iommu_group for {0}: {1}")]
    ResolveGroup(String, #[source] std::io::Error),
    #[error("malformed iommu_group link for {0}")]
    MalformedGroupLink(String),
    #[error("failed to open /dev/vfio/{0}: {1}")]
    OpenGroup(i32, #[source] std::io::Error),
    #[error("group {0} is not viable (not all devices bound to vfio)")]
    GroupNotViable(i32),
    #[error("failed to query group status for group {0}: {1}")]
    GroupStatus(i32, #[source] std::io::Error),
    #[error("failed to set container on group {0}: {1}")]
    SetContainer(i32, #[source] std::io::Error),
    #[error("group table is full ({0} slots in use)")]
    GroupTableFull(usize),
}

/// Errors raised while bringing up or tearing down the PCI/VFIO device
/// handle: device fd discovery, BAR enumeration, mmap.
#[derive(Debug, Error)]
pub enum PciDeviceError {
    #[error(transparent)]
    Container(#[from] VfioContainerError),
    #[error("failed to get device fd for {0}: {1}")]
    GetDeviceFd(String, #[source] std::io::Error),
    #[error("failed to get device info for {0}: {1}")]
    GetDeviceInfo(String, #[source] std::io::Error),
    #[error("failed to get region info for index {0}: {1}")]
    GetRegionInfo(u32, #[source] std::io::Error),
    #[error("failed to mmap region {0}: {1}")]
    Mmap(u32, #[source] std::io::Error),
    #[error("failed to get irq info: {0}")]
    GetIrqInfo(#[source] std::io::Error),
    #[error("device does not support eventfd-signalled interrupts")]
    NoEventfdSupport,
    #[error("device exposes no MSI-X vectors")]
    NoVectors,
    #[error("device BDF {0} is longer than 31 characters")]
    NameTooLong(String),
}

/// Errors raised by MSI-X vector arming/disarming.
#[derive(Debug, Error)]
pub enum MsixError {
    #[error("vector {0} is out of range (count = {1})")]
    VectorOutOfRange(u32, u32),
    #[error("vector {0} is already enabled")]
    AlreadyEnabled(u32),
    #[error("vector {0} is already disabled")]
    AlreadyDisabled(u32),
    #[error("failed to create eventfd: {0}")]
    CreateEventfd(#[source] std::io::Error),
    #[error("failed to close eventfd for vector {0}: {1}")]
    CloseEventfd(u32, #[source] std::io::Error),
    #[error("failed to commit irq set to the kernel: {0}")]
    SetIrqs(#[source] std::io::Error),
}

/// Errors raised by the interrupt demultiplexer.
#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("vector {0} is out of range (count = {1})")]
    VectorOutOfRange(u32, u32),
    #[error("vector {0} is not armed")]
    NotArmed(u32),
    #[error("vector {0} already has a callback registered")]
    AlreadyRegistered(u32),
    #[error("vector {0} has no callback registered")]
    NotRegistered(u32),
    #[error("failed to create epoll instance: {0}")]
    CreateEpoll(#[source] std::io::Error),
    #[error("failed to add fd to epoll set: {0}")]
    EpollAdd(#[source] std::io::Error),
    #[error("failed to remove fd from epoll set: {0}")]
    EpollDel(#[source] std::io::Error),
    #[error("failed to create the shutdown eventfd: {0}")]
    CreateSentinel(#[source] std::io::Error),
    #[error("failed to join the demux worker thread")]
    JoinWorker,
}

/// Errors raised while creating or releasing named shared memory.
#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("failed to open shared memory {0}: {1}")]
    Open(String, #[source] std::io::Error),
    #[error("failed to truncate shared memory {0}: {1}")]
    Truncate(String, #[source] std::io::Error),
    #[error("failed to mmap shared memory {0}: {1}")]
    Mmap(String, #[source] std::io::Error),
    #[error("shared memory {0} was not tracked")]
    NotTracked(String),
    #[error("failed to unlink shared memory {0}: {1}")]
    Unlink(String, #[source] std::io::Error),
}

/// Top-level error returned by the bring-up sequencer (`probe`). Any of
/// these is fatal: the caller refuses to run and tears down whatever was
/// already constructed.
#[derive(Debug, Error)]
pub enum OdmError {
    #[error(transparent)]
    Pci(#[from] PciDeviceError),
    #[error(transparent)]
    Msix(#[from] MsixError),
    #[error(transparent)]
    Interrupt(#[from] InterruptError),
    #[error(transparent)]
    Shmem(#[from] ShmemError),
    #[error("failed to spawn mailbox worker for vf {0}")]
    SpawnWorker(u32),
    #[error("invalid uuid string: {0}")]
    InvalidUuid(String),
}
