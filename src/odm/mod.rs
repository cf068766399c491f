//! ODM top-level aggregate: global register bring-up/tear-down, the
//! per-vector interrupt policy, and the sequencing that ties the VFIO
//! device handle, the mailbox workers, and the shared-memory blob
//! together into one lifecycle.
//!
//! Grounded on `odm_init`/`odm_fini`/`odm_irq_init`/`odm_irq_free`/
//! `odm_pf_probe`/`odm_pf_release` in `odm_pf.c`, generalized to
//! reverse-order `Result`/`Drop` unwinding instead of the `goto`-label
//! cascade, and extended with the mailbox worker pool and SR-IOV
//! observer that C file never covers.

pub mod mailbox;
pub mod selftest;
pub mod sriov;

use std::sync::{Arc, Mutex};

use crate::error::OdmError;
use crate::regs::{self, ODM_MAX_REQQ_INT, ODM_MAX_VFS, ODM_MBOX_VF_PF_IRQ, ODM_NCBO_ERR_IRQ, ODM_PF_RAS_IRQ};
use crate::shmem::{self, PmemHandle};
use crate::uuid::Uuid;
use crate::vfio::device::{BarRegion, PciDevice};
use crate::vfio::msix;

pub const ODM_PF_PCI_BDF: &str = "0000:08:00.0";
const ODM_PMEM_NAME: &str = "/odm_pmem";

#[derive(Debug, Clone)]
pub struct OdmConfig {
    pub eng_sel: u32,
    pub uuid: Uuid,
    pub num_vfs: u8,
}

pub struct OdmDevice {
    pci: PciDevice,
    bar: Arc<BarRegion>,
    config: OdmConfig,
    workers: Arc<Mutex<Vec<mailbox::MailboxWorker>>>,
    num_vecs: u32,
}

impl OdmDevice {
    pub fn config(&self) -> &OdmConfig {
        &self.config
    }

    pub fn pci_bdf(&self) -> &str {
        &self.pci.name
    }
}

/// Builds a second, `Arc`-shared handle onto the PF's first mapped BAR —
/// the region all ODM register access targets. `BarRegion` is not
/// `Clone`; this copies the pointer/length pair, which stays valid for
/// as long as `OdmDevice` keeps the owning `PciDevice` alive.
pub(crate) fn bar_handle(pci: &PciDevice) -> Arc<BarRegion> {
    let region = pci
        .regions
        .first()
        .expect("device setup guarantees at least one mapped region");
    Arc::new(BarRegion {
        index: region.index,
        ptr: region.ptr,
        len: region.len,
    })
}

/// Programs global engine FIFO sizing, DMA control, ODM enable, the
/// request-queue threshold, and NCB MOLR.
fn odm_init(bar: &BarRegion) {
    for engine in 0..crate::regs::ODM_MAX_ENGINES as u64 {
        let mut reg = regs::reg_read(bar, regs::odm_engx_buf(engine));
        reg = (reg & !0x7f) | (regs::ODM_ENG_MAX_FIFO / crate::regs::ODM_MAX_ENGINES as u64);
        regs::reg_write(bar, regs::odm_engx_buf(engine), reg);
    }

    let mut reg = 1u64 << 39; // ZBWCSEN
    reg |= 0x3 << 48; // DMA_ENB(0x3)
    regs::reg_write(bar, regs::ODM_DMA_CONTROL, reg);
    regs::reg_write(bar, regs::ODM_CTL, regs::ODM_CTL_EN);
    regs::reg_write(bar, regs::ODM_REQQ_GENBUFF_TH_LIMIT, regs::ODM_TH_VAL);

    let mut reg = regs::reg_read(bar, regs::ODM_NCB_CFG);
    reg = (reg & !0x3ff) | (0x200 & 0x3ff);
    regs::reg_write(bar, regs::ODM_NCB_CFG, reg);
}

fn odm_fini(bar: &BarRegion) {
    for engine in 0..crate::regs::ODM_MAX_ENGINES as u64 {
        regs::reg_write(bar, regs::odm_engx_buf(engine), 0);
    }
    regs::reg_write(bar, regs::ODM_DMA_CONTROL, 0);
    regs::reg_write(bar, regs::ODM_CTL, !regs::ODM_CTL_EN);
}

/// The error-logging callback armed on every non-mailbox vector.
/// Dispatches by vector index: `[0, 32)` clears the per-queue interrupt,
/// `0x20` clears `PF_RAS`, `0x22` clears `NCBO_ERR_INFO`.
fn irq_error_callback(bar: Arc<BarRegion>, index: u32) -> impl Fn() + Send + Sync + 'static {
    move || {
        if index < ODM_MAX_REQQ_INT {
            let reg_val = regs::reg_read(&bar, regs::odm_reqqx_int(index as u64));
            regs::reg_write(&bar, regs::odm_reqqx_int(index as u64), reg_val);
        } else if index == ODM_PF_RAS_IRQ {
            let reg_val = regs::reg_read(&bar, regs::ODM_PF_RAS);
            log::error!("RAS_INT: {:#018x}", reg_val);
            regs::reg_write(&bar, regs::ODM_PF_RAS, reg_val);
        } else if index == ODM_NCBO_ERR_IRQ {
            let reg_val = regs::reg_read(&bar, regs::ODM_NCBO_ERR_INFO);
            log::error!("NCB_ERR_INT: {:#018x}", reg_val);
            regs::reg_write(&bar, regs::ODM_NCBO_ERR_INFO, reg_val);
        } else {
            log::error!("invalid intr index: {:#x}", index);
        }
    }
}

/// Clears and disables `PF_RAS` and every `REQQX_INT[i]`, arms and
/// registers every vector except the dedicated mailbox vector, then wires
/// the mailbox vector to the doorbell ISR and re-enables all interrupts.
fn irq_init(pci: &mut PciDevice, bar: &Arc<BarRegion>, workers: Arc<Mutex<Vec<mailbox::MailboxWorker>>>) -> Result<u32, OdmError> {
    let num_vecs = pci.vector_count();

    regs::reg_write(bar, regs::ODM_PF_RAS, regs::ODM_PF_RAS_INT);
    regs::reg_write(bar, regs::ODM_PF_RAS_ENA_W1C, regs::ODM_PF_RAS_INT);
    for i in 0..ODM_MAX_REQQ_INT as u64 {
        regs::reg_write(bar, regs::odm_reqqx_int(i), regs::ODM_REQQ_INT);
        regs::reg_write(bar, regs::odm_reqqx_int_ena_w1c(i), regs::ODM_REQQ_INT);
    }

    let mut armed = Vec::new();
    let result = (|| {
        for vector in 0..num_vecs {
            if vector == ODM_MBOX_VF_PF_IRQ {
                continue;
            }
            msix::enable_vector(pci, vector)?;
            let cb = Arc::new(irq_error_callback(Arc::clone(bar), vector));
            pci.register_interrupt(vector, cb)?;
            armed.push(vector);
        }

        if ODM_MBOX_VF_PF_IRQ < num_vecs {
            msix::enable_vector(pci, ODM_MBOX_VF_PF_IRQ)?;
            let mbox_bar = Arc::clone(bar);
            let mbox_workers = Arc::clone(&workers);
            let cb: crate::interrupt::InterruptCallback = Arc::new(move || {
                let workers = mbox_workers.lock().unwrap();
                mailbox::doorbell_isr(&mbox_bar, &workers);
            });
            pci.register_interrupt(ODM_MBOX_VF_PF_IRQ, cb)?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        for vector in armed {
            let _ = pci.unregister_interrupt(vector);
            let _ = msix::disable_vector(pci, vector);
        }
        return Err(e);
    }

    for i in 0..ODM_MAX_REQQ_INT as u64 {
        regs::reg_write(bar, regs::odm_reqqx_int_ena_w1s(i), regs::ODM_REQQ_INT);
    }
    regs::reg_write(bar, regs::ODM_PF_RAS_ENA_W1S, regs::ODM_PF_RAS_INT);

    Ok(num_vecs)
}

fn irq_free(pci: &mut PciDevice, bar: &BarRegion, num_vecs: u32) {
    regs::reg_write(bar, regs::ODM_PF_RAS_ENA_W1C, regs::ODM_PF_RAS_INT);
    for i in 0..ODM_MAX_REQQ_INT as u64 {
        regs::reg_write(bar, regs::odm_reqqx_int(i), regs::ODM_REQQ_INT);
        regs::reg_write(bar, regs::odm_reqqx_int_ena_w1c(i), regs::ODM_REQQ_INT);
    }
    for vector in 0..num_vecs {
        let _ = pci.unregister_interrupt(vector);
        let _ = msix::disable_vector(pci, vector);
    }
}

/// Brings up the PF: joins the device, programs global registers, arms
/// interrupts, and spawns the sixteen mailbox workers. On any failure,
/// everything already constructed is unwound in reverse order.
pub fn probe(config: OdmConfig) -> Result<OdmDevice, OdmError> {
    let mut pci = PciDevice::setup(ODM_PF_PCI_BDF)?;
    let bar = bar_handle(&pci);

    let pmem_handle = match shmem::pmem_alloc_state(ODM_PMEM_NAME) {
        Ok(h) => h,
        Err(e) => return Err(OdmError::Shmem(e)),
    };
    let pmem = Arc::new(Mutex::new(pmem_handle));

    log::debug!("{}: probe successful", ODM_PF_PCI_BDF);
    odm_init(&bar);
    sriov::seed(&bar, pmem.lock().unwrap().as_mut(), config.num_vfs);

    let workers: Vec<mailbox::MailboxWorker> = (0..ODM_MAX_VFS as u8)
        .map(|vf_id| mailbox::spawn(vf_id, Arc::clone(&bar), ODM_PF_PCI_BDF.to_string(), Arc::clone(&pmem)))
        .collect();
    let workers = Arc::new(Mutex::new(workers));

    let num_vecs = match irq_init(&mut pci, &bar, Arc::clone(&workers)) {
        Ok(n) => n,
        Err(e) => {
            odm_fini(&bar);
            let drained = std::mem::take(&mut *workers.lock().unwrap());
            for w in drained {
                mailbox::shutdown(w);
            }
            let _ = shmem::pmem_free(ODM_PMEM_NAME);
            return Err(e);
        }
    };

    Ok(OdmDevice {
        pci,
        bar,
        config,
        workers,
        num_vecs,
    })
}

/// Tears down the PF in exact reverse of `probe`: quits and joins every
/// mailbox worker, frees interrupts, zeroes global registers, releases
/// the shared-memory blob, then drops the device handle (which itself
/// disables any remaining vectors, unmaps BARs, and leaves the group).
pub fn release(mut device: OdmDevice) {
    let drained = std::mem::take(&mut *device.workers.lock().unwrap());
    for worker in drained {
        mailbox::shutdown(worker);
    }

    irq_free(&mut device.pci, &device.bar, device.num_vecs);
    odm_fini(&device.bar);

    if let Err(e) = shmem::pmem_free(ODM_PMEM_NAME) {
        log::error!("failed to free shared state: {}", e);
    }

    log::debug!("{}: release complete", ODM_PF_PCI_BDF);
}
