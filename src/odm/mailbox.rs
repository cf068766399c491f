//! PF-side mailbox protocol: one worker thread per potential VF, woken by
//! the doorbell ISR, executing queue lifecycle commands against the
//! register file and replying in place.
//!
//! The retained `odm_pf.c` predates mailbox support, so there is no
//! surviving dispatch loop to port directly; the two-word bit layout,
//! command set, and reply convention come straight from `odm_pf.h`'s
//! `odm_mbox_dev_msg_t`/`odm_mbox_queue_msg_t`/`ODM_*` command constants.
//! `encode`/`decode` replace a bitfield union with explicit shift/mask
//! functions, since cross-compilation bitfield layouts aren't reliable.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::regs::{self, odm_dmax_qrst, ODM_CTL};
use crate::shmem::PmemHandle;
use crate::vfio::device::BarRegion;

pub const ODM_DEV_INIT: u8 = 0x1;
pub const ODM_DEV_CLOSE: u8 = 0x2;
pub const ODM_QUEUE_OPEN: u8 = 0x3;
pub const ODM_QUEUE_CLOSE: u8 = 0x4;
pub const ODM_REG_DUMP: u8 = 0x5;
pub const ODM_MBOX_THREAD_QUIT: u8 = 0x6;

const QUEUE_RESET_SPIN_LIMIT: u32 = 16 * 1024 * 1024;

/// Packs the response half: `rsp:8, nvfs:2, err:6, reserved:48`.
pub fn encode_d(rsp: u8, nvfs: u8, err: u8) -> u64 {
    (rsp as u64) | ((nvfs as u64 & 0x3) << 8) | ((err as u64 & 0x3f) << 10)
}

/// Unpacks the response half into `(rsp, nvfs, err)`.
pub fn decode_d(word: u64) -> (u8, u8, u8) {
    let rsp = (word & 0xff) as u8;
    let nvfs = ((word >> 8) & 0x3) as u8;
    let err = ((word >> 10) & 0x3f) as u8;
    (rsp, nvfs, err)
}

/// Packs the request half: `cmd:8, vf_id:8, q_idx:8, reserved:40`.
pub fn encode_q(cmd: u8, vf_id: u8, q_idx: u8) -> u64 {
    (cmd as u64) | ((vf_id as u64) << 8) | ((q_idx as u64) << 16)
}

/// Unpacks the request half into `(cmd, vf_id, q_idx)`.
pub fn decode_q(word: u64) -> (u8, u8, u8) {
    let cmd = (word & 0xff) as u8;
    let vf_id = ((word >> 8) & 0xff) as u8;
    let q_idx = ((word >> 16) & 0xff) as u8;
    (cmd, vf_id, q_idx)
}

type Slot = (Mutex<Option<(u64, u64)>>, Condvar);

pub struct MailboxWorker {
    slot: Arc<Slot>,
    handle: Option<JoinHandle<()>>,
}

/// Reset-timeout error code surfaced in the mailbox reply's `err` field
/// when a queue's `DMAX_QRST` bit fails to clear within the spin bound.
const ODM_ERR_QUEUE_RESET_TIMEOUT: u8 = 0x1;

/// Busy-waits for `DMAX_QRST(qid)`'s low bit to clear, bounded by
/// `QUEUE_RESET_SPIN_LIMIT` iterations, then zeroes `DMAX_IDS(qid)`.
/// Returns `false` if the bound was hit, so callers can surface the
/// failure in the mailbox reply instead of silently proceeding.
fn reset_queue(bar: &BarRegion, qid: u64) -> bool {
    regs::reg_write(bar, odm_dmax_qrst(qid), 1);
    let mut spins = 0;
    while regs::reg_read(bar, odm_dmax_qrst(qid)) & 0x1 != 0 {
        spins += 1;
        if spins >= QUEUE_RESET_SPIN_LIMIT {
            log::warn!("queue {} reset did not clear within spin bound", qid);
            regs::reg_write(bar, regs::odm_dmax_ids(qid), 0);
            return false;
        }
    }
    regs::reg_write(bar, regs::odm_dmax_ids(qid), 0);
    true
}

fn handle_queue_open(bar: &BarRegion, vf_id: u8, q_idx: u8, maxq_per_vf: i32) -> bool {
    let hw_qid = vf_id as u64 * maxq_per_vf as u64 + q_idx as u64;
    let ok = reset_queue(bar, hw_qid);
    let strm = vf_id as u64 + 1;
    let ids = ((strm & 0xff) << 40) | ((strm & 0xff) << 32);
    regs::reg_write(bar, regs::odm_dmax_ids(hw_qid), ids);
    ok
}

fn handle_dev_close(bar: &BarRegion, vf_id: u8, maxq_per_vf: i32) -> bool {
    let base = vf_id as u64 * maxq_per_vf as u64;
    let mut ok = true;
    for q in 0..maxq_per_vf as u64 {
        ok &= reset_queue(bar, base + q);
    }
    ok
}

/// Executes one mailbox command and returns the reply words to write
/// back to the VF's mailbox region.
fn dispatch(bar: &BarRegion, device_name: &str, pmem: &mut PmemHandle, cmd: u8, vf_id: u8, q_idx: u8) -> (u64, u64) {
    let err = match cmd {
        ODM_DEV_INIT => {
            super::sriov::observe(bar, device_name, pmem.as_mut());
            0
        }
        ODM_QUEUE_OPEN => {
            let maxq_per_vf = pmem.as_ref().maxq_per_vf;
            let ok = handle_queue_open(bar, vf_id, q_idx, maxq_per_vf);
            if let Some(flag) = pmem.as_mut().setup_done.get_mut(vf_id as usize) {
                *flag = ok;
            }
            if ok { 0 } else { ODM_ERR_QUEUE_RESET_TIMEOUT }
        }
        ODM_DEV_CLOSE => {
            let maxq_per_vf = pmem.as_ref().maxq_per_vf;
            let ok = handle_dev_close(bar, vf_id, maxq_per_vf);
            if let Some(flag) = pmem.as_mut().setup_done.get_mut(vf_id as usize) {
                *flag = false;
            }
            if ok { 0 } else { ODM_ERR_QUEUE_RESET_TIMEOUT }
        }
        _ => 0,
    };

    let ctl = regs::reg_read(bar, ODM_CTL);
    let nvfs = ((ctl >> 4) & 0x3) as u8;
    (encode_d(cmd, nvfs, err), encode_q(cmd, vf_id, q_idx))
}

fn worker_loop(vf_id: u8, bar: Arc<BarRegion>, device_name: String, pmem: Arc<Mutex<PmemHandle>>, slot: Arc<Slot>) {
    let (lock, cvar) = &*slot;
    loop {
        let msg = {
            let mut guard = lock.lock().unwrap();
            while guard.is_none() {
                guard = cvar.wait(guard).unwrap();
            }
            guard.take().unwrap()
        };

        let (_cmd_word0, word1) = msg;
        let (cmd, msg_vf_id, q_idx) = decode_q(word1);
        if cmd == ODM_MBOX_THREAD_QUIT {
            return;
        }

        let mut pmem = pmem.lock().unwrap();
        let (d, q) = dispatch(&bar, &device_name, &mut pmem, cmd, msg_vf_id, q_idx);
        drop(pmem);

        let reply_offset_d = regs::odm_mbox_pf_vfx_datax(vf_id as u64, 0);
        let reply_offset_q = regs::odm_mbox_pf_vfx_datax(vf_id as u64, 1);
        regs::reg_write(&bar, reply_offset_d, d);
        regs::reg_write(&bar, reply_offset_q, q);
    }
}

/// Spawns the worker thread for VF `vf_id`, parked on its condvar until a
/// message arrives or it is asked to quit.
pub fn spawn(vf_id: u8, bar: Arc<BarRegion>, device_name: String, pmem: Arc<Mutex<PmemHandle>>) -> MailboxWorker {
    let slot: Arc<Slot> = Arc::new((Mutex::new(None), Condvar::new()));
    let worker_slot = Arc::clone(&slot);
    let handle = std::thread::Builder::new()
        .name(format!("odm-mbox-vf{}", vf_id))
        .spawn(move || worker_loop(vf_id, bar, device_name, pmem, worker_slot))
        .expect("failed to spawn mailbox worker thread");
    MailboxWorker {
        slot,
        handle: Some(handle),
    }
}

/// Hands `msg` to the worker: lock, store, signal, unlock.
pub fn post(worker: &MailboxWorker, msg: (u64, u64)) {
    let (lock, cvar) = &*worker.slot;
    *lock.lock().unwrap() = Some(msg);
    cvar.notify_one();
}

/// Posts the quit sentinel and joins the worker thread.
pub fn shutdown(mut worker: MailboxWorker) {
    post(&worker, (0, encode_q(ODM_MBOX_THREAD_QUIT, 0, 0)));
    if let Some(handle) = worker.handle.take() {
        let _ = handle.join();
    }
}

/// Doorbell ISR: reads the pending-VF bitmap, clears each set bit, and
/// hands the corresponding mailbox words to that VF's worker.
pub fn doorbell_isr(bar: &BarRegion, workers: &[MailboxWorker]) {
    let pending = regs::reg_read(bar, regs::ODM_MBOX_VF_PF_INT);
    for i in 0..16u64 {
        if pending & (1 << i) == 0 {
            continue;
        }
        let word0 = regs::reg_read(bar, regs::odm_mbox_pf_vfx_datax(i, 0));
        let word1 = regs::reg_read(bar, regs::odm_mbox_pf_vfx_datax(i, 1));
        regs::reg_write(bar, regs::ODM_MBOX_VF_PF_INT, 1 << i);

        let (cmd, _vf_id, q_idx) = decode_q(word1);
        let stamped_q = encode_q(cmd, i as u8, q_idx);
        if let Some(worker) = workers.get(i as usize) {
            post(worker, (word0, stamped_q));
        } else {
            log::error!("mailbox doorbell fired for unknown vf {}", i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn d_half_roundtrips() {
        let word = encode_d(0x3, 0x1, 0x2a);
        assert_eq!(decode_d(word), (0x3, 0x1, 0x2a));
    }

    #[test]
    fn q_half_roundtrips() {
        let word = encode_q(ODM_QUEUE_OPEN, 2, 5);
        assert_eq!(decode_q(word), (ODM_QUEUE_OPEN, 2, 5));
    }

    #[test]
    fn reserved_bits_do_not_leak_into_adjacent_fields() {
        let word = encode_d(0xff, 0xff, 0xff);
        let (rsp, nvfs, err) = decode_d(word);
        assert_eq!(rsp, 0xff);
        assert_eq!(nvfs, 0x3);
        assert_eq!(err, 0x3f);
    }
}
