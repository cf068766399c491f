//! Interrupt demultiplexer: one epoll instance and one worker thread,
//! process-wide, shared by every armed MSI-X vector regardless of which
//! device produced it.
//!
//! Grounded on the eventfd/epoll loop sketched in `interrupts.rs`
//! (`vfio_epoll_fd`/`vfio_event_fd` per queue) and on `vfio_pci_irq.c`'s
//! `irq_thread_fn`, generalized from "one thread per queue" to "one
//! thread, keyed by eventfd" since every vector here converges on the
//! same register file. The callback is a plain closure rather than a
//! C-style `(fn, void*)` pair — no dynamic-dispatch callback hierarchy
//! is needed once closures can capture their own state.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use epoll::{ControlOptions, Event, Events};

use crate::error::InterruptError;

pub type InterruptCallback = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    epoll_fd: RawFd,
    slots: Mutex<HashMap<RawFd, InterruptCallback>>,
    running: AtomicBool,
}

struct Demux {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

static DEMUX: Mutex<Option<Demux>> = Mutex::new(None);

fn start() -> Result<Demux, InterruptError> {
    let epoll_fd = epoll::create(false).map_err(InterruptError::CreateEpoll)?;
    let shared = Arc::new(Shared {
        epoll_fd,
        slots: Mutex::new(HashMap::new()),
        running: AtomicBool::new(true),
    });
    let worker_shared = Arc::clone(&shared);
    let worker = std::thread::Builder::new()
        .name("odm-irq-demux".to_string())
        .spawn(move || worker_loop(worker_shared))
        .expect("failed to spawn interrupt demux worker thread");
    Ok(Demux {
        shared,
        worker: Some(worker),
    })
}

fn worker_loop(shared: Arc<Shared>) {
    let mut events = [Event::new(Events::empty(), 0); 16];
    while shared.running.load(Ordering::SeqCst) {
        let n = match epoll::wait(shared.epoll_fd, -1, &mut events) {
            Ok(n) => n,
            Err(e) => {
                log::error!("epoll_wait failed on interrupt demux: {}", e);
                continue;
            }
        };
        for ev in &events[..n] {
            let ev_events = ev.events;
            if ev_events & Events::EPOLLIN.bits() == 0 {
                log::error!("unexpected epoll event {:#x} on interrupt demux", ev_events);
                continue;
            }
            let efd = ev.data as RawFd;
            let mut buf = [0u8; 8];
            let rc = unsafe { libc::read(efd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if rc < 0 {
                log::error!("failed to drain eventfd {}: {}", efd, std::io::Error::last_os_error());
                continue;
            }
            let callback = shared.slots.lock().unwrap().get(&efd).cloned();
            match callback {
                Some(cb) => cb(),
                None => log::debug!("no callback installed for eventfd {}, dropping wakeup", efd),
            }
        }
    }
}

/// Registers `callback` to run (on the shared worker thread) whenever
/// `efd` becomes readable. Lazily starts the demux on first use. Fails if
/// `efd` is already registered.
pub fn register(efd: RawFd, callback: InterruptCallback) -> Result<(), InterruptError> {
    let mut guard = DEMUX.lock().unwrap();
    if guard.is_none() {
        *guard = Some(start()?);
    }
    let demux = guard.as_mut().unwrap();

    {
        let mut slots = demux.shared.slots.lock().unwrap();
        if slots.contains_key(&efd) {
            return Err(InterruptError::AlreadyRegistered(efd as u32));
        }
        slots.insert(efd, callback);
    }

    let event = Event::new(Events::EPOLLIN, efd as u64);
    epoll::ctl(demux.shared.epoll_fd, ControlOptions::EPOLL_CTL_ADD, efd, event).map_err(|e| {
        demux.shared.slots.lock().unwrap().remove(&efd);
        InterruptError::EpollAdd(e)
    })
}

/// Unregisters `efd`. Once the last registration is removed, the worker
/// thread is woken with a sentinel eventfd, joined, and every demux
/// resource is torn down.
pub fn unregister(efd: RawFd) -> Result<(), InterruptError> {
    let mut guard = DEMUX.lock().unwrap();
    let demux = guard.as_mut().ok_or(InterruptError::NotRegistered(efd as u32))?;

    {
        let mut slots = demux.shared.slots.lock().unwrap();
        if slots.remove(&efd).is_none() {
            return Err(InterruptError::NotRegistered(efd as u32));
        }
    }

    epoll::ctl(demux.shared.epoll_fd, ControlOptions::EPOLL_CTL_DEL, efd, Event::new(Events::empty(), 0))
        .map_err(InterruptError::EpollDel)?;

    let last_slot = demux.shared.slots.lock().unwrap().is_empty();
    if last_slot {
        let mut demux = guard.take().unwrap();
        shutdown(&mut demux)?;
    }
    Ok(())
}

fn shutdown(demux: &mut Demux) -> Result<(), InterruptError> {
    let wake_fd = unsafe { eventfd::eventfd(0, libc::EFD_NONBLOCK) };
    if wake_fd < 0 {
        return Err(InterruptError::CreateSentinel(std::io::Error::last_os_error()));
    }
    epoll::ctl(
        demux.shared.epoll_fd,
        ControlOptions::EPOLL_CTL_ADD,
        wake_fd,
        Event::new(Events::EPOLLIN, wake_fd as u64),
    )
    .map_err(InterruptError::EpollAdd)?;

    demux.shared.running.store(false, Ordering::SeqCst);
    let one: u64 = 1;
    unsafe { libc::write(wake_fd, &one as *const u64 as *const _, 8) };

    if let Some(worker) = demux.worker.take() {
        worker.join().map_err(|_| InterruptError::JoinWorker)?;
    }

    unsafe {
        libc::close(wake_fd);
        libc::close(demux.shared.epoll_fd);
    }
    log::debug!("interrupt demux shut down, no registrations remaining");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn raw_eventfd() -> RawFd {
        let fd = unsafe { eventfd::eventfd(0, 0) };
        assert!(fd >= 0, "failed to create test eventfd");
        fd
    }

    #[test]
    fn register_then_trigger_invokes_callback() {
        let efd = raw_eventfd();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = Arc::clone(&fired);
        register(efd, Arc::new(move || fired_cb.store(true, Ordering::SeqCst))).expect("register");

        let one: u64 = 1;
        unsafe { libc::write(efd, &one as *const u64 as *const _, 8) };
        std::thread::sleep(Duration::from_millis(100));

        assert!(fired.load(Ordering::SeqCst));
        unregister(efd).expect("unregister");
        unsafe { libc::close(efd) };
    }

    #[test]
    fn duplicate_register_is_rejected() {
        let efd = raw_eventfd();
        register(efd, Arc::new(|| {})).expect("first register");
        assert!(register(efd, Arc::new(|| {})).is_err());
        unregister(efd).expect("unregister");
        unsafe { libc::close(efd) };
    }

    #[test]
    fn unregister_unknown_fd_is_an_error() {
        assert!(unregister(99999).is_err());
    }

    #[test]
    fn many_vectors_each_fire_independently() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut efds = Vec::new();
        for _ in 0..4 {
            let efd = raw_eventfd();
            let counter = Arc::clone(&counter);
            register(efd, Arc::new(move || { counter.fetch_add(1, Ordering::SeqCst); })).expect("register");
            efds.push(efd);
        }
        for &efd in &efds {
            let one: u64 = 1;
            unsafe { libc::write(efd, &one as *const u64 as *const _, 8) };
        }
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        for efd in efds {
            unregister(efd).expect("unregister");
            unsafe { libc::close(efd) };
        }
    }
}
