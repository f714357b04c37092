//! Semaphore waits through the simulated port

mod common;

use std::sync::{Arc, OnceLock};

use common::{Sim, Slot, Trace};
use rtk_kernel::sync::{PlSem, RtSem, Sem};
use rtk_kernel::time::{Swt, SwtFlags, Tick};
use rtk_kernel::wq::{PlWaitQueue, RtWaitQueue, WaitQueue};
use rtk_kernel::{KernelError, KernelResult, ThreadState};

#[test]
fn timed_wait_expires_with_zero_left() {
    let sim = Sim::new(1);
    let sem = PlSem::new(0, 1).unwrap();
    let out: Slot<(KernelResult<()>, Tick)> = Slot::new();
    {
        let (sem, out) = (sem.clone(), out.clone());
        sim.spawn(0, "waiter", 5, move |skd| {
            let mut to = 100;
            let rc = sem.timed_wait(&skd, &mut to);
            out.set((rc, to));
            0
        });
    }
    sim.start();
    sim.tick(0, 99);
    assert!(out.get().is_none());
    assert_eq!(sem.waiters(), 1);
    sim.tick(0, 1);
    assert_eq!(out.get(), Some((Err(KernelError::TimedOut), 0)));
    assert_eq!(sem.waiters(), 0);
}

#[test]
fn post_from_interrupt_wakes_waiter() {
    let sim = Sim::new(1);
    let sem = RtSem::new(0, 4).unwrap();
    let out: Slot<(KernelResult<()>, Tick)> = Slot::new();
    let thd = {
        let (sem, out) = (sem.clone(), out.clone());
        sim.spawn(0, "waiter", 5, move |skd| {
            let mut to = 50;
            let rc = sem.timed_wait(&skd, &mut to);
            out.set((rc, to));
            0
        })
    };
    sim.start();
    sim.tick(0, 10);
    assert!(thd.state().contains(ThreadState::BLOCKING | ThreadState::SLEEPING));
    sem.post().unwrap();
    sim.wait_idle(0);
    assert_eq!(out.get(), Some((Ok(()), 40)));
    // the count went to the waiter, not to the semaphore
    assert_eq!(sem.value(), 0);
    assert!(thd.state().contains(ThreadState::EXITED));
}

/// `lo` queues first, then `hi`; the first post wakes one of them
fn first_woken<Q: WaitQueue>() -> Vec<String> {
    let sim = Sim::new(1);
    let trace = Trace::default();
    let sem = Sem::<Q>::new(0, 2).unwrap();
    sim.start();
    for (name, prio) in [("lo", 3), ("hi", 7)] {
        let (sem, trace) = (sem.clone(), trace.clone());
        sim.spawn(0, name, prio, move |skd| {
            if sem.wait(&skd).is_ok() {
                trace.push(name);
            }
            0
        });
        sim.wait_idle(0);
    }
    sem.post().unwrap();
    sim.wait_idle(0);
    let first = trace.get();
    sem.post().unwrap();
    sim.wait_idle(0);
    assert_eq!(trace.get().len(), 2);
    first
}

#[test]
fn fifo_semaphore_wakes_in_arrival_order() {
    assert_eq!(first_woken::<PlWaitQueue>(), vec!["lo".to_string()]);
}

#[test]
fn priority_semaphore_wakes_highest_first() {
    assert_eq!(first_woken::<RtWaitQueue>(), vec!["hi".to_string()]);
}

#[test]
fn interrupted_wait_and_uninterruptible_wait() {
    let sim = Sim::new(1);
    let sem = PlSem::new(0, 1).unwrap();
    let intr_rc: Slot<KernelResult<()>> = Slot::new();
    let unintr_rc: Slot<KernelResult<()>> = Slot::new();
    let a = {
        let (sem, out) = (sem.clone(), intr_rc.clone());
        sim.spawn(0, "intr", 6, move |skd| {
            out.set(sem.wait(&skd));
            0
        })
    };
    let b = {
        let (sem, out) = (sem.clone(), unintr_rc.clone());
        sim.spawn(0, "unintr", 5, move |skd| {
            out.set(sem.wait_unintr(&skd));
            0
        })
    };
    sim.start();
    sim.wait_idle(0);
    assert_eq!(sem.waiters(), 2);

    a.intr().unwrap();
    sim.wait_idle(0);
    assert_eq!(intr_rc.get(), Some(Err(KernelError::Interrupted)));

    assert_eq!(b.intr(), Err(KernelError::Permission));
    assert!(b.state().contains(ThreadState::UNINTERRUPTED));
    sem.post().unwrap();
    sim.wait_idle(0);
    assert_eq!(unintr_rc.get(), Some(Ok(())));
}

static TIMER_SEM: OnceLock<Arc<PlSem>> = OnceLock::new();

fn post_timer_sem(_swt: &Arc<Swt>, _arg: usize) {
    if let Some(sem) = TIMER_SEM.get() {
        let _ = sem.post();
    }
}

#[test]
fn periodic_timer_drives_a_thread() {
    let sim = Sim::new(1);
    let sem = TIMER_SEM.get_or_init(|| PlSem::new(0, 8).unwrap()).clone();
    let stamps = Trace::default();
    {
        let stamps = stamps.clone();
        sim.spawn(0, "periodic", 5, move |skd| {
            for _ in 0..3 {
                if sem.wait(&skd).is_err() {
                    return 1;
                }
                stamps.push(skd.now().to_string());
            }
            0
        });
    }
    sim.start();
    let skd = sim.skd(0);
    let swt = Swt::new(SwtFlags::RESTART);
    swt.start(&skd, skd.now(), 4, post_timer_sem, 0).unwrap();
    sim.tick(0, 12);
    swt.stop().unwrap();
    assert_eq!(stamps.get(), vec!["4", "8", "12"]);
}
