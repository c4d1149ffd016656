use std::sync::Arc;
use std::thread;

use crate::cmd::{CtxArg, DbregArg, LoadArg, RegArg};
use crate::config::{Config, ReloadPolicy};
use crate::ctx::{CtxFlags, CtxState, MsgKind};
use crate::hw::sim::SimPmu;
use crate::hw::PmuHw;
use crate::intr::IrqOutcome;
use crate::pmu::{PmuModel, RegMask};
use crate::{Caller, ContextHandle, Error, Perfmon, Task, TaskKind};

pub(crate) struct Rig {
    pub pfm: Perfmon,
    pub sims: Vec<SimPmu>,
}

pub(crate) fn rig_with(nr_cpus: usize, config: Config) -> Rig {
    let model = PmuModel::generic();
    let sims = (0..nr_cpus).map(|_| SimPmu::new(&model)).collect::<Vec<_>>();
    let hws = sims
        .iter()
        .map(|sim| Box::new(sim.clone()) as Box<dyn PmuHw>)
        .collect();
    let pfm = Perfmon::new(model, hws, config).unwrap();
    Rig { pfm, sims }
}

pub(crate) fn rig(nr_cpus: usize) -> Rig {
    rig_with(nr_cpus, Config::default())
}

pub(crate) fn user(pfm: &Perfmon, pid: u32) -> Arc<Task> {
    pfm.register_task(Task::new(pid, 1000, TaskKind::User))
}

/// User-level counting PMC.
pub(crate) fn counting_pmc(i: usize, notify: bool) -> RegArg {
    let mut reg = RegArg::new(i, 0x8);
    reg.flags.notify = notify;
    reg
}

pub(crate) fn flags(f: impl FnOnce(&mut CtxFlags)) -> CtxArg {
    let mut arg = CtxArg::default();
    f(&mut arg.flags);
    arg
}

/// Self-monitoring context counting PMD4 from `value`.
pub(crate) fn self_monitored(pfm: &Perfmon, task: &Arc<Task>, notify: bool, value: u64) -> ContextHandle {
    let me = Caller::new(task, 0);
    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
    pfm.write_pmcs(me, &h, &mut [counting_pmc(4, notify)]).unwrap();
    let mut pmd = RegArg::new(4, value);
    pmd.short_reset = value;
    pmd.long_reset = value;
    pmd.eventid = 7;
    pfm.write_pmds(me, &h, &mut [pmd]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: task.pid() }).unwrap();
    pfm.start(me, &h).unwrap();
    h
}

fn read_pmd4(pfm: &Perfmon, caller: Caller<'_>, h: &ContextHandle) -> u64 {
    let mut reg = [RegArg::new(4, 0)];
    pfm.read_pmds(caller, h, &mut reg).unwrap();
    reg[0].value
}

#[test]
fn test_overflow_notifies_once_and_restart_resets() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);

    let h = self_monitored(&pfm, &task, true, -10i64 as u64);
    // Restart reloads the short reset value.
    let mut pmd = RegArg::new(4, -10i64 as u64);
    pmd.eventid = 7;
    pfm.write_pmds(me, &h, &mut [pmd]).unwrap();

    assert!(sims[0].count(4, 10));
    let IrqOutcome::Handled(summary) = pfm.interrupt(0) else {
        panic!("overflow not handled");
    };
    assert_eq!(summary.ovfl_pmds, RegMask::from_word(1 << 4));
    assert!(summary.notified && summary.masked && !summary.blocked);
    assert_eq!(h.state(), CtxState::Masked);

    let msg = h.read_msg(&task, true).unwrap();
    assert_eq!(msg.kind, MsgKind::Overflow);
    assert_eq!(msg.ctx, h.id());
    assert_eq!(msg.ovfl_pmds, RegMask::from_word(1 << 4));
    assert_eq!(msg.eventid, 7);
    assert_eq!(h.read_msg(&task, true), Err(Error::WouldBlock));

    // Masked: events are not counted.
    assert!(!sims[0].count(4, 3));
    assert_eq!(read_pmd4(&pfm, me, &h), 0);

    pfm.restart(me, &h).unwrap();
    assert_eq!(h.state(), CtxState::Loaded);
    assert_eq!(read_pmd4(&pfm, me, &h), 0);

    sims[0].count(4, 5);
    assert_eq!(read_pmd4(&pfm, me, &h), 5);
    pfm.close(me, h).unwrap();
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_second_system_session_on_cpu_is_busy() {
    let Rig { pfm, .. } = rig(1);
    let a = user(&pfm, 1);
    let b = user(&pfm, 2);
    let (ca, cb) = (Caller::new(&a, 0), Caller::new(&b, 0));
    let sys = flags(|f| f.system = true);

    let h1 = pfm.create_context(ca, &mut sys.clone()).unwrap();
    let h2 = pfm.create_context(cb, &mut sys.clone()).unwrap();

    pfm.load(ca, &h1, &LoadArg { load_pid: 1 }).unwrap();
    assert!(matches!(pfm.load(cb, &h2, &LoadArg { load_pid: 2 }), Err(Error::Busy(_))));
    assert_eq!(h2.state(), CtxState::Unloaded);
    assert!(!pfm.idle_fast_path());

    pfm.unload(ca, &h1).unwrap();
    assert!(pfm.idle_fast_path());

    pfm.load(cb, &h2, &LoadArg { load_pid: 2 }).unwrap();
    assert_eq!(pfm.cpu_owner(0).unwrap(), Some(h2.id()));
    assert_eq!(pfm.sessions().sys_owner, vec![Some(h2.id())]);

    pfm.close(ca, h1).unwrap();
    pfm.close(cb, h2).unwrap();
    assert_eq!(pfm.nr_contexts(), 0);
    assert_eq!(pfm.cpu_owner(0).unwrap(), None);
    assert!(pfm.idle_fast_path());
}

#[test]
fn test_close_of_remote_blocking_context_turns_zombie() {
    let Rig { pfm, .. } = rig(2);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);

    let h = pfm.create_context(me, &mut flags(|f| f.block = true)).unwrap();
    mon.set_stopped(true);
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();
    mon.set_stopped(false);
    pfm.switch_in(1, &mon);
    assert_eq!(pfm.cpu_owner(1).unwrap(), Some(h.id()));

    pfm.close(me, h).unwrap();

    let ctx = mon.context().unwrap();
    assert_eq!(ctx.state(), CtxState::Zombie);
    assert_eq!(pfm.nr_contexts(), 1);
    assert_eq!(pfm.sessions().task_sessions, 1);
    drop(ctx);

    pfm.switch_out(1, &mon);
    assert!(!mon.has_context());
    assert_eq!(pfm.nr_contexts(), 0);
    assert_eq!(pfm.sessions().task_sessions, 0);
    assert_eq!(pfm.cpu_owner(1).unwrap(), None);
}

#[test]
fn test_batch_stops_at_unimplemented_register() {
    let Rig { pfm, .. } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();

    let mut regs = [counting_pmc(4, false), counting_pmc(300, false), counting_pmc(5, false)];
    let ret = pfm.write_pmcs(me, &h, &mut regs);
    assert!(matches!(ret, Err(Error::InvalidArgument(_))));
    assert_eq!(
        regs.map(|r| r.flags.ret_invalid),
        [false, true, false]
    );

    let inner = h.ctx().lock();
    assert_eq!(inner.pmcs[4], 0x8 | 1 << 5);
    assert_eq!(inner.pmcs[5], 0);
    assert!(inner.used_pmds.test(4));
    assert!(!inner.used_pmds.test(5));
    drop(inner);

    pfm.close(me, h).unwrap();
}

#[test]
fn test_blocked_task_resumes_on_restart() {
    let Rig { pfm, sims } = rig(2);
    let pfm = Arc::new(pfm);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);

    let h = pfm.create_context(me, &mut flags(|f| f.block = true)).unwrap();
    mon.set_stopped(true);
    pfm.write_pmcs(me, &h, &mut [counting_pmc(4, true)]).unwrap();
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, u64::MAX)]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();
    pfm.start(me, &h).unwrap();
    mon.set_stopped(false);
    pfm.switch_in(1, &mon);

    assert!(sims[1].count(4, 1));
    let IrqOutcome::Handled(summary) = pfm.interrupt(1) else {
        panic!("overflow not handled");
    };
    assert!(summary.blocked);
    assert!(mon.work_pending());

    let worker = thread::spawn({
        let pfm = pfm.clone();
        let mon = mon.clone();
        move || pfm.handle_work(1, &mon)
    });
    while !h.ctx().restart_wq.has_waiters() {
        thread::yield_now();
    }
    // Other task, not stopped: the restart is handed over.
    pfm.restart(me, &h).unwrap();
    worker.join().unwrap().unwrap();
    assert_eq!(h.state(), CtxState::Loaded);

    mon.set_stopped(true);
    pfm.switch_out(1, &mon);
    assert_eq!(read_pmd4(&pfm, me, &h), 0);

    // Still blocking and not ours: the task frees it on exit.
    pfm.close(me, h).unwrap();
    assert_eq!(pfm.nr_contexts(), 1);
    pfm.exit_task(1, &mon);
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_close_wakes_blocked_task() {
    let Rig { pfm, sims } = rig(2);
    let pfm = Arc::new(pfm);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);

    let h = pfm.create_context(me, &mut flags(|f| f.block = true)).unwrap();
    mon.set_stopped(true);
    pfm.write_pmcs(me, &h, &mut [counting_pmc(4, true)]).unwrap();
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, u64::MAX)]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();
    pfm.start(me, &h).unwrap();
    mon.set_stopped(false);
    pfm.switch_in(1, &mon);

    assert!(sims[1].count(4, 1));
    assert!(matches!(pfm.interrupt(1), IrqOutcome::Handled(_)));

    let worker = thread::spawn({
        let pfm = pfm.clone();
        let mon = mon.clone();
        move || pfm.handle_work(1, &mon)
    });
    while !h.ctx().restart_wq.has_waiters() {
        thread::yield_now();
    }

    pfm.close(me, h).unwrap();
    worker.join().unwrap().unwrap();
    assert!(!mon.has_context());
    assert_eq!(pfm.nr_contexts(), 0);
    assert_eq!(pfm.sessions().task_sessions, 0);
}

#[test]
fn test_counter_is_monotonic_across_hardware_wraps() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let ovfl_val = pfm.model().ovfl_val;
    let h = self_monitored(&pfm, &task, false, 0);

    let mut last = 0;
    for _ in 0..3 {
        sims[0].count(4, ovfl_val);
        assert!(sims[0].count(4, 1));
        let IrqOutcome::Handled(summary) = pfm.interrupt(0) else {
            panic!("overflow not handled");
        };
        // Only the hardware part wrapped.
        assert!(summary.ovfl_pmds.is_empty());
        assert!(!summary.notified);

        let now = read_pmd4(&pfm, me, &h);
        assert!(now > last);
        last = now;
    }
    assert_eq!(last, 3 * (ovfl_val + 1));
    assert_eq!(h.state(), CtxState::Loaded);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_silent_overflow_reloads_long_reset() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = self_monitored(&pfm, &task, false, -2i64 as u64);

    assert!(sims[0].count(4, 2));
    let IrqOutcome::Handled(summary) = pfm.interrupt(0) else {
        panic!("overflow not handled");
    };
    assert_eq!(summary.ovfl_pmds, RegMask::from_word(1 << 4));
    assert!(!summary.notified && !summary.masked);
    assert!(!h.readable());

    // Reloaded with the long reset value, counting goes on.
    assert_eq!(read_pmd4(&pfm, me, &h), -2i64 as u64);
    sims[0].count(4, 1);
    assert_eq!(read_pmd4(&pfm, me, &h), u64::MAX);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_write_read_round_trip() {
    let Rig { pfm, .. } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();

    let values = [0, 1, 1 << 47, u64::MAX, 0x1234_5678_9abc_def0];
    for (round, loaded) in [false, true].into_iter().enumerate() {
        if loaded {
            pfm.load(me, &h, &LoadArg { load_pid: 100 }).unwrap();
        }
        for (i, v) in values.iter().enumerate() {
            let pmd = if i % 2 == 0 { 4 } else { 8 + round };
            pfm.write_pmds(me, &h, &mut [RegArg::new(pmd, *v)]).unwrap();
            let mut reg = [RegArg::new(pmd, 0)];
            pfm.read_pmds(me, &h, &mut reg).unwrap();
            assert_eq!(reg[0].value, *v);
            assert_eq!(reg[0].last_reset_val, *v);
        }
    }
    pfm.close(me, h).unwrap();
}

#[test]
fn test_unused_pmd_is_not_readable() {
    let Rig { pfm, .. } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();

    let mut reg = [RegArg::new(5, 0)];
    assert!(matches!(pfm.read_pmds(me, &h, &mut reg), Err(Error::InvalidArgument(_))));
    assert!(reg[0].flags.ret_invalid);

    // Programming PMC5 makes its counter readable.
    pfm.write_pmcs(me, &h, &mut [counting_pmc(5, false)]).unwrap();
    pfm.read_pmds(me, &h, &mut reg).unwrap();
    assert_eq!(reg[0].value, 0);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_disallowed_commands_leave_state_alone() {
    let Rig { pfm, .. } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();

    assert!(matches!(pfm.start(me, &h), Err(Error::InvalidArgument(_))));
    assert!(matches!(pfm.restart(me, &h), Err(Error::InvalidArgument(_))));
    pfm.unload(me, &h).unwrap();
    assert_eq!(h.state(), CtxState::Unloaded);

    pfm.load(me, &h, &LoadArg { load_pid: 100 }).unwrap();
    assert!(matches!(pfm.load(me, &h, &LoadArg { load_pid: 100 }), Err(Error::Busy(_))));
    assert!(matches!(pfm.restart(me, &h), Err(Error::Busy(_))));
    assert_eq!(h.state(), CtxState::Loaded);
    assert_eq!(pfm.sessions().task_sessions, 1);

    pfm.close(me, h).unwrap();
    assert_eq!(pfm.sessions().task_sessions, 0);
}

#[test]
fn test_load_checks() {
    let Rig { pfm, .. } = rig(1);
    let task = user(&pfm, 100);
    let other_user = pfm.register_task(Task::new(200, 2000, TaskKind::User));
    let kthread = pfm.register_task(Task::new(300, 0, TaskKind::Kernel));
    let me = Caller::new(&task, 0);

    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
    other_user.set_stopped(true);
    assert!(matches!(
        pfm.load(me, &h, &LoadArg { load_pid: 200 }),
        Err(Error::PermissionDenied(_))
    ));
    assert!(matches!(
        pfm.load(me, &h, &LoadArg { load_pid: 300 }),
        Err(Error::PermissionDenied(_))
    ));
    assert_eq!(pfm.load(me, &h, &LoadArg { load_pid: 999 }), Err(Error::NoSuchProcess(999)));

    // Attaching to a running task needs it stopped.
    let sibling = user(&pfm, 101);
    assert!(matches!(pfm.load(me, &h, &LoadArg { load_pid: 101 }), Err(Error::Busy(_))));
    assert_eq!(pfm.sessions().task_sessions, 0);
    drop((kthread, sibling));

    let blocking = pfm.create_context(me, &mut flags(|f| f.block = true)).unwrap();
    assert!(matches!(
        pfm.load(me, &blocking, &LoadArg { load_pid: 100 }),
        Err(Error::InvalidArgument(_))
    ));

    // A privileged controller may attach across users.
    let root = pfm.register_task(Task::new(1, 0, TaskKind::User).with_ptrace_cap());
    let root_caller = Caller::new(&root, 0);
    pfm.load(root_caller, &h, &LoadArg { load_pid: 200 }).unwrap();
    assert!(other_user.has_context());

    pfm.close(root_caller, h).unwrap();
    pfm.close(me, blocking).unwrap();
    assert!(!other_user.has_context());
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_system_wide_needs_its_cpu() {
    let Rig { pfm, .. } = rig(2);
    let task = user(&pfm, 100);
    let on_cpu0 = Caller::new(&task, 0);
    let on_cpu1 = Caller::new(&task, 1);

    let h = pfm.create_context(on_cpu0, &mut flags(|f| f.system = true)).unwrap();
    assert!(matches!(
        pfm.load(on_cpu0, &h, &LoadArg { load_pid: 7 }),
        Err(Error::InvalidArgument(_))
    ));
    pfm.load(on_cpu0, &h, &LoadArg { load_pid: 100 }).unwrap();

    let mut pmc = RegArg::new(4, 0x8 | 1 << 6);
    assert!(matches!(pfm.write_pmcs(on_cpu1, &h, &mut [pmc]), Err(Error::Busy(_))));
    pfm.write_pmcs(on_cpu0, &h, &mut [pmc]).unwrap();

    // The privilege bit must match the session scope.
    pmc.value = 0x8;
    assert!(matches!(pfm.write_pmcs(on_cpu0, &h, &mut [pmc]), Err(Error::InvalidArgument(_))));

    // A per-task session cannot start while a system-wide one runs.
    let other = pfm.create_context(on_cpu0, &mut CtxArg::default()).unwrap();
    assert!(matches!(
        pfm.load(on_cpu0, &other, &LoadArg { load_pid: 100 }),
        Err(Error::Busy(_))
    ));

    pfm.close(on_cpu1, h).unwrap();
    pfm.close(on_cpu0, other).unwrap();
    assert_eq!(pfm.sessions().sys_sessions, 0);
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_message_queue_overrun_is_counted() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = self_monitored(&pfm, &task, true, u64::MAX);

    for round in 0..=crate::ctx::PFM_MAX_MSGS {
        assert!(sims[0].count(4, 1));
        let IrqOutcome::Handled(summary) = pfm.interrupt(0) else {
            panic!("overflow not handled");
        };
        assert!(summary.notified);
        assert_eq!(summary.msg_dropped, round == crate::ctx::PFM_MAX_MSGS);
        pfm.restart(me, &h).unwrap();
    }
    assert_eq!(pfm.stats(0).unwrap().msgs_dropped, 1);
    assert_eq!(h.pending_msgs(), crate::ctx::PFM_MAX_MSGS);

    let mut last = 0;
    while let Ok(msg) = h.read_msg(&task, true) {
        assert_eq!(msg.kind, MsgKind::Overflow);
        assert!(msg.tstamp >= last);
        last = msg.tstamp;
    }
    assert!(!h.readable());
    pfm.close(me, h).unwrap();
}

#[test]
fn test_debug_registers_exclude_ptrace() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = self_monitored(&pfm, &task, false, 0);

    pfm.ptrace_claim_dbregs(&task).unwrap();
    let mut ibrs = [DbregArg::new(0, u64::MAX), DbregArg::new(1, u64::MAX)];
    assert!(matches!(pfm.write_ibrs(me, &h, &mut ibrs), Err(Error::Busy(_))));
    assert_eq!(pfm.sessions().task_dbreg_users, 0);
    pfm.ptrace_release_dbregs(&task);

    pfm.write_ibrs(me, &h, &mut ibrs).unwrap();
    assert_eq!(sims[0].ibr(0), u64::MAX);
    assert_eq!(sims[0].ibr(1), u64::MAX >> 1);
    pfm.write_dbrs(me, &h, &mut [DbregArg::new(3, u64::MAX)]).unwrap();
    assert_eq!(sims[0].dbr(3), u64::MAX >> 2);
    assert!(matches!(
        pfm.write_dbrs(me, &h, &mut [DbregArg::new(8, 0)]),
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(pfm.ptrace_claim_dbregs(&task), Err(Error::Busy(_))));
    let s = pfm.sessions();
    assert_eq!((s.task_dbreg_users, s.ptrace_dbreg_users), (1, 0));

    pfm.unload(me, &h).unwrap();
    assert_eq!(pfm.sessions().task_dbreg_users, 0);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_switch_reloads_after_foreign_install() {
    let Rig { pfm, sims } = rig(1);
    let ctl = user(&pfm, 1);
    let a = user(&pfm, 2);
    let b = user(&pfm, 3);
    let me = Caller::new(&ctl, 0);

    let mut handles = Vec::new();
    for (task, start) in [(&a, 100), (&b, 5000)] {
        let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
        task.set_stopped(true);
        pfm.write_pmcs(me, &h, &mut [counting_pmc(4, false)]).unwrap();
        pfm.write_pmds(me, &h, &mut [RegArg::new(4, start)]).unwrap();
        pfm.load(me, &h, &LoadArg { load_pid: task.pid() }).unwrap();
        pfm.start(me, &h).unwrap();
        handles.push(h);
    }

    pfm.switch_in(0, &a);
    sims[0].count(4, 10);
    pfm.switch_out(0, &a);

    pfm.switch_in(0, &b);
    sims[0].count(4, 1);
    assert_eq!(sims[0].read_pmd(4), 5001);
    pfm.switch_out(0, &b);

    // B was installed in between: A gets its own registers back.
    pfm.switch_in(0, &a);
    assert_eq!(sims[0].read_pmd(4), 110);
    assert!(sims[0].monitoring());
    pfm.switch_out(0, &a);

    assert_eq!(read_pmd4(&pfm, me, &handles[0]), 110);
    assert_eq!(read_pmd4(&pfm, me, &handles[1]), 5001);
    for h in handles {
        pfm.close(me, h).unwrap();
    }
}

#[test]
fn test_lazy_switch_applies_pending_writes() {
    let Rig { pfm, sims } = rig(1);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);

    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
    mon.set_stopped(true);
    pfm.write_pmcs(me, &h, &mut [counting_pmc(4, false)]).unwrap();
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, 0), RegArg::new(5, 0)]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();

    pfm.switch_in(0, &mon);
    pfm.switch_out(0, &mon);
    let activation = pfm.activation(0).unwrap();

    // Scribble on an unused-by-the-write register: a lazy reload keeps it.
    let mut raw = sims[0].clone();
    raw.write_pmd(5, 77);
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, 42)]).unwrap();

    pfm.switch_in(0, &mon);
    assert_eq!(pfm.activation(0).unwrap(), activation + 1);
    assert_eq!(sims[0].read_pmd(4), 42);
    assert_eq!(sims[0].read_pmd(5), 77);
    pfm.switch_out(0, &mon);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_eager_switch_reloads_everything() {
    let config = Config {
        reload: ReloadPolicy::Eager,
        ..Default::default()
    };
    let Rig { pfm, sims } = rig_with(1, config);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);

    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
    mon.set_stopped(true);
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, 0), RegArg::new(5, 0)]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();

    pfm.switch_in(0, &mon);
    pfm.switch_out(0, &mon);
    let mut raw = sims[0].clone();
    raw.write_pmd(5, 77);

    pfm.switch_in(0, &mon);
    assert_eq!(sims[0].read_pmd(5), 0);
    pfm.switch_out(0, &mon);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_uniprocessor_keeps_owner() {
    let config = Config {
        uniprocessor: true,
        ..Default::default()
    };
    let Rig { pfm, sims } = rig_with(1, config);
    let ctl = user(&pfm, 1);
    let a = user(&pfm, 2);
    let b = user(&pfm, 3);
    let me = Caller::new(&ctl, 0);

    let mut handles = Vec::new();
    for (task, start) in [(&a, 100), (&b, 5000)] {
        let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
        task.set_stopped(true);
        pfm.write_pmcs(me, &h, &mut [counting_pmc(4, false)]).unwrap();
        pfm.write_pmds(me, &h, &mut [RegArg::new(4, start)]).unwrap();
        pfm.load(me, &h, &LoadArg { load_pid: task.pid() }).unwrap();
        pfm.start(me, &h).unwrap();
        handles.push(h);
    }

    pfm.switch_in(0, &a);
    sims[0].count(4, 10);
    pfm.switch_out(0, &a);
    assert_eq!(pfm.cpu_owner(0).unwrap(), Some(handles[0].id()));
    assert!(!sims[0].monitoring());

    // Still the owner: reads go to the hardware.
    assert_eq!(read_pmd4(&pfm, me, &handles[0]), 110);
    pfm.switch_in(0, &a);
    assert!(sims[0].monitoring());
    pfm.switch_out(0, &a);

    pfm.switch_in(0, &b);
    assert_eq!(pfm.cpu_owner(0).unwrap(), Some(handles[1].id()));
    pfm.switch_out(0, &b);

    pfm.switch_in(0, &a);
    assert_eq!(sims[0].read_pmd(4), 110);
    pfm.switch_out(0, &a);

    for h in handles {
        pfm.close(me, h).unwrap();
    }
    assert_eq!(pfm.cpu_owner(0).unwrap(), None);
}

#[test]
fn test_pending_overflow_follows_task() {
    let Rig { pfm, sims } = rig(2);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);

    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
    mon.set_stopped(true);
    pfm.write_pmcs(me, &h, &mut [counting_pmc(4, true)]).unwrap();
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, u64::MAX)]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();
    pfm.start(me, &h).unwrap();

    pfm.switch_in(0, &mon);
    assert!(sims[0].count(4, 1));
    // Switched out before the interrupt got delivered.
    pfm.switch_out(0, &mon);
    assert_eq!(pfm.interrupt(0), IrqOutcome::Spurious);

    pfm.switch_in(1, &mon);
    assert!(sims[1].interrupt_pending());
    let IrqOutcome::Handled(summary) = pfm.interrupt(1) else {
        panic!("overflow not replayed");
    };
    assert!(summary.notified);
    assert_eq!(h.pending_msgs(), 1);
    assert_eq!(pfm.stats(0).unwrap().spurious_intr_count, 1);

    pfm.switch_out(1, &mon);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_contended_interrupt_is_replayed() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = self_monitored(&pfm, &task, true, u64::MAX);

    assert!(sims[0].count(4, 1));
    let guard = h.ctx().lock();
    assert_eq!(pfm.interrupt(0), IrqOutcome::Replay);
    drop(guard);
    assert!(sims[0].interrupt_pending());

    assert!(matches!(pfm.interrupt(0), IrqOutcome::Handled(_)));
    assert_eq!(pfm.interrupt(0), IrqOutcome::Spurious);

    let stats = pfm.stats(0).unwrap();
    assert_eq!(
        (stats.ovfl_intr_count, stats.replay_intr_count, stats.spurious_intr_count),
        (1, 1, 1)
    );
    pfm.close(me, h).unwrap();
}

#[test]
fn test_interrupt_without_owner_is_spurious() {
    let Rig { pfm, sims } = rig(1);
    let mut raw = sims[0].clone();
    raw.write_pmc(0, 1 << 4 | 1);

    assert_eq!(pfm.interrupt(0), IrqOutcome::Spurious);
    assert_eq!(pfm.interrupt(5), IrqOutcome::Spurious);
    assert!(!sims[0].interrupt_pending());
    assert_eq!(pfm.stats(0).unwrap().spurious_intr_count, 1);
}

#[test]
fn test_exclude_idle() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let idle = pfm.register_task(Task::new(0, 0, TaskKind::Idle));
    let me = Caller::new(&task, 0);

    let h = pfm
        .create_context(me, &mut flags(|f| {
            f.system = true;
            f.excl_idle = true;
        }))
        .unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 100 }).unwrap();
    pfm.start(me, &h).unwrap();
    assert!(sims[0].monitoring());

    pfm.switch_in(0, &idle);
    assert!(!sims[0].monitoring());
    pfm.switch_in(0, &task);
    assert!(sims[0].monitoring());

    pfm.stop(me, &h).unwrap();
    pfm.switch_in(0, &idle);
    pfm.switch_in(0, &task);
    assert!(!sims[0].monitoring());
    pfm.close(me, h).unwrap();

    assert!(matches!(
        pfm.create_context(me, &mut flags(|f| f.excl_idle = true)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_task_exit_sends_end_message() {
    let Rig { pfm, .. } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = self_monitored(&pfm, &task, false, 0);

    pfm.exit_task(0, &task);
    assert_eq!(h.state(), CtxState::Unloaded);
    assert!(!task.has_context());
    assert_eq!(pfm.sessions().task_sessions, 0);
    assert_eq!(pfm.cpu_owner(0).unwrap(), None);

    let msg = h.read_msg(&task, true).unwrap();
    assert_eq!(msg.kind, MsgKind::End);
    assert_eq!(msg.ovfl_pmds, RegMask::EMPTY);

    pfm.close(me, h).unwrap();
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_read_interface() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = self_monitored(&pfm, &task, true, u64::MAX);
    let mut rx = h.fasync();

    let mut small = [0; 8];
    assert!(matches!(h.read(&task, &mut small, true), Err(Error::InvalidArgument(_))));
    let mut buf = [0; 64];
    assert_eq!(h.read(&task, &mut buf, true), Err(Error::WouldBlock));

    assert!(sims[0].count(4, 1));
    assert!(matches!(pfm.interrupt(0), IrqOutcome::Handled(_)));
    assert!(h.readable());
    assert_eq!(tokio_test::block_on(futures::StreamExt::next(&mut rx)), Some(h.id()));

    assert_eq!(h.read(&task, &mut buf, false), Ok(crate::ctx::MSG_SIZE));
    let msg = crate::ctx::Message::from_bytes(&buf).unwrap();
    assert_eq!((msg.kind, msg.ctx), (MsgKind::Overflow, h.id()));

    // A pending signal interrupts a blocking read.
    task.raise_signal();
    assert_eq!(h.read_msg(&task, false), Err(Error::Interrupted));
    task.clear_signal();

    pfm.restart(me, &h).unwrap();
    assert!(sims[0].count(4, 1));
    assert!(matches!(pfm.interrupt(0), IrqOutcome::Handled(_)));
    let msg = tokio_test::block_on(h.next_msg(&task)).unwrap();
    assert_eq!(msg.kind, MsgKind::Overflow);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_blocked_reader_woken_by_overflow() {
    let Rig { pfm, sims } = rig(1);
    let pfm = Arc::new(pfm);
    let task = user(&pfm, 100);
    let h = Arc::new(self_monitored(&pfm, &task, true, u64::MAX));

    let reader = thread::spawn({
        let h = h.clone();
        let task = task.clone();
        move || h.read_msg(&task, false)
    });
    while !h.ctx().msg_wq.has_waiters() {
        thread::yield_now();
    }

    assert!(sims[0].count(4, 1));
    assert!(matches!(pfm.interrupt(0), IrqOutcome::Handled(_)));
    let msg = reader.join().unwrap().unwrap();
    assert_eq!(msg.ovfl_pmds, RegMask::from_word(1 << 4));

    let Ok(h) = Arc::try_unwrap(h) else {
        panic!("handle still shared");
    };
    pfm.close(Caller::new(&task, 0), h).unwrap();
}

#[test]
fn test_rejected_dbreg_batch_changes_nothing() {
    let Rig { pfm, .. } = rig(1);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);
    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();

    pfm.ptrace_claim_dbregs(&mon).unwrap();
    let mut ibrs = [DbregArg::new(99, 1)];
    assert!(matches!(pfm.write_ibrs(me, &h, &mut ibrs), Err(Error::InvalidArgument(_))));
    assert!(ibrs[0].flags.ret_invalid);
    assert!(!h.ctx().lock().using_dbreg);

    // Nothing to claim, so ptrace does not get in the way.
    mon.set_stopped(true);
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();
    assert_eq!(pfm.sessions().task_dbreg_users, 0);
    pfm.ptrace_release_dbregs(&mon);

    // Loaded: the claim taken for the batch is given back.
    let mut dbrs = [DbregArg::new(99, 1), DbregArg::new(0, 1)];
    assert!(matches!(pfm.write_dbrs(me, &h, &mut dbrs), Err(Error::InvalidArgument(_))));
    assert_eq!(dbrs.map(|r| r.flags.ret_invalid), [true, false]);
    assert!(!h.ctx().lock().using_dbreg);
    assert_eq!(pfm.sessions().task_dbreg_users, 0);
    pfm.ptrace_claim_dbregs(&mon).unwrap();
    pfm.ptrace_release_dbregs(&mon);

    pfm.close(me, h).unwrap();
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_remote_restart_waits_for_task() {
    let Rig { pfm, sims } = rig(2);
    let ctl = user(&pfm, 1);
    let mon = user(&pfm, 2);
    let me = Caller::new(&ctl, 0);

    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();
    mon.set_stopped(true);
    pfm.write_pmcs(me, &h, &mut [counting_pmc(4, true)]).unwrap();
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, u64::MAX)]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 2 }).unwrap();
    pfm.start(me, &h).unwrap();
    mon.set_stopped(false);
    pfm.switch_in(1, &mon);

    assert!(sims[1].count(4, 1));
    let IrqOutcome::Handled(summary) = pfm.interrupt(1) else {
        panic!("overflow not handled");
    };
    assert!(summary.masked && !summary.blocked);

    // Reads need the task stopped, restart does not.
    let mut reg = [RegArg::new(4, 0)];
    assert!(matches!(pfm.read_pmds(me, &h, &mut reg), Err(Error::Busy(_))));
    pfm.restart(me, &h).unwrap();
    assert_eq!(h.state(), CtxState::Masked);
    assert!(mon.work_pending());

    pfm.handle_work(1, &mon).unwrap();
    assert_eq!(h.state(), CtxState::Loaded);
    assert!(!mon.work_pending());

    let on_cpu = Caller::new(&mon, 1);
    sims[1].count(4, 3);
    assert_eq!(read_pmd4(&pfm, on_cpu, &h), 3);

    pfm.switch_out(1, &mon);
    pfm.close(me, h).unwrap();
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_overflow_resets_dependent_counters() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = pfm.create_context(me, &mut CtxArg::default()).unwrap();

    let mut pmc4 = counting_pmc(4, false);
    pmc4.reset_pmds = RegMask::from_word(1 << 5);
    pfm.write_pmcs(me, &h, &mut [pmc4, counting_pmc(5, false)]).unwrap();
    let mut pmd4 = RegArg::new(4, -2i64 as u64);
    pmd4.long_reset = 100;
    let mut pmd5 = RegArg::new(5, 40);
    pmd5.long_reset = 7;
    pfm.write_pmds(me, &h, &mut [pmd4, pmd5]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 100 }).unwrap();
    pfm.start(me, &h).unwrap();

    assert!(sims[0].count(4, 2));
    let IrqOutcome::Handled(summary) = pfm.interrupt(0) else {
        panic!("overflow not handled");
    };
    assert_eq!(summary.ovfl_pmds, RegMask::from_word(1 << 4));
    assert!(!summary.notified);

    let mut regs = [RegArg::new(4, 0), RegArg::new(5, 0)];
    pfm.read_pmds(me, &h, &mut regs).unwrap();
    assert_eq!(regs.map(|r| r.value), [100, 7]);
    pfm.close(me, h).unwrap();
}

#[test]
fn test_no_msg_notifies_without_queueing() {
    let Rig { pfm, sims } = rig(1);
    let task = user(&pfm, 100);
    let me = Caller::new(&task, 0);
    let h = pfm.create_context(me, &mut flags(|f| f.no_msg = true)).unwrap();

    pfm.write_pmcs(me, &h, &mut [counting_pmc(4, true)]).unwrap();
    pfm.write_pmds(me, &h, &mut [RegArg::new(4, u64::MAX)]).unwrap();
    pfm.load(me, &h, &LoadArg { load_pid: 100 }).unwrap();
    pfm.start(me, &h).unwrap();

    assert!(sims[0].count(4, 1));
    let IrqOutcome::Handled(summary) = pfm.interrupt(0) else {
        panic!("overflow not handled");
    };
    assert!(summary.notified && summary.masked && !summary.msg_dropped);
    assert!(!h.readable());
    assert_eq!(h.pending_msgs(), 0);
    assert_eq!(pfm.stats(0).unwrap().msgs_dropped, 0);

    pfm.restart(me, &h).unwrap();
    assert_eq!(h.state(), CtxState::Loaded);

    // No End message on exit either.
    pfm.exit_task(0, &task);
    assert!(!h.readable());
    pfm.close(me, h).unwrap();
    assert_eq!(pfm.nr_contexts(), 0);
}

#[test]
fn test_close_on_unknown_cpu_drops_handle() {
    let Rig { pfm, .. } = rig(1);
    let task = user(&pfm, 100);
    let h = pfm.create_context(Caller::new(&task, 0), &mut CtxArg::default()).unwrap();
    assert_eq!(pfm.nr_contexts(), 1);

    assert!(matches!(
        pfm.close(Caller::new(&task, 9), h),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(pfm.nr_contexts(), 0);
}
