//! Performance-monitoring context manager.
//!
//! Virtualizes the registers of a CPU's performance-monitoring unit (PMU)
//! across monitoring sessions: per-task contexts follow their task across
//! context switches, system-wide contexts stay on one CPU. Counter
//! overflows are folded into 64-bit software counters and reported
//! through a bounded message queue.
//!
//! ## Example
//!
//! Count user-level events of the current task on an emulated PMU.
//!
//! ```rust
//! use perfmon::cmd::{CtxArg, LoadArg, RegArg};
//! use perfmon::config::Config;
//! use perfmon::hw::sim::SimPmu;
//! use perfmon::hw::PmuHw;
//! use perfmon::pmu::PmuModel;
//! use perfmon::{Caller, Perfmon, Task, TaskKind};
//!
//! let model = PmuModel::generic();
//! let sim = SimPmu::new(&model);
//! let hws = vec![Box::new(sim.clone()) as Box<dyn PmuHw>];
//! let pfm = Perfmon::new(model, hws, Config::default()).unwrap();
//!
//! let task = pfm.register_task(Task::new(100, 1000, TaskKind::User));
//! let me = Caller::new(&task, 0);
//!
//! let ctx = pfm.create_context(me, &mut CtxArg::default()).unwrap();
//! pfm.write_pmcs(me, &ctx, &mut [RegArg::new(4, 0x8)]).unwrap(); // PMC4 counts at user level.
//! pfm.write_pmds(me, &ctx, &mut [RegArg::new(4, 0)]).unwrap();
//! pfm.load(me, &ctx, &LoadArg { load_pid: 100 }).unwrap();
//!
//! pfm.start(me, &ctx).unwrap();
//! sim.count(4, 1000); // The hardware sees 1000 events.
//! pfm.stop(me, &ctx).unwrap();
//!
//! let mut pmd = [RegArg::new(4, 0)];
//! pfm.read_pmds(me, &ctx, &mut pmd).unwrap();
//! assert_eq!(pmd[0].value, 1000);
//!
//! pfm.close(me, ctx).unwrap();
//! ```
//!
//! ## Locking
//!
//! Locks nest as: CPU slot, then session registry or context, then task.
//! The registry is never entered with a context locked. The overflow
//! interrupt only ever try-locks a context.

pub mod cmd;
pub mod config;
pub mod ctx;
pub mod error;
pub mod fmt;
pub mod hw;
pub mod intr;
mod manager;
pub mod pmu;
pub mod registry;
mod switch;
pub mod sync;
pub mod task;
#[cfg(test)]
mod test;

pub use ctx::ContextHandle;
pub use error::{Error, Result};
pub use manager::{PerCpuState, Perfmon};
pub use task::{Caller, Task, TaskKind};

/// Debug registers per bank the context can shadow.
pub const MAX_DBREGS: usize = 8;
