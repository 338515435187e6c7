//! Firing and running schedules.
//!
//! The [`TimeWheel`](wheel::TimeWheel) holds the next firing of every active
//! schedule and hands due firings to the [`Dispatcher`](dispatcher::Dispatcher),
//! whose workers apply the overlap policy, call the target, persist the
//! outcome and schedule retries. [`RecoveryLoops`](recovery::RecoveryLoops)
//! re-feed firings and retries the live path missed.

pub mod dispatcher;
pub mod error;
pub mod invoker;
pub mod notify;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod wheel;

pub use dispatcher::{Dispatcher, DispatcherDeps, PendingExecution};
pub use error::{Result, SchedulerError};
pub use invoker::{HttpInvoker, ResolvedTarget, TargetInvoker};
pub use notify::{build_notifier, WebhookNotifier};
pub use recovery::RecoveryLoops;
pub use scheduler::Scheduler;
pub use wheel::{FireSink, TimeWheel};
