pub mod cron;
pub mod dashboard;
pub mod error;
pub mod executions;
pub mod extract;
pub mod health;
pub mod schedules;
