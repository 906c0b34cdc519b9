//! The three concrete [`Coordinator`](codehub_core::coordinator::Coordinator)
//! implementations `main.rs` spawns, each on its own dedicated `PgConnection`
//! (spec §9 / ADR-012).

pub mod observer;
pub mod scheduler;
pub mod wc;

pub use observer::ObserverCoordinator;
pub use scheduler::SchedulerCoordinator;
pub use wc::WcCoordinator;
