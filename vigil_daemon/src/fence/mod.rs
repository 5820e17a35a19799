//! STONITH: deciding when to power a peer off and doing it through a
//! pluggable driver, with a persisted history and safety gates.

pub mod coordinator;
pub mod driver;
pub mod history;
pub mod http_template;
pub mod hypervisor;

pub use coordinator::{FenceCoordinator, GateContext};
pub use driver::{DriverError, PowerState, StonithDriver, build_driver};
pub use history::FenceHistory;
