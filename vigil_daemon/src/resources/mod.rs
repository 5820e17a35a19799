//! Resource activation: VIPs and ordered systemd services, constrained by
//! `order`/`colocation` declarations.

pub mod activator;
pub mod order;
pub mod service;
pub mod vip;

pub use activator::{ActivationReport, ResourceActivator};
pub use service::SystemdManager;
pub use vip::VipManager;
