//! Applies and retracts the declared resource set in constraint order.
//!
//! Activation always attempts every resource and collects errors rather
//! than stopping at the first failure; the caller decides whether a
//! partial activation warrants demotion.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use super::order::{OrderEdge, start_order, stop_order};
use super::service::SystemdManager;
use super::vip::VipManager;
use crate::config::{ConstraintConfig, ServiceConfig, Vip};

#[derive(Clone, Debug, Default)]
pub struct ActivationReport {
    pub success: bool,
    pub errors: Vec<String>,
}

enum Resource<'a> {
    Vip(&'a Vip),
    Service(&'a ServiceConfig),
}

pub struct ResourceActivator {
    vips: Vec<Vip>,
    services: Vec<ServiceConfig>,
    order_edges: Vec<OrderEdge>,
    vip_manager: Arc<VipManager>,
    systemd: Arc<SystemdManager>,
}

impl ResourceActivator {
    pub fn new(
        vips: Vec<Vip>,
        services: Vec<ServiceConfig>,
        constraints: &[ConstraintConfig],
        vip_manager: Arc<VipManager>,
        systemd: Arc<SystemdManager>,
    ) -> Self {
        let order_edges = constraints
            .iter()
            .filter_map(|constraint| match constraint {
                ConstraintConfig::Order { first, then } => {
                    Some((first.clone(), then.clone()))
                }
                ConstraintConfig::Colocation { .. } => None,
            })
            .collect();
        Self {
            vips,
            services,
            order_edges,
            vip_manager,
            systemd,
        }
    }

    pub fn vips(&self) -> &[Vip] {
        &self.vips
    }

    pub fn services(&self) -> &[ServiceConfig] {
        &self.services
    }

    fn declared_names(&self) -> Vec<String> {
        self.vips
            .iter()
            .map(|v| v.name.clone())
            .chain(self.services.iter().map(|s| s.name.clone()))
            .collect()
    }

    fn by_name(&self) -> HashMap<&str, Resource<'_>> {
        let mut map = HashMap::new();
        for vip in &self.vips {
            map.insert(vip.name.as_str(), Resource::Vip(vip));
        }
        for service in &self.services {
            map.insert(service.name.as_str(), Resource::Service(service));
        }
        map
    }

    /// Bring every declared resource up, in topological start order.
    pub async fn activate_all(&self) -> ActivationReport {
        let names = self.declared_names();
        let order = start_order(&names, &self.order_edges);
        let resources = self.by_name();
        let mut errors = Vec::new();
        for name in &order {
            match resources.get(name.as_str()) {
                Some(Resource::Vip(vip)) => {
                    if let Err(e) = self.vip_manager.activate(vip).await {
                        error!(resource = %name, error = %e, "vip activation failed");
                        errors.push(format!("{name}: {e}"));
                    } else {
                        info!(resource = %name, "vip active");
                    }
                }
                Some(Resource::Service(service)) => {
                    if let Err(e) = self.systemd.start(&service.unit).await {
                        error!(resource = %name, error = %e, "service start failed");
                        errors.push(format!("{name}: {e}"));
                    } else {
                        info!(resource = %name, unit = %service.unit, "service started");
                    }
                }
                None => {}
            }
        }
        ActivationReport {
            success: errors.is_empty(),
            errors,
        }
    }

    /// Take every declared resource down, in reverse start order.
    pub async fn deactivate_all(&self) -> ActivationReport {
        let names = self.declared_names();
        let order = stop_order(&names, &self.order_edges);
        let resources = self.by_name();
        let mut errors = Vec::new();
        for name in &order {
            match resources.get(name.as_str()) {
                Some(Resource::Vip(vip)) => {
                    if let Err(e) = self.vip_manager.deactivate(vip).await {
                        error!(resource = %name, error = %e, "vip deactivation failed");
                        errors.push(format!("{name}: {e}"));
                    }
                }
                Some(Resource::Service(service)) => {
                    if let Err(e) = self.systemd.stop(&service.unit).await {
                        error!(resource = %name, error = %e, "service stop failed");
                        errors.push(format!("{name}: {e}"));
                    }
                }
                None => {}
            }
        }
        ActivationReport {
            success: errors.is_empty(),
            errors,
        }
    }

    /// Restart one managed service, used by health recovery.
    pub async fn restart_service(&self, name: &str) -> Result<(), String> {
        let service = self
            .services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| format!("unknown service {name:?}"))?;
        self.systemd
            .restart(&service.unit)
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::command::testing::FakeRunner;

    fn service(name: &str, unit: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            unit: unit.to_string(),
            healthcheck: None,
        }
    }

    fn activator(runner: Arc<FakeRunner>, constraints: &[ConstraintConfig]) -> ResourceActivator {
        let runner: Arc<dyn CommandRunner> = runner;
        ResourceActivator::new(
            vec![Vip {
                name: "vip-web".to_string(),
                ip: "192.168.1.250".to_string(),
                cidr: 24,
                interface: "eth0".to_string(),
            }],
            vec![service("web", "nginx.service"), service("db", "postgresql.service")],
            constraints,
            Arc::new(VipManager::new(Arc::clone(&runner))),
            Arc::new(SystemdManager::new(runner)),
        )
    }

    #[tokio::test]
    async fn activation_respects_order_constraints() {
        let runner = Arc::new(FakeRunner::new());
        let constraints = vec![
            ConstraintConfig::Order {
                first: "db".to_string(),
                then: "web".to_string(),
            },
            ConstraintConfig::Order {
                first: "web".to_string(),
                then: "vip-web".to_string(),
            },
        ];
        // Start order is [db, web, vip-web]; the two service starts are
        // unscripted (default ok), then the VIP's show (absent), add, and
        // show (must now report present) calls.
        runner.push_ok("");
        runner.push_ok("");
        runner.push_ok("");
        runner.push_ok("");
        runner.push_ok("2: eth0 inet 192.168.1.250/24 scope global eth0\n");
        let activator = activator(Arc::clone(&runner), &constraints);
        let report = activator.activate_all().await;
        assert!(report.success, "{:?}", report.errors);

        let calls = runner.recorded();
        let db = calls.iter().position(|c| c.contains("start postgresql")).unwrap();
        let web = calls.iter().position(|c| c.contains("start nginx")).unwrap();
        let vip = calls.iter().position(|c| c.contains("addr add")).unwrap();
        assert!(db < web && web < vip, "calls: {calls:?}");
    }

    #[tokio::test]
    async fn deactivation_runs_in_reverse() {
        let runner = Arc::new(FakeRunner::new());
        let constraints = vec![ConstraintConfig::Order {
            first: "db".to_string(),
            then: "web".to_string(),
        }];
        // Declaration order is vip-web, web, db with db before web, so the
        // start order is [vip-web, db, web] and stops run reversed. The
        // two service stops come first; the third call is the `ip addr
        // show` that must claim the VIP is present for a delete to run.
        runner.push_ok("");
        runner.push_ok("");
        runner.push_ok("2: eth0 inet 192.168.1.250/24 scope global eth0\n");
        let activator = activator(Arc::clone(&runner), &constraints);
        let report = activator.deactivate_all().await;
        assert!(report.success);

        let calls = runner.recorded();
        let web = calls.iter().position(|c| c.contains("stop nginx")).unwrap();
        let db = calls.iter().position(|c| c.contains("stop postgresql")).unwrap();
        let vip = calls.iter().position(|c| c.contains("addr del")).unwrap();
        assert!(web < db && db < vip, "calls: {calls:?}");
    }

    #[tokio::test]
    async fn errors_are_collected_not_shortcircuited() {
        let runner = Arc::new(FakeRunner::new());
        // vip show (absent), vip add, vip verify (absent -> error), then
        // both service starts still run.
        runner.push_ok("");
        runner.push_ok("");
        runner.push_ok("");
        let activator = activator(Arc::clone(&runner), &[]);
        let report = activator.activate_all().await;
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        let calls = runner.recorded();
        assert!(calls.iter().any(|c| c.contains("start nginx")));
        assert!(calls.iter().any(|c| c.contains("start postgresql")));
    }
}
