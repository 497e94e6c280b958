/// Startup gate: refuse to boot when any production invariant is unmet.
/// Readiness is a set of explicit booleans assembled from live state, not
/// assumptions; a failed gate is a process exit.
use tracing::{error, info};

use crate::broker::BrokerRegistry;
use crate::config::{AdapterKind, Config, ReleaseReadiness};
use crate::error::{EngineError, Result};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub storage_ready: bool,
    pub schema_constraints_ready: bool,
    pub data_broker_ready: bool,
    pub order_execution_ready: bool,
    pub event_writer_ready: bool,
    pub broker_endpoints_ready: bool,
}

impl ReadinessReport {
    pub fn all_ready(&self) -> bool {
        self.storage_ready
            && self.schema_constraints_ready
            && self.data_broker_ready
            && self.order_execution_ready
            && self.event_writer_ready
            && self.broker_endpoints_ready
    }
}

/// Run the gate. BETA mode requires storage, schema and a single DATA
/// broker; PROD_READY production mode additionally demands live order
/// execution, production endpoints and the async event writer when tick
/// persistence is on.
pub fn run_startup_gate(
    config: &Config,
    store: &Store,
    registry: &BrokerRegistry,
    async_writer_enabled: bool,
) -> Result<ReadinessReport> {
    let storage_ready = store.ping().is_ok();
    let schema_constraints_ready = store.verify_schema().is_ok();
    let data_broker_ready = registry.data_broker().is_some();

    let production = config.engine.production_mode;
    let order_execution_ready = !production || config.engine.order_execution_enabled;
    let event_writer_ready =
        !production || !config.engine.persist_tick_events || async_writer_enabled;
    let broker_endpoints_ready = !production || production_endpoints_ok(config);

    let report = ReadinessReport {
        storage_ready,
        schema_constraints_ready,
        data_broker_ready,
        order_execution_ready,
        event_writer_ready,
        broker_endpoints_ready,
    };

    if production && config.engine.release_readiness != ReleaseReadiness::ProdReady {
        return gate_failure("production mode requires PROD_READY release readiness", &report);
    }
    if !report.storage_ready {
        return gate_failure("storage unreachable", &report);
    }
    if !report.schema_constraints_ready {
        return gate_failure("uniqueness indexes or check constraints missing", &report);
    }
    if !report.data_broker_ready {
        return gate_failure("no enabled DATA broker", &report);
    }
    if !report.order_execution_ready {
        return gate_failure("production mode with order execution disabled", &report);
    }
    if !report.event_writer_ready {
        return gate_failure(
            "tick persistence requires the async event writer in production",
            &report,
        );
    }
    if !report.broker_endpoints_ready {
        return gate_failure("non-production broker endpoint in production mode", &report);
    }

    info!("Startup gate passed: {:?}", report);
    Ok(report)
}

/// Every enabled endpoint must be an HTTPS production URL; the paper
/// adapter never ships to production.
fn production_endpoints_ok(config: &Config) -> bool {
    config.user_brokers.iter().filter(|ub| ub.enabled).all(|ub| {
        match ub.adapter {
            AdapterKind::Paper => false,
            AdapterKind::Http => ub
                .base_url
                .as_deref()
                .map(|url| url.starts_with("https://") && !url.contains("sandbox") && !url.contains("uat"))
                .unwrap_or(false),
        }
    })
}

fn gate_failure(reason: &str, report: &ReadinessReport) -> Result<ReadinessReport> {
    error!("Startup gate FAILED: {} ({:?})", reason, report);
    Err(EngineError::StartupGateFailed(reason.to_string()))
}
