//! QoS enforcement agent
//!
//! Runs as a DaemonSet on each node. Consumes pod lifecycle and node
//! pressure events and programs the kernel cgroup hierarchy to bias
//! scheduling and memory reclaim toward higher-priority workloads.

use anyhow::Result;
use qos_agent_lib::cgroup::{CgroupManager, RuntimeContext};
use qos_agent_lib::events::{
    cpu_burst::CpuBurstHandler, cpu_qos::CpuQosHandler, cpu_throttle::CpuThrottleHandler,
    memory_qos::MemoryQosHandler, resources::ResourcesHandler, AgentEvent, Dispatcher, EventName,
};
use qos_agent_lib::health::{components, HealthRegistry};
use qos_agent_lib::observability::AgentMetrics;
use qos_agent_lib::resource::create_resource_handler;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod pods;
mod source;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with env-filterable levels
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting qos-agent");

    let config = config::AgentConfig::load()?;
    info!(node_name = %config.node_name, "Agent configured");

    // Version and driver are detected once and fixed for the agent's life.
    let ctx = RuntimeContext::detect(
        &config.cgroup_root,
        config.kube_cgroup_root.clone(),
        config.driver_override(),
    )
    .await?;
    let manager = CgroupManager::new(ctx);
    let resource_handler =
        create_resource_handler(manager.clone(), config.memory_qos.clone()).await;

    let registry = Arc::new(pods::PodRegistry::new());
    let throttle = Arc::new(CpuThrottleHandler::new(
        manager.clone(),
        registry.clone(),
        config.throttle.clone(),
    ));

    let mut dispatcher = Dispatcher::new();
    dispatcher.register(EventName::Pod, Arc::new(CpuQosHandler::new(resource_handler.clone())));
    dispatcher.register(
        EventName::Pod,
        Arc::new(MemoryQosHandler::new(resource_handler.clone())),
    );
    dispatcher.register(
        EventName::Pod,
        Arc::new(CpuBurstHandler::new(resource_handler.clone(), registry.clone())),
    );
    dispatcher.register(
        EventName::Pod,
        Arc::new(ResourcesHandler::new(resource_handler.clone())),
    );
    dispatcher.register(EventName::NodeCpuThrottle, throttle.clone());
    let dispatcher = Arc::new(dispatcher);

    let health_registry = HealthRegistry::new();
    health_registry.register(components::DISPATCHER).await;
    health_registry.register(components::RESOURCE_HANDLER).await;
    health_registry.register(components::THROTTLE).await;

    let metrics = AgentMetrics::new();

    // Event intake: the external source publishes JSON lines on this socket.
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_socket = source::EventSocket::bind(&config.event_socket, event_tx)?;
    tokio::spawn(event_socket.run());
    tokio::spawn(run_event_loop(
        event_rx,
        dispatcher,
        registry,
        throttle,
        metrics.clone(),
    ));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_port, app_state).await {
            error!(error = %err, "Health and metrics API failed");
        }
    });

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

/// Drain the event channel, keeping the pod registry fresh and dispatching
/// each event to its handlers. Enforcement failures are logged by the
/// dispatcher; the loop never stops on them.
async fn run_event_loop(
    mut event_rx: mpsc::Receiver<AgentEvent>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<pods::PodRegistry>,
    throttle: Arc<CpuThrottleHandler>,
    metrics: AgentMetrics,
) {
    while let Some(event) = event_rx.recv().await {
        if let AgentEvent::Pod(pod_event) = &event {
            registry.record(&pod_event.pod);
        }

        let start = Instant::now();
        dispatcher.dispatch(&event).await;
        metrics.observe_enforcement_latency(start.elapsed().as_secs_f64());
        metrics.inc_event_handled(&event.name().to_string());

        if matches!(event, AgentEvent::NodeCpuThrottle(_)) {
            metrics.set_throttled_pods(throttle.throttled_pod_count().await as i64);
        }
    }
    info!("Event channel closed");
}
