//! # flow-x
//!
//! Adaptive traffic control for RPC services: rolling-window statistics,
//! CPU-aware overload shedding and power-of-two-choices load balancing.

pub use flowx_balance as balance;
pub use flowx_core as common;
pub use flowx_metric as metric;
pub use flowx_shed as shed;

pub use flowx_balance::{Backend, Balancer, Code, P2cBuilder, P2cPicker};
pub use flowx_core::{FlowConfig, FlowXError};
pub use flowx_shed::{Bbr, CpuMonitor, Promise, Shedder, ShedderGroup};

use std::sync::Arc;

/// A shedder, its CPU monitor and a balancer wired from one [`FlowConfig`].
pub struct FlowControl<C> {
    pub cpu: CpuMonitor,
    pub shedders: ShedderGroup,
    pub balancer: Balancer<C>,
}

impl<C> FlowControl<C> {
    /// Builds every component on the process clock. The CPU monitor is not
    /// started; call [`FlowControl::start_cpu_sampling`] from a tokio runtime.
    pub fn new(config: &FlowConfig) -> Result<Self, FlowXError> {
        config.validate()?;
        let clock = flowx_core::system_clock();
        let cpu = CpuMonitor::from_config(&config.cpu);
        let shedders = ShedderGroup::new(config.shed.clone(), Arc::new(cpu.clone()), clock.clone())?;
        let balancer = Balancer::new(config.balancer.clone(), clock);
        tracing::info!(
            shed_enabled = config.shed.enabled,
            window_ms = config.shed.window_ms,
            buckets = config.shed.buckets,
            cpu_threshold = config.shed.cpu_threshold,
            "FlowControl: components ready"
        );
        Ok(Self {
            cpu,
            shedders,
            balancer,
        })
    }

    /// Spawns the sampler picked by [`flowx_shed::cpu::default_sampler`].
    pub fn start_cpu_sampling(
        &self,
        config: &FlowConfig,
    ) -> Result<tokio::task::JoinHandle<()>, FlowXError> {
        let sampler = flowx_shed::cpu::default_sampler()?;
        Ok(self.cpu.spawn(sampler, config.cpu.interval()))
    }
}
