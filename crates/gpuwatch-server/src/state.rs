use std::sync::Arc;

use gpuwatch_core::GpuWatch;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub watch: GpuWatch,
    pub metrics: Arc<Metrics>,
}
