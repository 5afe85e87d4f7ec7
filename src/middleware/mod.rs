pub mod metrics;

pub use metrics::EndpointMetrics;
