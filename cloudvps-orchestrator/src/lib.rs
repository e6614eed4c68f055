// Library entry point for the binary and the integration tests

pub mod api;
pub mod credentials;
pub mod ip_allocator;
pub mod lifecycle;
pub mod listener;
pub mod logger;
pub mod metrics;
pub mod notifications;
pub mod placement;
pub mod poll;
pub mod provider_manager;
pub mod provisioning;
pub mod repository;
pub mod settings;
pub mod state_machine;

// Re-export commonly used types
pub use api::{create_router, AppState};
pub use lifecycle::LifecycleController;
pub use metrics::MetricsReader;
pub use provisioning::ProvisioningWorkflow;
