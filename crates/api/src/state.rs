//! Application state

use std::sync::Arc;

use subledger_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(billing: BillingService, config: Config) -> Self {
        Self {
            billing,
            config: Arc::new(config),
        }
    }
}
