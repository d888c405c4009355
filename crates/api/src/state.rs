//! Application state

use carmarket_payments::PaymentsService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub payments: PaymentsService,
}

impl AppState {
    pub fn new(payments: PaymentsService) -> Self {
        Self { payments }
    }
}
