use std::sync::Arc;

use crate::application::services::InspectionService;

/// Shared state for the axum handlers: the project's use cases.
#[derive(Clone)]
pub struct HttpState {
    pub inspection: Arc<InspectionService>,
}
