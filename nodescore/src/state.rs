//! Shared daemon state handed to every axum handler.

use std::sync::Arc;

use crate::collector::Collector;
use crate::registry::StaticRegistry;
use crate::store::MetricsStore;

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    pub registry: Arc<StaticRegistry>,
    pub store: Arc<dyn MetricsStore>,

    // Required as ?token= on /ws and admin routes when set
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn authorized(&self, token: Option<&str>) -> bool {
        match self.auth_token.as_deref() {
            None => true,
            Some(expected) => token == Some(expected),
        }
    }
}
