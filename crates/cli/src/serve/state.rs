//! Application state shared across request handlers.

use agritrace_engine::ProvenanceFacade;

pub(crate) struct AppState {
    /// Entry point into the running engine.
    pub(crate) facade: ProvenanceFacade,
    /// Optional API key for authentication. None = no auth required.
    pub(crate) api_key: Option<String>,
}
