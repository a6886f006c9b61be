use sqlx::PgPool;
use std::sync::Arc;

use crate::auth::JwtVerifier;
use crate::pipeline::broker::Broker;
use crate::pipeline::Pipeline;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub pipeline: Arc<Pipeline>,
    pub jwt: Arc<JwtVerifier>,
    /// Present in broker mode; checked by `/health`.
    pub broker: Option<Arc<dyn Broker>>,
}

impl AppState {
    pub fn new(db: PgPool, pipeline: Pipeline, jwt: JwtVerifier, broker: Option<Arc<dyn Broker>>) -> Self {
        Self {
            db,
            pipeline: Arc::new(pipeline),
            jwt: Arc::new(jwt),
            broker,
        }
    }
}
