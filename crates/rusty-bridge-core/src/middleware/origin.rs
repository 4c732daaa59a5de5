use async_trait::async_trait;

use crate::engine::{Flow, Middleware};
use crate::message::{RpcError, RpcRequest};

/// Tags every request with the session origin. Later stages authorize
/// against this tag.
pub struct OriginMiddleware {
    origin: String,
}

impl OriginMiddleware {
    pub fn new(origin: String) -> Self {
        Self { origin }
    }
}

#[async_trait]
impl Middleware for OriginMiddleware {
    fn name(&self) -> &'static str {
        "origin"
    }

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError> {
        request.origin = Some(self.origin.clone());
        Ok(Flow::Next)
    }
}
