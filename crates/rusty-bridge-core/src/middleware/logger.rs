use async_trait::async_trait;

use crate::engine::{Flow, Middleware};
use crate::message::{RpcError, RpcRequest};

pub struct LoggerMiddleware {
    origin: String,
}

impl LoggerMiddleware {
    pub fn new(origin: String) -> Self {
        Self { origin }
    }
}

#[async_trait]
impl Middleware for LoggerMiddleware {
    fn name(&self) -> &'static str {
        "logger"
    }

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError> {
        tracing::debug!(
            origin = %self.origin,
            method = %request.method,
            id = %request.id,
            "rpc request"
        );
        Ok(Flow::Next)
    }
}
