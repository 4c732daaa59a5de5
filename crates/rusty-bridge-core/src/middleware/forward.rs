use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::{Flow, Middleware};
use crate::message::{RpcError, RpcRequest};
use crate::ports::UpstreamProvider;

/// Terminal stage: anything still unresolved goes to the upstream proxy.
pub struct ForwardMiddleware {
    provider: Arc<dyn UpstreamProvider>,
}

impl ForwardMiddleware {
    pub fn new(provider: Arc<dyn UpstreamProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Middleware for ForwardMiddleware {
    fn name(&self) -> &'static str {
        "forward"
    }

    async fn handle(&self, request: &mut RpcRequest) -> Result<Flow, RpcError> {
        let result = self
            .provider
            .request(&request.method, request.params.clone())
            .await?;
        Ok(Flow::Done(result))
    }
}
