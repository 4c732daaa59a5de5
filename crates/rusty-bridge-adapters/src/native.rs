use std::sync::Arc;

use rusty_bridge_core::{
    OpenedPort, OutboundMessage, PortError, PortFactory, SessionKey, Transport,
};

/// Native host channel. Receives the serialized message and the origin it
/// is addressed to.
pub trait NativeSink: Send + Sync {
    fn post_from_bridge(&self, json: &str, origin: &str) -> Result<(), PortError>;
}

pub struct NativePort {
    sink: Arc<dyn NativeSink>,
}

impl NativePort {
    pub fn new(sink: Arc<dyn NativeSink>) -> Self {
        Self { sink }
    }
}

impl Transport for NativePort {
    fn post_message(
        &self,
        message: &OutboundMessage,
        target_origin: &str,
    ) -> Result<(), PortError> {
        let json = serde_json::to_string(message)
            .map_err(|e| PortError::Validation(format!("outbound message encode failed: {e}")))?;
        self.sink.post_from_bridge(&json, target_origin)
    }
}

/// Every native session is treated as a main frame.
pub struct NativePortFactory {
    sink: Arc<dyn NativeSink>,
}

impl NativePortFactory {
    pub fn new(sink: Arc<dyn NativeSink>) -> Self {
        Self { sink }
    }
}

impl PortFactory for NativePortFactory {
    fn open(&self, _key: &SessionKey) -> Result<OpenedPort, PortError> {
        Ok(OpenedPort {
            transport: Arc::new(NativePort::new(Arc::clone(&self.sink))),
            is_main_frame: true,
        })
    }
}
