use std::sync::{Arc, Mutex, PoisonError, Weak};

use rusty_bridge_core::{
    OpenedPort, OutboundMessage, PortError, PortFactory, SessionKey, Transport,
};

/// Host webview that can evaluate a script in the page.
pub trait ScriptSink: Send + Sync {
    fn inject_javascript(&self, script: &str) -> Result<(), PortError>;
}

/// Builds the script that delivers `message` to the page. Main-frame
/// messages go to `window`; frame messages go to every iframe whose `src`
/// matches `target_origin`.
pub fn post_message_script(
    message: &OutboundMessage,
    target_origin: &str,
    is_main_frame: bool,
) -> Result<String, PortError> {
    let payload = serde_json::to_string(message)
        .map_err(|e| PortError::Validation(format!("outbound message encode failed: {e}")))?;
    let origin = serde_json::to_string(target_origin)
        .map_err(|e| PortError::Validation(format!("target origin encode failed: {e}")))?;
    if is_main_frame {
        return Ok(format!(
            "(function () {{ window.postMessage({payload}, {origin}); }})()"
        ));
    }
    Ok(format!(
        "(function () {{ \
         var frames = document.getElementsByTagName('iframe'); \
         for (var i = 0; i < frames.length; i++) {{ \
         if (frames[i].src === {origin}) {{ frames[i].contentWindow.postMessage({payload}, {origin}); }} \
         }} }})()"
    ))
}

/// Transport that injects outbound messages into a webview. Holds the
/// webview weakly; once the host drops it, sends fail as closed.
pub struct WebviewPort {
    webview: Weak<dyn ScriptSink>,
    is_main_frame: bool,
}

impl WebviewPort {
    pub fn new(webview: &Arc<dyn ScriptSink>, is_main_frame: bool) -> Self {
        Self {
            webview: Arc::downgrade(webview),
            is_main_frame,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.webview.strong_count() > 0
    }
}

impl Transport for WebviewPort {
    fn post_message(
        &self,
        message: &OutboundMessage,
        target_origin: &str,
    ) -> Result<(), PortError> {
        let webview = self
            .webview
            .upgrade()
            .ok_or_else(|| PortError::Closed("webview detached".to_owned()))?;
        let script = post_message_script(message, target_origin, self.is_main_frame)?;
        webview.inject_javascript(&script)
    }
}

/// Opens webview ports. The main frame is the peer id
/// [`rusty_bridge_core::MAIN_FRAME_PEER`]; any other peer id is a frame.
pub struct WebviewPortFactory {
    webview: Mutex<Weak<dyn ScriptSink>>,
}

impl WebviewPortFactory {
    pub fn new(webview: &Arc<dyn ScriptSink>) -> Self {
        Self {
            webview: Mutex::new(Arc::downgrade(webview)),
        }
    }

    /// Points future sessions at a new webview. Existing ports keep theirs.
    pub fn attach(&self, webview: &Arc<dyn ScriptSink>) {
        *self.webview.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(webview);
    }
}

impl PortFactory for WebviewPortFactory {
    fn open(&self, key: &SessionKey) -> Result<OpenedPort, PortError> {
        let webview = self
            .webview
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .ok_or_else(|| PortError::Closed("no webview attached".to_owned()))?;
        let is_main_frame = key.peer_id == rusty_bridge_core::MAIN_FRAME_PEER;
        Ok(OpenedPort {
            transport: Arc::new(WebviewPort::new(&webview, is_main_frame)),
            is_main_frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusty_bridge_core::{OutboundPayload, RpcResponse, PROVIDER_STREAM};
    use serde_json::json;

    fn message() -> OutboundMessage {
        OutboundMessage {
            name: PROVIDER_STREAM.to_owned(),
            data: OutboundPayload::Response(RpcResponse::success(json!(1), json!("0x1"))),
        }
    }

    #[test]
    fn main_frame_script_posts_to_window() {
        let script = post_message_script(&message(), "https://app.example", true)
            .expect("script");
        assert!(script.starts_with("(function () { window.postMessage({"));
        assert!(script.contains("\"https://app.example\""));
        assert!(script.contains("\"result\":\"0x1\""));
    }

    #[test]
    fn frame_script_targets_matching_iframes() {
        let script = post_message_script(&message(), "https://frame.example/widget", false)
            .expect("script");
        assert!(script.contains("frames[i].src === \"https://frame.example/widget\""));
        assert!(script.contains("contentWindow.postMessage"));
    }
}
