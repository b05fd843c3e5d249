//! Messaging transport capability and an in-memory scripted implementation
//! for tests.

use async_trait::async_trait;
use feedback_core::error::TransportError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

/// Sends a single text message through a tenant's WhatsApp instance and
/// returns the provider's message id.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        instance_id: &str,
        phone: &str,
        text: &str,
    ) -> Result<String, TransportError>;
}

/// A call observed by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub instance_id: String,
    pub phone: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Ok,
    Fail(TransportError),
    /// Sleep before succeeding; used to exercise the dispatcher timeout.
    Stall(Duration),
}

/// Records every call and answers from a script; succeeds once the script is
/// exhausted.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: Mutex<Vec<SentMessage>>,
    script: Mutex<VecDeque<ScriptedReply>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        self.script.lock().push_back(reply);
    }

    pub fn fail_next(&self, error: TransportError) {
        self.push_reply(ScriptedReply::Fail(error));
    }

    pub fn calls(&self) -> Vec<SentMessage> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl MessageTransport for ScriptedTransport {
    async fn send(
        &self,
        instance_id: &str,
        phone: &str,
        text: &str,
    ) -> Result<String, TransportError> {
        self.calls.lock().push(SentMessage {
            instance_id: instance_id.to_string(),
            phone: phone.to_string(),
            text: text.to_string(),
        });
        let reply = self.script.lock().pop_front();
        match reply {
            None | Some(ScriptedReply::Ok) => Ok(Uuid::new_v4().to_string()),
            Some(ScriptedReply::Fail(err)) => Err(err),
            Some(ScriptedReply::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(Uuid::new_v4().to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_transport_replays_script() {
        let transport = ScriptedTransport::new();
        transport.fail_next(TransportError::RejectedNumber("123".into()));

        let first = transport.send("inst", "123", "hi").await;
        let second = transport.send("inst", "123", "hi").await;

        assert_eq!(first, Err(TransportError::RejectedNumber("123".into())));
        assert!(second.is_ok());
        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.calls()[0].text, "hi");
    }
}
