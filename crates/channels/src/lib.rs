//! WhatsApp messaging: the transport capability, the per-tenant instance
//! registry, and automation notifications.

pub mod automation;
pub mod instance;
pub mod transport;
pub mod whatsapp;

pub use automation::{AutomationNotifier, NotificationOutcome};
pub use instance::InstanceRegistry;
pub use transport::{MessageTransport, ScriptedReply, ScriptedTransport};
pub use whatsapp::WhatsAppProvider;
