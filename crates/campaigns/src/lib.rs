//! Campaign lifecycle and dispatch: recipient queues, the campaign state
//! machine, rate-limited WhatsApp dispatch, and the periodic tick driver.

pub mod dispatcher;
pub mod locks;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod state_machine;

pub use dispatcher::{RateLimitedDispatcher, TickOutcome};
pub use locks::{CampaignLockProvider, InProcessLocks};
pub use queue::{QueueEntry, RecipientQueue};
pub use retry::RetryPolicy;
pub use scheduler::{DispatchScheduler, TickReport};
pub use service::CampaignService;
pub use state_machine::{CampaignStateMachine, CampaignTrigger, TransitionOutcome};
