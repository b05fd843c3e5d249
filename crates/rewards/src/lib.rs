//! Rewards: prize wheel allocation, coupon issuing, redemption tracking and
//! the reward catalog.

pub mod catalog;
pub mod conversion;
pub mod coupons;
pub mod orchestrator;
pub mod wheel;

pub use catalog::{RewardCatalog, RewardDraft, SlotDraft, WheelDraft};
pub use conversion::{Conversion, ConversionTracker};
pub use coupons::CouponIssuer;
pub use orchestrator::{RewardOrchestrator, SpinResult};
pub use wheel::PrizeWheelAllocator;
