//! Background services: the block feed and the price tracker

mod block_feed;
mod price_tracker;

pub use block_feed::{block_channel, BlockFeed, FeedStats, PushOutcome};
pub use price_tracker::{OracleState, PriceTracker, TrackerError};
