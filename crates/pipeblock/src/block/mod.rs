//! Stream blocks that own an [`ItemBridge`](crate::bridge::ItemBridge).
//!
//! - **filter**: general block, items flow both ways at a fixed relative rate
//! - **sink**: sync block, items only flow into the child

pub mod filter;
pub mod sink;

/// Items moved by one `general_work` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkOutput {
    /// Output items written; the runtime advances its output buffer by this much.
    pub produced: usize,
    /// Input items taken; the rest stay queued for the next call.
    pub consumed: usize,
}
