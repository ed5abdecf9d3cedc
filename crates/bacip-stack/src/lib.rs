//! BACnet/IP application stack.
//!
//! [`Stack`] binds a UDP endpoint through one of the link roles, runs the
//! network layer and both segmentation state machines on a single task, and
//! dispatches confirmed/unconfirmed services to registered handlers.
//! [`StackHandle`] is the way in from the rest of the program.

/// Application dispatcher and service handler traits.
pub mod app;
/// Stack configuration.
pub mod config;
/// Per-peer capability cache.
pub mod device;
/// Error types.
pub mod error;
/// Network service access point and router table.
pub mod network;
/// Segmentation state machines.
pub mod ssm;
/// The assembled stack and its event loop.
pub mod stack;
/// Timer wheel for transaction timers.
pub mod timer;
/// Transaction registry.
pub mod tsm;

pub use app::{ApplicationDispatcher, ConfirmedHandler, LocalObject, ServiceAck, UnconfirmedHandler};
pub use config::StackConfig;
pub use device::{DeviceInfo, DeviceInfoCache};
pub use error::{ServiceError, StackError};
pub use stack::{Confirmation, Stack, StackHandle};
