#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod address;
pub mod apdu;
pub mod bvll;
pub mod encoding;
pub mod error;
pub mod npdu;
pub mod object;
pub mod pdu;
pub mod services;

pub use error::{DecodeError, EncodeError};
