//! Framing adapters.
//!
//! Adapters wrap a connection-shaped value and present the same
//! contract outwards while regrouping the byte stream into whole
//! frames. They are generic over [`Conn`], so they layer over the real
//! transport and the testing transport alike.
//!
//! [`Conn`]: crate::Conn

mod lines;
mod sized;

pub use self::lines::Lines;
pub use self::sized::{MessageHandler, Sized};
