//! Wire encoding of peer messages.

pub mod msg;

pub use msg::{InfoFlags, RwField, RwMessage, RwOp};
