//! Miscellaneous common structs used throughout the library.

mod contact;
mod id;
pub mod messages;
mod record;
mod routing_table;

pub use contact::*;
pub use id::*;
pub use record::*;
pub use routing_table::*;
