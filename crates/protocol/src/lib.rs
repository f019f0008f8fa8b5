pub mod config;
pub mod frame;
pub mod handshake;
pub mod messages;
pub mod packet;
pub mod token;

pub use config::*;
pub use frame::*;
pub use handshake::*;
pub use messages::*;
pub use packet::*;
pub use token::*;
