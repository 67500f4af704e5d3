pub mod broadcast;
pub mod bus;
pub mod codec;
pub mod events;
pub mod packet;
pub mod session;
