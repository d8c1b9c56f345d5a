pub mod cryptography;
pub mod message;
pub mod server;
pub mod store;
pub mod transport;
pub mod commands;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const ID_SIZE: usize = 32;
pub const STREAM_BUFFER_SIZE: usize = 32 * 1024;
pub const MESSAGE_BUFFER_SIZE: usize = 1028;
pub const RPC_CHANNEL_CAPACITY: usize = 1024;
