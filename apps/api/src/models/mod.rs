pub mod chat;
pub mod chunk;
pub mod video;
