pub mod chat;
pub mod init;
pub mod sessions;
pub mod slash;
