mod body;
mod codec;
mod dispatch;
mod forward;
mod pipeline;
mod server;
mod upstream;

pub use server::{handle_decrypted_https, handle_http};
