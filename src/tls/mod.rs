pub mod ca;
pub mod cache;
pub mod issuer;
