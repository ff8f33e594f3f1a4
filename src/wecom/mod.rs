pub mod client;
pub mod token_cache;

pub use client::{MemberInfo, PlatformApi, WecomClient};
pub use token_cache::TokenCache;
