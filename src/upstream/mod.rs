pub mod client;
pub mod failure;
pub mod headers;
pub mod stream;
pub mod traits;

pub use client::UpstreamClient;
pub use failure::UpstreamFailure;
pub use headers::HeaderTemplate;
pub use traits::{
    ChatReply, ConversationContext, DeltaStream, Upstream, UpstreamCompletion, UpstreamDelta,
};
