//! Front-end protocol and setup flows.

mod link;
mod setup;

pub use link::{
    CHANNEL_CAPACITY, CodeReply, FrontendHandle, FrontendLink, GroupOption, Prompt, RunEvent,
    RunInput, link,
};
pub use setup::{SetupError, adjust_invite_limit, choose_target_group};
