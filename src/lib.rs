//! Announces newly published Apple software releases to chat servers.
//!
//! A [`poller::Poller`] periodically fetches the configured sources,
//! normalizes entries into [`release::Release`] records, diffs them against
//! the previous cycle and hands new ones to a [`dispatch::Dispatcher`], which
//! posts to every subscribed guild through a [`transport::Transport`].

pub mod announce;
pub mod config;
pub mod dispatch;
pub mod feed;
pub mod poller;
pub mod release;
pub mod storage;
pub mod transport;
pub mod util;
