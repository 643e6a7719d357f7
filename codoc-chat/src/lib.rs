//! Codoc Chat - the streaming conversation engine.
//!
//! This crate provides:
//! - SSE decoding (bytes → blocks → frames → typed events)
//! - Token coalescing with a per-tick flush
//! - The per-problem session store and turn state machine
//! - Live stream sessions with synchronous, idempotent cancellation
//! - The global/stream rate-limit split and its governor
//! - The chatbot API client and the chat controller front ends drive
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use codoc_chat::{ApiClient, ChatController, RateLimitGovernor, SessionStore, StaticToken};
//! use codoc_common::Config;
//!
//! let config = Config::load_with_env(None)?;
//! let token = Arc::new(StaticToken::new(config.api.access_token.clone()));
//! let api = ApiClient::new(&config.api, token, RateLimitGovernor::new())?;
//! let chat = ChatController::new(api, SessionStore::new(), &config.chat);
//!
//! chat.open("42");
//! chat.set_draft("42", "What does the problem ask?");
//! chat.send("42").await;
//! chat.wait_idle("42").await;
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod client;
pub mod coalescer;
pub mod controller;
pub mod error;
pub mod message;
pub mod rate_limit;
pub mod sse;
pub mod status;
pub mod store;
pub mod stream;

pub use client::{ApiClient, CredentialSupplier, SendTurnResponse, StaticToken};
pub use coalescer::TokenCoalescer;
pub use controller::{ChatController, SendOutcome};
pub use error::{ChatError, Result};
pub use message::{Message, MessageMeta, Role, INTRO_MESSAGE, INTRO_MESSAGE_ID};
pub use rate_limit::{RateLimitGovernor, RateLimitSink, RateLimitState};
pub use status::{resolve_status, ChatStatus, STREAM_RATE_LIMIT_CODE};
pub use store::{
    ConversationSession, ConversationStatus, SessionChange, SessionPatch, SessionStore, TurnExit,
    STREAM_FAILED_MESSAGE,
};
pub use stream::{StreamSession, StreamSettings, StreamTarget};
