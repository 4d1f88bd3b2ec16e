//! Client engine for the MoiMate meetup service: REST client, STOMP
//! transport, chat rooms with round/attendance handling and the
//! notification banner.

pub mod api;
pub mod auth;
pub mod bus;
pub mod chat;
pub mod config;
pub mod entity;
pub mod interface;
pub mod notification;
pub mod realtime;
pub mod room;
pub mod settlement;
pub mod store;
