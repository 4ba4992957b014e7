#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod conn;
pub mod cookie;
mod error;
pub mod headers;
mod meta;
pub mod params;
pub mod request;
pub mod response;
pub mod server;
mod stdin;
mod stream;

pub use crate::{
    cookie::Cookie,
    error::*,
    headers::RequestHeader,
    params::Params,
    request::Request,
    response::Response,
    server::{Bind, Server, ServerConfig},
    stdin::InputBuffer,
    stream::Stream,
};
