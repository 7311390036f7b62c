#![forbid(unsafe_code)]

mod client;
mod error;
mod retry;
mod timeout;
mod traits;
mod types;

pub use crate::{
    client::HttpClient,
    error::{NetError, NetResult},
    retry::{DefaultRetryPolicy, RetryPolicyTrait, RetryTransport},
    timeout::TimeoutTransport,
    traits::{ByteStream, Transport, TransportExt},
    types::{ByteRange, Headers, NetOptions, RequestOptions, Response, RetryPolicy},
};

#[cfg(any(test, feature = "test-utils"))]
pub use crate::traits::TransportMock;
