use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use url::Url;

use crate::{
    error::NetError,
    retry::{DefaultRetryPolicy, RetryTransport},
    timeout::TimeoutTransport,
    types::{Headers, RequestOptions, Response, RetryPolicy},
};

/// Incremental body stream. Consumers count chunk sizes for byte-progress
/// reporting; the transfer is abandoned by dropping the stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;

#[cfg_attr(any(test, feature = "test-utils"), unimock::unimock(api = TransportMock))]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the full body of a URL.
    async fn get(&self, url: Url, opts: RequestOptions) -> Result<Response, NetError>;

    /// Stream the body of a URL chunk by chunk.
    async fn stream(&self, url: Url, opts: RequestOptions) -> Result<ByteStream, NetError>;

    /// Issue a HEAD request and return the response headers.
    async fn head(&self, url: Url, opts: RequestOptions) -> Result<Headers, NetError>;
}

pub trait TransportExt: Transport + Sized {
    /// Add timeout layer.
    fn with_timeout(self, timeout: Duration) -> TimeoutTransport<Self> {
        TimeoutTransport::new(self, timeout)
    }

    /// Add retry layer.
    fn with_retry(self, policy: RetryPolicy) -> RetryTransport<Self, DefaultRetryPolicy> {
        RetryTransport::new(self, DefaultRetryPolicy::new(policy))
    }
}

impl<T: Transport> TransportExt for T {}
