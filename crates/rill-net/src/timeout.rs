use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::{
    error::NetError,
    traits::{ByteStream, Transport},
    types::{Headers, RequestOptions, Response},
};

/// Timeout decorator for Transport implementations.
pub struct TimeoutTransport<T> {
    inner: T,
    timeout: Duration,
}

impl<T: Transport> TimeoutTransport<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn effective_timeout(&self, opts: &RequestOptions) -> Duration {
        opts.timeout.unwrap_or(self.timeout)
    }
}

#[async_trait]
impl<T: Transport> Transport for TimeoutTransport<T> {
    async fn get(&self, url: Url, opts: RequestOptions) -> Result<Response, NetError> {
        let timeout = self.effective_timeout(&opts);
        tokio::time::timeout(timeout, self.inner.get(url, opts))
            .await
            .map_err(|_| NetError::timeout())?
    }

    async fn stream(&self, url: Url, opts: RequestOptions) -> Result<ByteStream, NetError> {
        // Only the request/response phase is bounded; the body transfer can
        // take arbitrary time and is paced by the consumer.
        let timeout = self.effective_timeout(&opts);
        tokio::time::timeout(timeout, self.inner.stream(url, opts))
            .await
            .map_err(|_| NetError::timeout())?
    }

    async fn head(&self, url: Url, opts: RequestOptions) -> Result<Headers, NetError> {
        let timeout = self.effective_timeout(&opts);
        tokio::time::timeout(timeout, self.inner.head(url, opts))
            .await
            .map_err(|_| NetError::timeout())?
    }
}
