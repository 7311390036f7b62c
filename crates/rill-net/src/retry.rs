use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use url::Url;

use crate::{
    error::NetError,
    traits::{ByteStream, Transport},
    types::{Headers, RequestOptions, Response, RetryPolicy},
};

pub trait RetryPolicyTrait: Send + Sync {
    fn should_retry(&self, error: &NetError, attempt: u32) -> bool;
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
    fn max_attempts(&self) -> u32;
}

pub struct DefaultRetryPolicy {
    policy: RetryPolicy,
}

impl DefaultRetryPolicy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl RetryPolicyTrait for DefaultRetryPolicy {
    fn should_retry(&self, error: &NetError, attempt: u32) -> bool {
        if attempt >= self.policy.max_retries {
            return false;
        }
        error.is_retryable()
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.policy.delay_for_attempt(attempt)
    }

    fn max_attempts(&self) -> u32 {
        self.policy.max_retries
    }
}

/// Retry decorator for Transport implementations.
pub struct RetryTransport<T, P> {
    inner: T,
    retry_policy: P,
}

impl<T: Transport, P: RetryPolicyTrait> RetryTransport<T, P> {
    pub fn new(inner: T, retry_policy: P) -> Self {
        Self {
            inner,
            retry_policy,
        }
    }

    async fn run<'a, F, Fut, R>(&'a self, mut call: F) -> Result<R, NetError>
    where
        F: FnMut(&'a T) -> Fut,
        Fut: std::future::Future<Output = Result<R, NetError>> + 'a,
    {
        let mut last_error = None;

        for attempt in 0..=self.retry_policy.max_attempts() {
            match call(&self.inner).await {
                Ok(out) => return Ok(out),
                Err(error) => {
                    if !self.retry_policy.should_retry(&error, attempt) {
                        return Err(error);
                    }
                    last_error = Some(error);

                    if attempt < self.retry_policy.max_attempts() {
                        sleep(self.retry_policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(error) => NetError::RetryExhausted {
                max_retries: self.retry_policy.max_attempts(),
                source: Box::new(error),
            },
            None => NetError::Aborted,
        })
    }
}

#[async_trait]
impl<T: Transport, P: RetryPolicyTrait> Transport for RetryTransport<T, P> {
    async fn get(&self, url: Url, opts: RequestOptions) -> Result<Response, NetError> {
        self.run(|inner| inner.get(url.clone(), opts.clone())).await
    }

    async fn stream(&self, url: Url, opts: RequestOptions) -> Result<ByteStream, NetError> {
        self.run(|inner| inner.stream(url.clone(), opts.clone()))
            .await
    }

    async fn head(&self, url: Url, opts: RequestOptions) -> Result<Headers, NetError> {
        self.run(|inner| inner.head(url.clone(), opts.clone()))
            .await
    }
}
