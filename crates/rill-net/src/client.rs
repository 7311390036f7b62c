use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client;
use url::Url;

use crate::{
    error::{NetError, NetResult},
    traits::{ByteStream, Transport},
    types::{Headers, NetOptions, RequestOptions, Response},
};

/// Default `reqwest`-backed transport.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: Client,
    options: NetOptions,
}

impl HttpClient {
    /// # Panics
    ///
    /// Panics if the `reqwest::Client` builder fails to build.
    #[must_use]
    pub fn new(options: NetOptions) -> Self {
        let inner = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()
            .expect("failed to build reqwest client");
        Self { inner, options }
    }

    fn build_request(
        &self,
        req: reqwest::RequestBuilder,
        opts: &RequestOptions,
    ) -> reqwest::RequestBuilder {
        let mut req = req;
        if let Some(headers) = &opts.headers {
            for (k, v) in headers.iter() {
                req = req.header(k, v);
            }
        }
        if let Some(range) = opts.byte_range {
            req = req.header("Range", range.to_header_value());
        }
        req
    }

    fn collect_headers(resp: &reqwest::Response) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str(), v);
            }
        }
        headers
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn get(&self, url: Url, opts: RequestOptions) -> NetResult<Response> {
        let timeout = opts.timeout.unwrap_or(self.options.request_timeout);
        let req = self.build_request(self.inner.get(url.clone()), &opts).timeout(timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status().as_u16();
        let headers = Self::collect_headers(&resp);

        if !resp.status().is_success() {
            return Err(NetError::http_status(status, url.to_string()));
        }

        let bytes = resp.bytes().await.map_err(NetError::from)?;
        Ok(Response {
            bytes,
            headers,
            status,
        })
    }

    async fn stream(&self, url: Url, opts: RequestOptions) -> NetResult<ByteStream> {
        // No default timeout while streaming; body transfers can take
        // arbitrary time and are paced by the consumer.
        let mut req = self.build_request(self.inner.get(url.clone()), &opts);
        if let Some(timeout) = opts.timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();

        if !status.is_success() {
            return Err(NetError::http_status(status.as_u16(), url.to_string()));
        }

        let stream = resp.bytes_stream().map_err(NetError::from);
        Ok(Box::pin(stream))
    }

    async fn head(&self, url: Url, opts: RequestOptions) -> NetResult<Headers> {
        let timeout = opts.timeout.unwrap_or(self.options.request_timeout);
        let req = self.build_request(self.inner.head(url.clone()), &opts).timeout(timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();

        if !status.is_success() {
            return Err(NetError::http_status(status.as_u16(), url.to_string()));
        }

        Ok(Self::collect_headers(&resp))
    }
}
