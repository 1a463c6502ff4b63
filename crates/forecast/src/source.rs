//! Seam between the coordinator and whatever fetches raw payloads.

use common::{FetchError, Location};
use futures_util::future::BoxFuture;
use pleinchamp_client::{PleinchampClient, RawPayload};

/// A single-attempt forecast fetch. Implementations must not retry.
pub trait ForecastSource: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        location: &'a Location,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<RawPayload, FetchError>>;
}

impl ForecastSource for PleinchampClient {
    fn fetch<'a>(
        &'a self,
        location: &'a Location,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<RawPayload, FetchError>> {
        Box::pin(PleinchampClient::fetch(self, location, api_key))
    }
}
