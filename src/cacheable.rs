//! Cacheability rules: which responses may be written to cache storage.

use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::plugin::{Hook, Plugin};
use crate::strategies::StrategyHandler;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A rule deciding whether a response is cacheable, based on its status
/// and/or headers.
///
/// When both are configured, the status must be listed **and** at least one
/// configured header must have the configured value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheableResponse {
    statuses: Option<Vec<u16>>,
    headers: Option<BTreeMap<String, String>>,
}

impl CacheableResponse {
    /// # Errors
    ///
    /// Returns `Error::CacheableConfigInvalid` when neither statuses nor
    /// headers are given.
    pub fn new(
        statuses: Option<Vec<u16>>,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Self> {
        if statuses.is_none() && headers.is_none() {
            return Err(Error::CacheableConfigInvalid);
        }
        Ok(CacheableResponse {
            statuses,
            headers: headers.map(|h| {
                h.into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect()
            }),
        })
    }

    /// Rule on statuses only.
    pub fn with_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        CacheableResponse {
            statuses: Some(statuses.into_iter().collect()),
            headers: None,
        }
    }

    pub fn is_response_cacheable(&self, response: &Response) -> bool {
        let mut cacheable = true;

        if let Some(statuses) = &self.statuses {
            cacheable = statuses.contains(&response.status);
        }

        if let (Some(headers), true) = (&self.headers, cacheable) {
            cacheable = headers
                .iter()
                .any(|(name, value)| response.headers.get(name) == Some(value.as_str()));
        }

        if !cacheable {
            debug!(
                "Response with status {} is not cacheable under {:?}",
                response.status, self
            );
        }
        cacheable
    }
}

/// Plugin applying a [`CacheableResponse`] rule in `cache_will_update`.
#[derive(Clone, Debug)]
pub struct CacheableResponsePlugin {
    rule: CacheableResponse,
}

impl CacheableResponsePlugin {
    pub fn new(
        statuses: Option<Vec<u16>>,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Self> {
        Ok(CacheableResponsePlugin {
            rule: CacheableResponse::new(statuses, headers)?,
        })
    }
}

impl From<CacheableResponse> for CacheableResponsePlugin {
    fn from(rule: CacheableResponse) -> Self {
        CacheableResponsePlugin { rule }
    }
}

#[async_trait]
impl Plugin for CacheableResponsePlugin {
    fn handles(&self, hook: Hook) -> bool {
        hook == Hook::CacheWillUpdate
    }

    async fn cache_will_update(
        &self,
        _handler: &StrategyHandler,
        _request: &Request,
        response: Response,
    ) -> Result<Option<Response>> {
        Ok(self
            .rule
            .is_response_cacheable(&response)
            .then_some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_requires_statuses_or_headers() {
        assert!(matches!(
            CacheableResponse::new(None, None),
            Err(Error::CacheableConfigInvalid)
        ));
    }

    #[test]
    fn test_statuses_only() {
        let rule = CacheableResponse::with_statuses([0, 200]);
        assert!(rule.is_response_cacheable(&Response::ok("x")));
        assert!(rule.is_response_cacheable(&Response::opaque()));
        assert!(!rule.is_response_cacheable(&Response::new(404, "")));
    }

    #[test]
    fn test_headers_any_match() {
        let rule =
            CacheableResponse::new(None, Some(headers(&[("X-Is-Cacheable", "true")]))).unwrap();
        assert!(rule.is_response_cacheable(&Response::ok("").with_header("x-is-cacheable", "true")));
        assert!(!rule.is_response_cacheable(&Response::ok("").with_header("x-is-cacheable", "false")));
        assert!(!rule.is_response_cacheable(&Response::ok("")));
    }

    #[test]
    fn test_status_and_header_both_required() {
        let rule = CacheableResponse::new(
            Some(vec![200]),
            Some(headers(&[("x-is-cacheable", "true")])),
        )
        .unwrap();
        let tagged_404 = Response::new(404, "").with_header("x-is-cacheable", "true");
        assert!(!rule.is_response_cacheable(&tagged_404));
        let tagged_200 = Response::ok("").with_header("x-is-cacheable", "true");
        assert!(rule.is_response_cacheable(&tagged_200));
    }
}
