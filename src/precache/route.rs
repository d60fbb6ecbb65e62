//! Route matching requests against the precache manifest.

use super::controller::{PrecacheController, SharedManifest};
use super::strategy::PrecacheStrategy;
use crate::config::PrecacheRouteOptions;
use crate::error::Result;
use crate::http::{strip_fragment, strip_search_params};
use crate::router::{MatchInput, Route, RouteMatcher};
use crate::strategies::HandlerParams;
use regex::Regex;
use std::sync::Arc;
use url::Url;

/// Extra URL variations to try, derived from the request URL.
pub type UrlManipulation = Arc<dyn Fn(&Url) -> Vec<Url> + Send + Sync>;

/// Matches a request when one of its URL variations is precached.
///
/// Variations are tried in order:
///
/// 1. the URL without its fragment
/// 2. without search parameters matching `ignore_url_parameters_matching`
/// 3. with `directory_index` appended, when the path ends in `/`
/// 4. with `.html` appended, when `clean_urls` is set
/// 5. the results of each URL manipulation
#[derive(Clone)]
pub struct PrecacheRoute {
    manifest: SharedManifest,
    strategy: PrecacheStrategy,
    options: PrecacheRouteOptions,
    ignored: Vec<Regex>,
    manipulations: Vec<UrlManipulation>,
}

impl PrecacheRoute {
    /// # Errors
    ///
    /// Returns `Error::ConfigError` when an ignored-parameter pattern is not
    /// a valid regular expression.
    pub fn new(controller: &PrecacheController, options: PrecacheRouteOptions) -> Result<Self> {
        let ignored = options
            .ignore_url_parameters_matching
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| crate::error::Error::ConfigError(format!("Invalid pattern: {}", e)))?;

        Ok(PrecacheRoute {
            manifest: controller.manifest(),
            strategy: controller.strategy().clone(),
            options,
            ignored,
            manipulations: Vec::new(),
        })
    }

    pub fn with_url_manipulation(mut self, manipulation: UrlManipulation) -> Self {
        self.manipulations.push(manipulation);
        self
    }

    /// Candidate URLs for `url`, in the order they are tried.
    pub fn url_variations(&self, url: &Url) -> Vec<Url> {
        let url = strip_fragment(url);
        let mut variations = vec![url.clone()];

        let stripped = strip_search_params(&url, |name| {
            self.ignored.iter().any(|pattern| pattern.is_match(name))
        });
        variations.push(stripped.clone());

        if let Some(index) = &self.options.directory_index {
            if stripped.path().ends_with('/') {
                let mut indexed = stripped.clone();
                indexed.set_path(&format!("{}{}", stripped.path(), index));
                variations.push(indexed);
            }
        }

        if self.options.clean_urls {
            let mut html = stripped.clone();
            html.set_path(&format!("{}.html", stripped.path()));
            variations.push(html);
        }

        for manipulation in &self.manipulations {
            variations.extend(manipulation(&stripped));
        }
        variations
    }

    /// Handler params for the first precached variation of `url`.
    pub fn match_url(&self, url: &Url) -> Option<HandlerParams> {
        let manifest = self.manifest.read();
        self.url_variations(url).into_iter().find_map(|candidate| {
            let cache_key = manifest.cache_key_for(&candidate)?;
            trace!("Precache route matched {} as {}", url, candidate);
            Some(HandlerParams {
                integrity: manifest.integrity_for(&cache_key),
                cache_key: Some(cache_key),
                ..Default::default()
            })
        })
    }

    /// A route answering matched requests with the precache strategy.
    pub fn into_route(self) -> Route {
        let strategy = self.strategy.clone();
        let matcher = RouteMatcher::custom(move |input: &MatchInput<'_>| self.match_url(input.url));
        Route::new(matcher, Arc::new(strategy))
    }
}
