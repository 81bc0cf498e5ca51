//! Provider adapter contracts + marketplace adapter implementations.
//!
//! Each [`Provider`] declares how a query becomes a request and which
//! [`ExtractionStrategy`] pulls the raw result list out of its response.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use scout_core::{Domain, Keyword, RawItem, Severity, SourceDescriptor, TelemetrySink};
use scout_storage::{FetchError, FetchRequest, HttpFetcher, JitterWindow};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{
    canonical_url, normalize, normalize_with, price_text, unwrap_redirect, FieldMap, DEFAULT_FIELDS,
};

pub const CRATE_NAME: &str = "scout-adapters";

pub const DEFAULT_TOP_N: usize = 20;
pub const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search";
pub const EBAY_SEARCH_URL: &str = "https://www.ebay.com/sch/i.html";

/// eBay's "newly listed first" sort order.
const EBAY_SORT_NEWEST: &str = "10";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no result list under any of {candidates:?}")]
    ShapeMismatch { candidates: Vec<&'static str> },
    #[error("{provider} needs a SerpAPI key")]
    MissingCredentials { provider: &'static str },
    #[error("{provider} does not support site-scoped search")]
    SiteUnsupported { provider: &'static str },
    #[error("provider reported an error: {0}")]
    Provider(String),
    #[error("invalid provider payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// Canonical query handed to an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub keyword: Keyword,
    pub site: Option<Domain>,
}

impl SearchQuery {
    pub fn new(keyword: Keyword, site: Option<Domain>) -> Self {
        Self { keyword, site }
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.site {
            Some(site) => write!(f, "site:{} {}", site, self.keyword),
            None => write!(f, "{}", self.keyword),
        }
    }
}

pub struct SearchContext<'a> {
    pub sweep_id: Uuid,
    pub telemetry: &'a dyn TelemetrySink,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    pub items: Vec<RawItem>,
    pub error: Option<String>,
}

impl SearchOutcome {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;

    fn field_map(&self) -> &FieldMap {
        &DEFAULT_FIELDS
    }

    fn max_items(&self) -> usize {
        DEFAULT_TOP_N
    }

    async fn fetch_items(
        &self,
        ctx: &SearchContext<'_>,
        query: &SearchQuery,
    ) -> Result<Vec<RawItem>, AdapterError>;

    /// Never fails: provider errors become an empty result plus a `COLLECTOR`
    /// telemetry event naming the provider, query and error.
    async fn search_outcome(&self, ctx: &SearchContext<'_>, query: &SearchQuery) -> SearchOutcome {
        match self.fetch_items(ctx, query).await {
            Ok(mut items) => {
                items.truncate(self.max_items());
                info!(provider = self.provider_id(), query = %query, count = items.len(), "provider search complete");
                ctx.telemetry.emit(
                    "COLLECTOR",
                    &format!("{} results from {} for {:?}", items.len(), self.provider_id(), query.to_string()),
                    Severity::Info,
                );
                SearchOutcome { items, error: None }
            }
            Err(err) => {
                warn!(provider = self.provider_id(), query = %query, error = %err, "provider search failed");
                ctx.telemetry.emit(
                    "COLLECTOR",
                    &format!("provider={} query={:?} error={}", self.provider_id(), query.to_string(), err),
                    Severity::Warn,
                );
                SearchOutcome {
                    items: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn search(&self, ctx: &SearchContext<'_>, query: &SearchQuery) -> Vec<RawItem> {
        self.search_outcome(ctx, query).await.items
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtmlSelectors {
    pub item: &'static str,
    pub title: &'static str,
    pub link: &'static str,
    pub price: &'static str,
}

/// How a provider's response body is turned into raw items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// JSON body; the result list sits under the first present list-typed
    /// field of `list_fields`.
    JsonResults {
        list_fields: &'static [&'static str],
        fields: FieldMap,
    },
    /// HTML listing page; each card becomes `{title, link, price}`. The first
    /// `skip` cards are placeholders.
    HtmlListing { selectors: HtmlSelectors, skip: usize },
}

impl ExtractionStrategy {
    pub fn field_map(&self) -> &FieldMap {
        match self {
            Self::JsonResults { fields, .. } => fields,
            Self::HtmlListing { .. } => &DEFAULT_FIELDS,
        }
    }

    pub fn extract_items(&self, body: &[u8]) -> Result<Vec<RawItem>, AdapterError> {
        match self {
            Self::JsonResults { list_fields, .. } => {
                let value: JsonValue = serde_json::from_slice(body)?;
                if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
                    return Err(AdapterError::Provider(message.to_string()));
                }
                resolve_result_list(&value, list_fields).ok_or_else(|| AdapterError::ShapeMismatch {
                    candidates: list_fields.to_vec(),
                })
            }
            Self::HtmlListing { selectors, skip } => extract_html_cards(body, selectors, *skip),
        }
    }
}

/// First candidate field holding an array wins; present-but-wrong-typed fields are skipped.
pub fn resolve_result_list(value: &JsonValue, candidates: &[&str]) -> Option<Vec<RawItem>> {
    candidates
        .iter()
        .find_map(|field| value.get(*field).and_then(|v| v.as_array()).cloned())
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(format!("bad selector {selector:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(card: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn extract_html_cards(
    body: &[u8],
    selectors: &HtmlSelectors,
    skip: usize,
) -> Result<Vec<RawItem>, AdapterError> {
    let text = String::from_utf8_lossy(body);
    let document = Html::parse_document(&text);
    let item = parse_selector(selectors.item)?;
    let title = parse_selector(selectors.title)?;
    let link = parse_selector(selectors.link)?;
    let price = parse_selector(selectors.price)?;

    let cards = document.select(&item).collect::<Vec<_>>();
    if cards.is_empty() {
        return Err(AdapterError::ShapeMismatch {
            candidates: vec![selectors.item],
        });
    }

    Ok(cards
        .iter()
        .skip(skip)
        .map(|card| {
            json!({
                "title": select_first_text(card, &title),
                "link": select_first_attr(card, &link, "href"),
                "price": select_first_text(card, &price),
            })
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Google web search; with a site this is the `site:<domain> <keyword>` dork.
    GoogleSite,
    GoogleShopping,
    Ebay,
    Amazon,
    /// eBay's public listing page, scraped directly.
    EbayListings,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::GoogleSite,
        Provider::GoogleShopping,
        Provider::Ebay,
        Provider::Amazon,
        Provider::EbayListings,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Self::GoogleSite => "google",
            Self::GoogleShopping => "google_shopping",
            Self::Ebay => "ebay",
            Self::Amazon => "amazon",
            Self::EbayListings => "ebay_listings",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    /// Providers known to block bursts of automated queries.
    pub fn rate_sensitive(&self) -> bool {
        matches!(self, Self::Ebay | Self::Amazon | Self::EbayListings)
    }

    pub fn supports_site(&self) -> bool {
        matches!(self, Self::GoogleSite | Self::GoogleShopping)
    }

    pub fn needs_api_key(&self) -> bool {
        !matches!(self, Self::EbayListings)
    }

    pub fn strategy(&self) -> ExtractionStrategy {
        match self {
            Self::GoogleSite => ExtractionStrategy::JsonResults {
                list_fields: &["organic_results", "results"],
                fields: FieldMap {
                    title: &["title"],
                    price: &["price", "extracted_price"],
                    url: &["link", "redirect_link", "url"],
                },
            },
            Self::GoogleShopping => ExtractionStrategy::JsonResults {
                list_fields: &["shopping_results", "inline_shopping_results", "organic_results"],
                fields: FieldMap {
                    title: &["title", "name"],
                    price: &["price", "extracted_price"],
                    url: &["product_link", "link", "url"],
                },
            },
            Self::Ebay => ExtractionStrategy::JsonResults {
                list_fields: &["organic_results", "search_results"],
                fields: FieldMap {
                    title: &["title"],
                    price: &["price", "extracted_price"],
                    url: &["link", "url"],
                },
            },
            Self::Amazon => ExtractionStrategy::JsonResults {
                list_fields: &["organic_results", "search_results", "product_results"],
                fields: FieldMap {
                    title: &["title", "name"],
                    price: &["price", "extracted_price", "prices"],
                    url: &["link_clean", "link", "url"],
                },
            },
            Self::EbayListings => ExtractionStrategy::HtmlListing {
                selectors: HtmlSelectors {
                    item: ".s-item__info",
                    title: ".s-item__title",
                    link: ".s-item__link",
                    price: ".s-item__price",
                },
                skip: 1,
            },
        }
    }

    fn serp_engine(&self) -> Option<&'static str> {
        match self {
            Self::GoogleSite => Some("google"),
            Self::GoogleShopping => Some("google_shopping"),
            Self::Ebay => Some("ebay"),
            Self::Amazon => Some("amazon"),
            Self::EbayListings => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketplaceSettings {
    pub api_key: Option<String>,
    pub serpapi_endpoint: String,
    pub ebay_search_url: String,
    pub top_n: usize,
    /// Applied only to rate-sensitive providers.
    pub jitter: Option<JitterWindow>,
}

impl Default for MarketplaceSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            serpapi_endpoint: SERPAPI_ENDPOINT.to_string(),
            ebay_search_url: EBAY_SEARCH_URL.to_string(),
            top_n: DEFAULT_TOP_N,
            jitter: Some(JitterWindow::default()),
        }
    }
}

pub struct MarketplaceAdapter {
    provider: Provider,
    strategy: ExtractionStrategy,
    http: Arc<HttpFetcher>,
    settings: MarketplaceSettings,
}

impl MarketplaceAdapter {
    pub fn new(provider: Provider, http: Arc<HttpFetcher>, settings: MarketplaceSettings) -> Self {
        Self {
            provider,
            strategy: provider.strategy(),
            http,
            settings,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn build_request(&self, query: &SearchQuery) -> Result<FetchRequest, AdapterError> {
        let provider = self.provider;
        if query.site.is_some() && !provider.supports_site() {
            return Err(AdapterError::SiteUnsupported {
                provider: provider.id(),
            });
        }

        let jitter = if provider.rate_sensitive() {
            self.settings.jitter
        } else {
            None
        };
        let keyword = query.keyword.as_str();

        let Some(engine) = provider.serp_engine() else {
            return Ok(FetchRequest::get(&self.settings.ebay_search_url)
                .param("_nkw", keyword)
                .param("_sop", EBAY_SORT_NEWEST)
                .with_jitter(jitter));
        };

        let api_key = self
            .settings
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(AdapterError::MissingCredentials {
                provider: provider.id(),
            })?;

        let request = FetchRequest::get(&self.settings.serpapi_endpoint).param("engine", engine);
        let request = match provider {
            Provider::GoogleSite | Provider::GoogleShopping => request
                .param("q", query.to_string())
                .param("num", self.settings.top_n.to_string()),
            Provider::Ebay => request.param("_nkw", keyword).param("_sop", EBAY_SORT_NEWEST),
            Provider::Amazon => request.param("k", keyword),
            Provider::EbayListings => request,
        };
        Ok(request.param("api_key", api_key).with_jitter(jitter))
    }
}

#[async_trait]
impl ProviderAdapter for MarketplaceAdapter {
    fn provider_id(&self) -> &str {
        self.provider.id()
    }

    fn field_map(&self) -> &FieldMap {
        self.strategy.field_map()
    }

    fn max_items(&self) -> usize {
        self.settings.top_n.max(1)
    }

    async fn fetch_items(
        &self,
        ctx: &SearchContext<'_>,
        query: &SearchQuery,
    ) -> Result<Vec<RawItem>, AdapterError> {
        let request = self.build_request(query)?;
        debug!(provider = self.provider.id(), query = %query, "querying provider");
        let response = self.http.fetch(ctx.sweep_id, self.provider.id(), &request).await?;
        self.strategy.extract_items(&response.body)
    }
}

/// Adapters available to a sweep, keyed by provider id, plus the adapter that
/// serves custom-site sources.
#[derive(Clone, Default)]
pub struct AdapterSet {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    site_search: Option<Arc<dyn ProviderAdapter>>,
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("providers", &self.provider_ids())
            .field(
                "site_search",
                &self.site_search.as_ref().map(|a| a.provider_id().to_string()),
            )
            .finish()
    }
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in provider over one shared fetcher; Google web search also
    /// serves custom sites.
    pub fn standard(http: Arc<HttpFetcher>, settings: MarketplaceSettings) -> Self {
        let mut set = Self::new();
        for provider in Provider::ALL {
            let adapter: Arc<dyn ProviderAdapter> =
                Arc::new(MarketplaceAdapter::new(provider, http.clone(), settings.clone()));
            if provider == Provider::GoogleSite {
                set.site_search = Some(adapter.clone());
            }
            set.providers.insert(provider.id().to_string(), adapter);
        }
        set
    }

    pub fn with_provider(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.insert(adapter.provider_id().to_string(), adapter);
        self
    }

    pub fn with_site_search(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.site_search = Some(adapter);
        self
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids = self.providers.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// The adapter for `source` and the site it should be scoped to.
    pub fn resolve(&self, source: &SourceDescriptor) -> Option<(Arc<dyn ProviderAdapter>, Option<Domain>)> {
        match source {
            SourceDescriptor::Provider(id) => self.providers.get(id).map(|a| (a.clone(), None)),
            SourceDescriptor::Site(domain) => self
                .site_search
                .as_ref()
                .map(|a| (a.clone(), Some(domain.clone()))),
        }
    }
}
