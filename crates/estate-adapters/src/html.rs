//! Listing source over paginated HTML search result pages.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use estate_core::ListingType;
use estate_storage::HttpFetcher;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{AdapterContext, ListingSource, RawRecord, SourceError};

/// Card selectors in order of preference; the first one matching anything wins.
const CARD_SELECTORS: &[&str] = &[
    r#"[data-test-id="search-result-item"]"#,
    "div.search-result",
    "[data-object-id]",
];

const ADDRESS_SELECTORS: &[&str] = &["h2", r#"[data-test-id="street-name-house-number"]"#];

const PRICE_SELECTORS: &[&str] = &[
    "span.search-result-price",
    r#"[data-test-id="price-label"]"#,
    ".object-price",
    r#"span[title*="Vraagprijs"]"#,
];

const POSTAL_CITY_SELECTOR: &str = r#"[data-test-id="postal-code-city"]"#;

static LINK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[/-](\d{5,})(?:[/-]|$)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSourceConfig {
    pub source: String,
    pub city: String,
    /// Search URLs; `{page}` is replaced by the 1-based page number.
    pub listing_urls: Vec<String>,
    pub max_pages: u32,
    #[serde(default)]
    pub listing_type: ListingType,
}

pub struct HtmlListingSource {
    config: HtmlSourceConfig,
    fetcher: Arc<HttpFetcher>,
}

impl HtmlListingSource {
    pub fn new(config: HtmlSourceConfig, fetcher: Arc<HttpFetcher>) -> Self {
        Self { config, fetcher }
    }

    pub fn config(&self) -> &HtmlSourceConfig {
        &self.config
    }

    fn first_page_url(&self) -> Result<String, SourceError> {
        self.config
            .listing_urls
            .first()
            .map(|template| page_url(template, 1))
            .ok_or_else(|| {
                SourceError::Permanent(format!("{} has no listing urls", self.config.source))
            })
    }
}

pub fn page_url(template: &str, page: u32) -> String {
    template.replace("{page}", &page.to_string())
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Permanent(format!("selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(card: &ElementRef<'_>, selectors: &[&str]) -> Result<Option<String>, SourceError> {
    for css in selectors {
        let sel = selector(css)?;
        if let Some(text) = card
            .select(&sel)
            .next()
            .and_then(|n| text_or_none(n.text().collect::<String>()))
        {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn first_href(card: &ElementRef<'_>) -> Result<Option<String>, SourceError> {
    let sel = selector("a[href]")?;
    Ok(card
        .select(&sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| text_or_none(href.to_string())))
}

/// Resolves root-relative links against the origin of `base`.
fn absolute_url(base: &str, href: &str) -> String {
    if !href.starts_with('/') || href.starts_with("//") {
        return href.to_string();
    }
    let origin = base
        .find("://")
        .map(|scheme_end| {
            let host_start = scheme_end + 3;
            base[host_start..]
                .find('/')
                .map_or(base, |path_start| &base[..host_start + path_start])
        })
        .unwrap_or_default();
    format!("{origin}{href}")
}

/// Extracts one raw record per recognizable card. An empty result means no cards matched.
pub fn parse_search_page(
    html: &str,
    config: &HtmlSourceConfig,
    page_url: &str,
    ctx: &AdapterContext,
) -> Result<Vec<RawRecord>, SourceError> {
    let document = Html::parse_document(html);

    let mut cards = Vec::new();
    for css in CARD_SELECTORS {
        let sel = selector(css)?;
        cards = document.select(&sel).collect::<Vec<_>>();
        if !cards.is_empty() {
            break;
        }
    }

    let mut records = Vec::with_capacity(cards.len());
    for card in &cards {
        let href = first_href(card)?;
        let source_id = card
            .value()
            .attr("data-object-id")
            .and_then(|id| text_or_none(id.to_string()))
            .or_else(|| {
                href.as_deref()
                    .and_then(|h| LINK_ID_RE.captures(h))
                    .map(|caps| caps[1].to_string())
            });
        let Some(source_id) = source_id else {
            debug!(source = %config.source, "card without object id skipped");
            continue;
        };

        let mut record = RawRecord::new()
            .with("source_id", source_id)
            .with("city", config.city.clone())
            .with("listing_type", config.listing_type.as_str())
            .with("scraped_at", ctx.fetched_at.to_rfc3339());

        if let Some(address) = first_text(card, ADDRESS_SELECTORS)? {
            record.insert("address", address);
        }
        if let Some(postal) = first_text(card, &[POSTAL_CITY_SELECTOR])? {
            record.insert("postal_code", postal);
        }
        if let Some(price) = first_text(card, PRICE_SELECTORS)? {
            record.insert("price_text", price);
        }
        if let Some(text) = text_or_none(card.text().collect::<Vec<_>>().join(" ")) {
            record.insert("description", text);
        }
        if let Some(href) = href {
            record.insert("url", absolute_url(page_url, &href));
        }
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl ListingSource for HtmlListingSource {
    fn source(&self) -> &str {
        &self.config.source
    }

    async fn probe(&self) -> Result<(), SourceError> {
        let url = self.first_page_url()?;
        self.fetcher.fetch_once(&url).await?;
        Ok(())
    }

    /// Walks every listing URL page by page.
    ///
    /// A URL whose first page fails or shows no cards is skipped; the error is only
    /// returned when no URL produced any record.
    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawRecord>, SourceError> {
        let mut all = Vec::new();
        let mut first_failure = None;
        if self.config.listing_urls.is_empty() {
            return Err(SourceError::Permanent(format!(
                "{} has no listing urls",
                self.config.source
            )));
        }

        for template in &self.config.listing_urls {
            let last_page = if template.contains("{page}") {
                self.config.max_pages.max(1)
            } else {
                1
            };

            for page in 1..=last_page {
                let url = page_url(template, page);
                let response = match self
                    .fetcher
                    .fetch_bytes(ctx.run_id, &self.config.source, &url)
                    .await
                {
                    Ok(response) => response,
                    Err(err) if page == 1 => {
                        warn!(source = %self.config.source, %url, "skipping listing url: {err}");
                        first_failure.get_or_insert(SourceError::from(err));
                        break;
                    }
                    Err(err) => {
                        warn!(source = %self.config.source, page, "stopping pagination: {err}");
                        break;
                    }
                };

                let records = parse_search_page(&response.text(), &self.config, &url, ctx)?;
                if records.is_empty() {
                    if page == 1 {
                        warn!(source = %self.config.source, %url, "no listing cards recognized");
                        first_failure.get_or_insert(SourceError::Permanent(format!(
                            "no listing cards recognized on {url}"
                        )));
                    } else {
                        debug!(source = %self.config.source, page, "empty page, done");
                    }
                    break;
                }
                info!(source = %self.config.source, page, cards = records.len(), "parsed page");
                all.extend(records);
            }
        }

        match first_failure {
            Some(err) if all.is_empty() => Err(err),
            _ => Ok(all),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{normalize, TransientCause};
    use axum::extract::State;
    use axum::http::{StatusCode, Uri};
    use axum::Router;
    use estate_core::PropertyType;
    use estate_storage::{BackoffPolicy, HttpClientConfig, ManualClock};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    const SEARCH_PAGE: &str = r#"
        <html><body>
          <ol>
            <li data-test-id="search-result-item" data-object-id="43011111">
              <a href="/koop/amsterdam/appartement-43011111-prinsengracht-263/">
                <h2>Prinsengracht 263</h2>
              </a>
              <div data-test-id="postal-code-city">1016 GV Amsterdam</div>
              <p data-test-id="price-label">€ 895.000 k.k.</p>
              <ul><li>110 m²</li><li>4 kamers</li><li>Appartement</li></ul>
            </li>
            <li data-test-id="search-result-item">
              <a href="https://www.funda.nl/koop/amsterdam/huis-43022222-damrak-12/">
                <h2>Damrak 12</h2>
              </a>
              <p data-test-id="price-label">€ 1.250.000 v.o.n.</p>
              <ul><li>180 m²</li><li>6 kamers</li><li>Woonhuis</li></ul>
            </li>
            <li data-test-id="search-result-item">
              <h2>Card without any id</h2>
            </li>
          </ol>
        </body></html>
    "#;

    fn config() -> HtmlSourceConfig {
        HtmlSourceConfig {
            source: "funda".into(),
            city: "Amsterdam".into(),
            listing_urls: vec!["https://www.funda.nl/koop/amsterdam/p{page}/".into()],
            max_pages: 3,
            listing_type: ListingType::Sale,
        }
    }

    #[test]
    fn parses_cards_into_raw_records() {
        let ctx = AdapterContext::new(Uuid::nil());
        let records = parse_search_page(
            SEARCH_PAGE,
            &config(),
            "https://www.funda.nl/koop/amsterdam/p1/",
            &ctx,
        )
        .unwrap();

        assert_eq!(records.len(), 2);
        let first = normalize("funda", &records[0], ctx.fetched_at);
        assert_eq!(first.source_id.as_deref(), Some("43011111"));
        assert_eq!(first.address.as_deref(), Some("Prinsengracht 263"));
        assert_eq!(first.postal_code.as_deref(), Some("1016GV"));
        assert_eq!(first.price, Some(895_000.0));
        assert_eq!(first.size_m2, Some(110.0));
        assert_eq!(first.rooms, Some(4));
        assert_eq!(first.property_type, PropertyType::Apartment);
        assert_eq!(
            first.url.as_deref(),
            Some("https://www.funda.nl/koop/amsterdam/appartement-43011111-prinsengracht-263/")
        );

        let second = normalize("funda", &records[1], ctx.fetched_at);
        assert_eq!(second.source_id.as_deref(), Some("43022222"));
        assert_eq!(second.price, Some(1_250_000.0));
        assert_eq!(second.property_type, PropertyType::House);
        assert_eq!(second.city.as_deref(), Some("Amsterdam"));
    }

    #[test]
    fn falls_back_to_legacy_card_markup() {
        let html = r#"<div class="search-result" data-object-id="777">
            <h2>Coolsingel 40</h2><span class="search-result-price">€ 310.000 k.k.</span>
        </div>"#;
        let ctx = AdapterContext::new(Uuid::nil());
        let records = parse_search_page(html, &config(), "https://example.test/p1/", &ctx).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text(&["source_id"]).as_deref(), Some("777"));
        assert_eq!(
            records[0].text(&["price_text"]).as_deref(),
            Some("€ 310.000 k.k.")
        );
    }

    #[test]
    fn unrecognized_markup_yields_no_records() {
        let ctx = AdapterContext::new(Uuid::nil());
        let records =
            parse_search_page("<html><body><p>Captcha</p></body></html>", &config(), "", &ctx)
                .unwrap();
        assert!(records.is_empty());
    }

    type Hits = Arc<Mutex<Vec<String>>>;

    fn card(id: u32) -> String {
        format!(
            r#"<li data-test-id="search-result-item" data-object-id="{id}">
                 <h2>Keizersgracht {id}</h2><p data-test-id="price-label">€ 450.000 k.k.</p>
               </li>"#
        )
    }

    async fn serve_page(State(hits): State<Hits>, uri: Uri) -> (StatusCode, String) {
        let path = uri.path().to_string();
        hits.lock().unwrap().push(path.clone());
        let page = |ids: &[u32]| {
            let cards = ids.iter().map(|id| card(*id)).collect::<String>();
            (StatusCode::OK, format!("<html><body><ol>{cards}</ol></body></html>"))
        };
        match path.as_str() {
            "/a/p1/" => page(&[1001, 1002]),
            "/a/p2/" => page(&[1003]),
            "/a/p3/" => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
            "/short/p1/" => page(&[2001]),
            "/short/p2/" => page(&[]),
            "/short/p3/" => page(&[2003]),
            "/flat/" => page(&[3001]),
            "/empty/p1/" => page(&[]),
            "/busy/p1/" => (StatusCode::SERVICE_UNAVAILABLE, String::new()),
            _ => (StatusCode::NOT_FOUND, String::new()),
        }
    }

    async fn spawn_site() -> (String, Hits) {
        let hits = Hits::default();
        let app = Router::new().fallback(serve_page).with_state(hits.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn site_source(base: &str, paths: &[&str], max_pages: u32) -> HtmlListingSource {
        let client = HttpClientConfig {
            backoff: BackoffPolicy {
                max_attempts: 2,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        };
        let fetcher = HttpFetcher::new(client, Arc::new(ManualClock::new())).unwrap();
        let config = HtmlSourceConfig {
            listing_urls: paths.iter().map(|p| format!("{base}{p}")).collect(),
            max_pages,
            ..config()
        };
        HtmlListingSource::new(config, Arc::new(fetcher))
    }

    fn ids(records: &[RawRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| r.text(&["source_id"]))
            .collect()
    }

    fn hit_count(hits: &Hits, path: &str) -> usize {
        hits.lock().unwrap().iter().filter(|p| *p == path).count()
    }

    #[tokio::test]
    async fn pages_accumulate_until_a_page_fails() {
        let (base, hits) = spawn_site().await;
        let ctx = AdapterContext::new(Uuid::nil());
        let records = site_source(&base, &["/a/p{page}/"], 3)
            .fetch(&ctx)
            .await
            .unwrap();
        assert_eq!(ids(&records), ["1001", "1002", "1003"]);
        assert_eq!(hit_count(&hits, "/a/p3/"), 2);
    }

    #[tokio::test]
    async fn failing_later_url_keeps_earlier_records() {
        let (base, _) = spawn_site().await;
        let ctx = AdapterContext::new(Uuid::nil());
        let records = site_source(&base, &["/a/p{page}/", "/b/p{page}/", "/empty/p{page}/"], 2)
            .fetch(&ctx)
            .await
            .unwrap();
        assert_eq!(ids(&records), ["1001", "1002", "1003"]);
    }

    #[tokio::test]
    async fn failing_first_url_does_not_block_the_next() {
        let (base, _) = spawn_site().await;
        let ctx = AdapterContext::new(Uuid::nil());
        let records = site_source(&base, &["/b/p{page}/", "/flat/"], 2)
            .fetch(&ctx)
            .await
            .unwrap();
        assert_eq!(ids(&records), ["3001"]);
    }

    #[tokio::test]
    async fn nothing_collected_reports_the_failure() {
        let (base, _) = spawn_site().await;
        let ctx = AdapterContext::new(Uuid::nil());

        let missing = site_source(&base, &["/b/p{page}/"], 2).fetch(&ctx).await;
        assert!(matches!(missing, Err(SourceError::Permanent(_))));

        let blank = site_source(&base, &["/empty/p{page}/"], 2).fetch(&ctx).await;
        assert!(matches!(blank, Err(SourceError::Permanent(msg)) if msg.contains("no listing cards")));
    }

    #[tokio::test]
    async fn empty_page_ends_pagination() {
        let (base, hits) = spawn_site().await;
        let ctx = AdapterContext::new(Uuid::nil());
        let records = site_source(&base, &["/short/p{page}/"], 3)
            .fetch(&ctx)
            .await
            .unwrap();
        assert_eq!(ids(&records), ["2001"]);
        assert_eq!(hit_count(&hits, "/short/p3/"), 0);
    }

    #[tokio::test]
    async fn url_without_page_placeholder_is_fetched_once() {
        let (base, hits) = spawn_site().await;
        let ctx = AdapterContext::new(Uuid::nil());
        let records = site_source(&base, &["/flat/"], 3).fetch(&ctx).await.unwrap();
        assert_eq!(ids(&records), ["3001"]);
        assert_eq!(hit_count(&hits, "/flat/"), 1);
    }

    #[tokio::test]
    async fn probe_classifies_the_first_page() {
        let (base, hits) = spawn_site().await;
        site_source(&base, &["/a/p{page}/"], 3).probe().await.unwrap();
        assert_eq!(hit_count(&hits, "/a/p1/"), 1);

        let missing = site_source(&base, &["/b/p{page}/"], 3).probe().await;
        assert!(matches!(missing, Err(SourceError::Permanent(_))));

        let busy = site_source(&base, &["/busy/p{page}/"], 3).probe().await;
        assert!(matches!(
            busy,
            Err(SourceError::Transient(TransientCause::ServerError(503)))
        ));
    }

    #[test]
    fn page_urls_and_links_resolve() {
        assert_eq!(
            page_url("https://www.funda.nl/koop/utrecht/p{page}/", 2),
            "https://www.funda.nl/koop/utrecht/p2/"
        );
        assert_eq!(
            absolute_url("https://www.funda.nl/koop/utrecht/p2/", "/detail/1/"),
            "https://www.funda.nl/detail/1/"
        );
        assert_eq!(
            absolute_url("https://www.funda.nl", "/detail/1/"),
            "https://www.funda.nl/detail/1/"
        );
        assert_eq!(
            absolute_url("https://a.test/x", "https://b.test/y"),
            "https://b.test/y"
        );
    }
}
