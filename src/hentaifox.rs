use crate::config::SiteConfig;
use crate::site::{GalleryInfo, SearchResult, SiteProvider};
use regex::Regex;
use scraper::{Html, Selector};
use std::io::Read;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use url::Url;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const HTTP_TIMEOUT_SECS: u64 = 5;

/// Listing pages carry 20 thumbnails when full; a full page with no visible
/// pagination still implies a following page.
const FULL_LISTING_PAGE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    All,
    Title,
    Tag,
    Artist,
}

impl SearchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Title => "title",
            Self::Tag => "tag",
            Self::Artist => "artist",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "title" => Some(Self::Title),
            "tag" => Some(Self::Tag),
            "artist" => Some(Self::Artist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSort {
    Newest,
    Popular,
    MostViewed,
    TopRated,
}

impl SearchSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Newest => "newest",
            Self::Popular => "popular",
            Self::MostViewed => "most_viewed",
            Self::TopRated => "top_rated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "newest" => Some(Self::Newest),
            "popular" => Some(Self::Popular),
            "most_viewed" => Some(Self::MostViewed),
            "top_rated" => Some(Self::TopRated),
            _ => None,
        }
    }
}

/// Scraping provider for hentaifox.com listings and gallery pages.
pub struct HentaiFoxProvider {
    config: SiteConfig,
    agent: ureq::Agent,
    gallery_re: Regex,
    last_fetch: Mutex<Option<Instant>>,
}

impl HentaiFoxProvider {
    pub fn new(config: &SiteConfig) -> Self {
        let mut agent_config = ureq::Agent::config_builder();
        agent_config = agent_config
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(HTTP_TIMEOUT_SECS)))
            .user_agent(DEFAULT_USER_AGENT);
        let agent: ureq::Agent = agent_config.build().into();

        Self {
            config: config.clone(),
            agent,
            gallery_re: Regex::new(r"hentaifox\.com/gallery/(\d+)").expect("gallery url pattern"),
            last_fetch: Mutex::new(None),
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Search with an explicit match kind and sort order. The trait methods
    /// funnel through here with their defaults.
    pub fn search_with(
        &self,
        query: &str,
        page: u32,
        kind: SearchKind,
        sort: SearchSort,
    ) -> Option<SearchResult> {
        let query = query.trim();
        let page = page.max(1);
        let url = self.build_search_url(query, page, kind, sort);

        let html = match kind {
            SearchKind::Tag | SearchKind::Artist => {
                // Unknown tag and artist slugs 404; fall back to a plain
                // text search so close misses still return something.
                match self.fetch(&url)? {
                    (404, _) => {
                        let fallback =
                            self.build_search_url(query, page, SearchKind::All, sort);
                        let (status, body) = self.fetch(&fallback)?;
                        if status >= 400 {
                            return None;
                        }
                        body
                    }
                    (status, _) if status >= 400 => return None,
                    (_, body) => body,
                }
            }
            _ => self.fetch_html(&url)?,
        };

        let document = Html::parse_document(&html);
        Some(self.parse_search_page(&document, page))
    }

    fn build_search_url(&self, query: &str, page: u32, kind: SearchKind, sort: SearchSort) -> String {
        let base = self.base_url();
        if query.is_empty() {
            return match sort {
                SearchSort::Newest => format!("{base}/?page={page}"),
                SearchSort::Popular => format!("{base}/popular/?page={page}"),
                SearchSort::MostViewed => format!("{base}/most-viewed/?page={page}"),
                SearchSort::TopRated => format!("{base}/top-rated/?page={page}"),
            };
        }

        match kind {
            SearchKind::Tag => {
                format!("{base}/tag/{}/?page={page}", slugify(query))
            }
            SearchKind::Artist => {
                format!("{base}/artist/{}/?page={page}", slugify(query))
            }
            SearchKind::Title => {
                format!("{base}/search/?q={}&page={page}&type=title", encode_query(query))
            }
            SearchKind::All => {
                let mut url = format!("{base}/search/?q={}&page={page}", encode_query(query));
                match sort {
                    SearchSort::Newest => {}
                    SearchSort::Popular => url.push_str("&sort=popular"),
                    SearchSort::MostViewed => url.push_str("&sort=views"),
                    SearchSort::TopRated => url.push_str("&sort=rating"),
                }
                url
            }
        }
    }

    fn parse_search_page(&self, document: &Html, page: u32) -> SearchResult {
        let galleries = self.parse_gallery_list(document);
        let (total_pages, has_next) = parse_pagination(document, page, galleries.len());
        let total_count = total_pages.map(|tp| galleries.len() as u64 * u64::from(tp));

        SearchResult {
            galleries,
            total_count,
            current_page: page,
            total_pages,
            has_next,
        }
    }

    fn parse_gallery_list(&self, document: &Html) -> Vec<GalleryInfo> {
        let thumb_sel = Selector::parse("div.thumb").expect("thumb selector");
        let link_sel = Selector::parse("a[href*=\"/gallery/\"]").expect("gallery link selector");
        let title_sel = Selector::parse("div.caption h2.g_title a").expect("title selector");
        let caption_sel = Selector::parse("div.caption").expect("caption selector");
        let img_sel = Selector::parse("img").expect("img selector");

        let base = Url::parse(self.base_url()).ok();
        let mut galleries = Vec::new();

        for thumb in document.select(&thumb_sel) {
            let Some(link) = thumb.select(&link_sel).next() else {
                continue;
            };
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let url = absolutize(base.as_ref(), href);
            let Some(id) = self.extract_gallery_id(&url) else {
                continue;
            };

            let title = thumb
                .select(&title_sel)
                .next()
                .map(element_text)
                .filter(|t| !t.is_empty())
                .or_else(|| {
                    thumb
                        .select(&caption_sel)
                        .next()
                        .map(element_text)
                        .filter(|t| !t.is_empty())
                })
                .unwrap_or_else(|| format!("Gallery {id}"));

            let thumbnail_url = thumb.select(&img_sel).next().and_then(|img| {
                img.value()
                    .attr("data-src")
                    .or_else(|| img.value().attr("src"))
                    .map(|src| absolutize(base.as_ref(), src))
            });

            galleries.push(GalleryInfo {
                id,
                title,
                url,
                tags: Vec::new(),
                artist: None,
                pages: None,
                description: None,
                thumbnail_url,
                metadata: None,
            });
        }

        galleries
    }

    fn parse_gallery_page(&self, document: &Html, id: &str, url: String) -> GalleryInfo {
        let title_sel = Selector::parse("h1").expect("title selector");
        let tag_sel = Selector::parse("a[href*=\"/tag/\"]").expect("tag selector");
        let artist_sel = Selector::parse("a[href*=\"/artist/\"]").expect("artist selector");
        let pages_sel = Selector::parse("span.i_text.pages").expect("pages selector");
        let cover_sel = Selector::parse("div.cover img").expect("cover selector");
        let pages_re = Regex::new(r"Pages:\s*(\d+)").expect("pages pattern");

        let base = Url::parse(self.base_url()).ok();

        let title = document
            .select(&title_sel)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| format!("Gallery {id}"));

        // Tag and artist anchors wrap the name in the first text node, with
        // the gallery-count badge in a following span.
        let mut tags: Vec<String> = Vec::new();
        for tag in document.select(&tag_sel) {
            let name = first_text(tag);
            if !name.is_empty() && !tags.contains(&name) {
                tags.push(name);
            }
        }
        let artist = document
            .select(&artist_sel)
            .next()
            .map(first_text)
            .filter(|a| !a.is_empty());

        let pages = document
            .select(&pages_sel)
            .next()
            .map(element_text)
            .and_then(|text| {
                pages_re
                    .captures(&text)
                    .and_then(|cap| cap[1].parse::<u32>().ok())
            });

        let thumbnail_url = document.select(&cover_sel).next().and_then(|img| {
            img.value()
                .attr("data-src")
                .or_else(|| img.value().attr("src"))
                .map(|src| absolutize(base.as_ref(), src))
        });

        GalleryInfo {
            id: id.to_string(),
            title,
            url,
            tags,
            artist,
            pages,
            description: None,
            thumbnail_url,
            metadata: None,
        }
    }

    fn fetch(&self, url: &str) -> Option<(u16, String)> {
        self.pace_requests();
        let mut response = self.agent.get(url).call().ok()?;
        let status = response.status().as_u16();
        let mut buf = Vec::new();
        response.body_mut().as_reader().read_to_end(&mut buf).ok()?;
        Some((status, String::from_utf8_lossy(&buf).into_owned()))
    }

    fn fetch_html(&self, url: &str) -> Option<String> {
        let (status, body) = self.fetch(url)?;
        if status >= 400 {
            None
        } else {
            Some(body)
        }
    }

    fn pace_requests(&self) {
        let secs = self.config.rate_limit_secs;
        let secs = if secs.is_finite() { secs.max(0.0) } else { 0.0 };
        let interval = Duration::from_secs_f64(secs);
        if interval.is_zero() {
            return;
        }

        let mut last = match self.last_fetch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

impl SiteProvider for HentaiFoxProvider {
    fn name(&self) -> &str {
        "hentaifox"
    }

    fn is_valid_url(&self, url: &str) -> bool {
        url.to_ascii_lowercase().contains("hentaifox.com")
    }

    fn extract_gallery_id(&self, url: &str) -> Option<String> {
        self.gallery_re
            .captures(url)
            .map(|cap| cap[1].to_string())
    }

    fn gallery_info(&self, url: &str) -> Option<GalleryInfo> {
        let id = self.extract_gallery_id(url)?;
        let canonical = format!("{}/gallery/{id}/", self.base_url());
        let html = self.fetch_html(&canonical)?;
        let document = Html::parse_document(&html);
        Some(self.parse_gallery_page(&document, &id, canonical))
    }

    fn search(&self, query: &str, page: u32) -> Option<SearchResult> {
        self.search_with(query, page, SearchKind::All, SearchSort::Newest)
    }

    fn tag_galleries(&self, tag: &str, page: u32) -> Option<SearchResult> {
        self.search_with(tag, page, SearchKind::Tag, SearchSort::Newest)
    }
}

fn slugify(value: &str) -> String {
    value.trim().to_lowercase().replace(' ', "-")
}

fn encode_query(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn absolutize(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(joined) => joined.to_string(),
        None => href.to_string(),
    }
}

fn element_text(el: scraper::ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first_text(el: scraper::ElementRef<'_>) -> String {
    el.text()
        .next()
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

fn parse_pagination(document: &Html, page: u32, gallery_count: usize) -> (Option<u32>, bool) {
    let page_link_sel =
        Selector::parse("div.pagination a, ul.pagination a, div.pager a").expect("pager selector");
    let page_href_re = Regex::new(r"(?:page=|/pag/)(\d+)").expect("page href pattern");

    let mut max_page: Option<u32> = None;
    let mut has_next_link = false;

    for link in document.select(&page_link_sel) {
        let text = element_text(link);
        if let Ok(n) = text.parse::<u32>() {
            max_page = Some(max_page.map_or(n, |m| m.max(n)));
        }

        let class = link.value().attr("class").unwrap_or("");
        let rel = link.value().attr("rel").unwrap_or("");
        if class.contains("next") || rel.contains("next") || text.contains('»') {
            has_next_link = true;
        }

        if let Some(href) = link.value().attr("href") {
            if let Some(cap) = page_href_re.captures(href) {
                if let Ok(n) = cap[1].parse::<u32>() {
                    max_page = Some(max_page.map_or(n, |m| m.max(n)));
                }
            }
        }
    }

    if max_page.is_none() {
        let body = document.root_element().text().collect::<String>();
        let page_of_re = Regex::new(r"(?i)page\s+\d+\s+of\s+(\d+)").expect("page-of pattern");
        if let Some(cap) = page_of_re.captures(&body) {
            max_page = cap[1].parse::<u32>().ok();
        }
    }

    match max_page {
        Some(total) => {
            let total = total.max(page);
            (Some(total), page < total || has_next_link)
        }
        None if has_next_link => (None, true),
        None if gallery_count >= FULL_LISTING_PAGE => (None, true),
        None => (Some(page), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HentaiFoxProvider {
        HentaiFoxProvider::new(&SiteConfig::default())
    }

    const LISTING_HTML: &str = r#"
<html><body>
<div class="thumb">
  <div class="inner_thumb">
    <a href="/gallery/147838/"><img data-src="https://cdn.hentaifox.com/t/147838.jpg" src="/lazy.gif"></a>
  </div>
  <div class="caption"><h2 class="g_title"><a href="/gallery/147838/">First Gallery</a></h2></div>
</div>
<div class="thumb">
  <div class="inner_thumb">
    <a href="/gallery/251004/"><img src="/thumbs/251004.jpg"></a>
  </div>
  <div class="caption"><h2 class="g_title"><a href="/gallery/251004/">Second Gallery</a></h2></div>
</div>
<div class="pagination">
  <a href="/search/?q=test&page=1">1</a>
  <a href="/search/?q=test&page=2">2</a>
  <a href="/search/?q=test&page=10">10</a>
  <a class="next" href="/search/?q=test&page=2">»</a>
</div>
</body></html>
"#;

    #[test]
    fn extracts_gallery_ids_from_urls() {
        let provider = provider();
        assert_eq!(
            provider.extract_gallery_id("https://hentaifox.com/gallery/147838/"),
            Some("147838".to_string())
        );
        assert_eq!(
            provider.extract_gallery_id("https://hentaifox.com/gallery/42/?src=related"),
            Some("42".to_string())
        );
        assert_eq!(
            provider.extract_gallery_id("https://hentaifox.com/tag/color/"),
            None
        );
        assert_eq!(provider.extract_gallery_id("https://example.com/gallery/9/"), None);
    }

    #[test]
    fn validates_only_site_gallery_urls() {
        let provider = provider();
        assert!(provider.validate_gallery_url("https://hentaifox.com/gallery/147838/"));
        assert!(!provider.validate_gallery_url("https://hentaifox.com/popular/"));
        assert!(!provider.validate_gallery_url("https://example.com/gallery/147838/"));
    }

    #[test]
    fn parses_listing_thumbs_with_absolute_urls() {
        let provider = provider();
        let document = Html::parse_document(LISTING_HTML);
        let galleries = provider.parse_gallery_list(&document);

        assert_eq!(galleries.len(), 2);
        assert_eq!(galleries[0].id, "147838");
        assert_eq!(galleries[0].title, "First Gallery");
        assert_eq!(galleries[0].url, "https://hentaifox.com/gallery/147838/");
        assert_eq!(
            galleries[0].thumbnail_url.as_deref(),
            Some("https://cdn.hentaifox.com/t/147838.jpg")
        );
        assert_eq!(galleries[1].id, "251004");
        assert_eq!(
            galleries[1].thumbnail_url.as_deref(),
            Some("https://hentaifox.com/thumbs/251004.jpg")
        );
    }

    #[test]
    fn pagination_takes_max_numbered_page() {
        let document = Html::parse_document(LISTING_HTML);
        let (total, has_next) = parse_pagination(&document, 1, 2);
        assert_eq!(total, Some(10));
        assert!(has_next);

        let (_, has_next_on_last) = parse_pagination(&document, 10, 2);
        assert!(has_next_on_last, "explicit next link keeps has_next set");
    }

    #[test]
    fn full_listing_without_pagination_implies_next_page() {
        let mut html = String::from("<html><body>");
        for i in 0..20 {
            html.push_str(&format!(
                r#"<div class="thumb"><div class="inner_thumb"><a href="/gallery/{i}/"><img src="/t/{i}.jpg"></a></div><div class="caption"><h2 class="g_title"><a href="/gallery/{i}/">G{i}</a></h2></div></div>"#
            ));
        }
        html.push_str("</body></html>");

        let provider = provider();
        let document = Html::parse_document(&html);
        let result = provider.parse_search_page(&document, 3);
        assert_eq!(result.galleries.len(), 20);
        assert_eq!(result.total_pages, None);
        assert!(result.has_next);
        assert_eq!(result.total_count, None);
        assert_eq!(result.current_page, 3);
    }

    #[test]
    fn short_listing_without_pagination_is_the_last_page() {
        let document = Html::parse_document(LISTING_HTML.replace("pagination", "x").as_str());
        let (total, has_next) = parse_pagination(&document, 1, 2);
        assert_eq!(total, Some(1));
        assert!(!has_next);
    }

    #[test]
    fn parses_gallery_page_details() {
        let html = r#"
<html><body>
<div class="info">
  <h1>Sample Adventure Ch. 2</h1>
  <ul class="tags">
    <li><a href="/tag/color/">color <span class="t_badge">1204</span></a></li>
    <li><a href="/tag/full-color/">full color <span class="t_badge">88</span></a></li>
  </ul>
  <ul><li><a href="/artist/somebody/">somebody <span class="t_badge">3</span></a></li></ul>
  <span class="i_text pages">Pages: 25</span>
</div>
<div class="cover"><img data-src="/covers/147838.jpg"></div>
</body></html>
"#;
        let provider = provider();
        let document = Html::parse_document(html);
        let info = provider.parse_gallery_page(
            &document,
            "147838",
            "https://hentaifox.com/gallery/147838/".to_string(),
        );

        assert_eq!(info.title, "Sample Adventure Ch. 2");
        assert_eq!(info.tags, vec!["color".to_string(), "full color".to_string()]);
        assert_eq!(info.artist.as_deref(), Some("somebody"));
        assert_eq!(info.pages, Some(25));
        assert_eq!(
            info.thumbnail_url.as_deref(),
            Some("https://hentaifox.com/covers/147838.jpg")
        );
    }

    #[test]
    fn gallery_page_without_details_falls_back() {
        let provider = provider();
        let document = Html::parse_document("<html><body><p>nothing here</p></body></html>");
        let info = provider.parse_gallery_page(
            &document,
            "9",
            "https://hentaifox.com/gallery/9/".to_string(),
        );
        assert_eq!(info.title, "Gallery 9");
        assert!(info.tags.is_empty());
        assert!(info.artist.is_none());
        assert!(info.pages.is_none());
    }

    #[test]
    fn builds_search_urls_per_kind_and_sort() {
        let provider = provider();
        assert_eq!(
            provider.build_search_url("school life", 2, SearchKind::Tag, SearchSort::Newest),
            "https://hentaifox.com/tag/school-life/?page=2"
        );
        assert_eq!(
            provider.build_search_url("some body", 1, SearchKind::Artist, SearchSort::Newest),
            "https://hentaifox.com/artist/some-body/?page=1"
        );
        assert_eq!(
            provider.build_search_url("two words", 1, SearchKind::All, SearchSort::Popular),
            "https://hentaifox.com/search/?q=two+words&page=1&sort=popular"
        );
        assert_eq!(
            provider.build_search_url("title only", 3, SearchKind::Title, SearchSort::Newest),
            "https://hentaifox.com/search/?q=title+only&page=3&type=title"
        );
        assert_eq!(
            provider.build_search_url("", 4, SearchKind::All, SearchSort::MostViewed),
            "https://hentaifox.com/most-viewed/?page=4"
        );
        assert_eq!(
            provider.build_search_url("", 1, SearchKind::All, SearchSort::Newest),
            "https://hentaifox.com/?page=1"
        );
    }

    #[test]
    fn search_kind_and_sort_round_trip_their_names() {
        for kind in [
            SearchKind::All,
            SearchKind::Title,
            SearchKind::Tag,
            SearchKind::Artist,
        ] {
            assert_eq!(SearchKind::parse(kind.as_str()), Some(kind));
        }
        for sort in [
            SearchSort::Newest,
            SearchSort::Popular,
            SearchSort::MostViewed,
            SearchSort::TopRated,
        ] {
            assert_eq!(SearchSort::parse(sort.as_str()), Some(sort));
        }
        assert_eq!(SearchKind::parse("bogus"), None);
        assert_eq!(SearchSort::parse(""), None);
    }
}
