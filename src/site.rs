use serde::{Deserialize, Serialize};

/// Metadata for one gallery as scraped from its site page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryInfo {
    /// Site-scoped stable id (numeric string for hentaifox).
    pub id: String,
    pub title: String,
    pub url: String,
    pub tags: Vec<String>,
    pub artist: Option<String>,
    pub pages: Option<u32>,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// One page of listing results (search, tag or browse).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub galleries: Vec<GalleryInfo>,
    /// Rough estimate; only derivable when `total_pages` is known.
    pub total_count: Option<u64>,
    pub current_page: u32,
    /// None when the pagination markup could not be parsed. `has_next` is
    /// still meaningful in that case.
    pub total_pages: Option<u32>,
    pub has_next: bool,
}

/// Capability interface one site adapter implements. The orchestrator only
/// needs validation and metadata lookup; search and tag browsing exist for
/// the presentation layers.
pub trait SiteProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_valid_url(&self, url: &str) -> bool;

    /// Extracts the site-scoped gallery id, or None when the URL does not
    /// point at a single gallery.
    fn extract_gallery_id(&self, url: &str) -> Option<String>;

    /// Fetches and parses the gallery page. None on any network or parse
    /// failure; the caller decides whether that is fatal.
    fn gallery_info(&self, url: &str) -> Option<GalleryInfo>;

    fn search(&self, query: &str, page: u32) -> Option<SearchResult>;

    fn tag_galleries(&self, tag: &str, page: u32) -> Option<SearchResult>;

    /// A URL is downloadable when it matches the site and carries an id.
    fn validate_gallery_url(&self, url: &str) -> bool {
        self.is_valid_url(url) && self.extract_gallery_id(url).is_some()
    }

    fn normalize_url(&self, url: &str) -> String {
        let without_fragment = url.split('#').next().unwrap_or(url);
        let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
        without_query.trim_end_matches('/').to_string()
    }
}
