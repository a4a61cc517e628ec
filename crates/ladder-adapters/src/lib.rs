//! Per-site extraction rules and the normalizer that turns raw listings into
//! canonical opportunities.

use ladder_core::{ArxivEntry, DevpostTile, GenericListing, LinkedInCard, RawListing, UnstopCard};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

mod normalize;

pub use normalize::{normalize, normalize_all, resolve_link, GENERIC_DESCRIPTION};

pub const CRATE_NAME: &str = "ladder-adapters";

/// Source id for pages an admin submits one at a time.
pub const GENERIC_SOURCE_ID: &str = "manual";

/// How many arXiv index entries one pass keeps.
pub const ARXIV_ENTRY_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid source url `{url}`: {source}")]
    SourceUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Identity of the site a listing came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSite {
    pub source_id: String,
    pub display_name: String,
    pub origin: Url,
}

impl SourceSite {
    /// Builds a site whose origin is the scheme+host of `listing_url`.
    pub fn from_listing_url(
        source_id: impl Into<String>,
        display_name: impl Into<String>,
        listing_url: &str,
    ) -> Result<Self, AdapterError> {
        let parsed = Url::parse(listing_url).map_err(|source| AdapterError::SourceUrl {
            url: listing_url.to_string(),
            source,
        })?;
        let origin = Url::parse(&parsed.origin().ascii_serialization()).map_err(|source| {
            AdapterError::SourceUrl {
                url: listing_url.to_string(),
                source,
            }
        })?;
        Ok(Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            origin,
        })
    }
}

/// Reads one site's listing page.
pub trait SiteExtractor: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Parse rendered `html` into raw listings. No matches is an empty list.
    fn extract(&self, html: &str) -> Result<Vec<RawListing>, AdapterError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArxivExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct DevpostExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnstopExtractor;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedInExtractor;

/// Reads a single arbitrary opportunity page using common markup.
#[derive(Debug, Clone)]
pub struct GenericPageExtractor {
    page_url: String,
}

impl GenericPageExtractor {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Visible text with runs of whitespace collapsed, or `None` when blank.
fn clean_text(el: ElementRef<'_>) -> Option<String> {
    let text = el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).find_map(clean_text)
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .filter_map(|n| n.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn strip_label(text: String, label: &str) -> Option<String> {
    let stripped = text.strip_prefix(label).unwrap_or(&text).trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

impl SiteExtractor for ArxivExtractor {
    fn source_id(&self) -> &'static str {
        "arxiv"
    }

    /// The "new submissions" index pairs each `<dt>` (links) with the `<dd>`
    /// that follows it (metadata).
    fn extract(&self, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let dt = selector("dt")?;
        let dd = selector("dd")?;
        let title = selector(".list-title")?;
        let authors = selector(".list-authors")?;
        let abstract_link = selector(r#"a[title="Abstract"]"#)?;

        let metas = document.select(&dd).collect::<Vec<_>>();
        Ok(document
            .select(&dt)
            .take(ARXIV_ENTRY_LIMIT)
            .enumerate()
            .map(|(i, entry)| {
                let meta = metas.get(i).copied();
                RawListing::Arxiv(ArxivEntry {
                    title: meta
                        .and_then(|m| first_text(m, &title))
                        .and_then(|t| strip_label(t, "Title:")),
                    authors: meta
                        .and_then(|m| first_text(m, &authors))
                        .and_then(|t| strip_label(t, "Authors:")),
                    abstract_href: first_attr(entry, &abstract_link, "href"),
                })
            })
            .collect())
    }
}

impl SiteExtractor for DevpostExtractor {
    fn source_id(&self) -> &'static str {
        "devpost"
    }

    fn extract(&self, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let tile = selector(".hackathon-tile")?;
        let heading = selector("h3")?;
        let organizer = selector(".organizer")?;
        let tagline = selector(".tagline")?;
        let link = selector("a[href]")?;

        Ok(document
            .select(&tile)
            .map(|t| {
                RawListing::Devpost(DevpostTile {
                    title: first_text(t, &heading),
                    organizer: first_text(t, &organizer),
                    tagline: first_text(t, &tagline),
                    href: first_attr(t, &link, "href"),
                })
            })
            .collect())
    }
}

impl SiteExtractor for UnstopExtractor {
    fn source_id(&self) -> &'static str {
        "unstop"
    }

    fn extract(&self, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let card = selector(".competitions_card, .c-card")?;
        let heading = selector("h2, h3")?;
        let organization = selector(".company_name, .org-name")?;
        let link = selector("a[href]")?;

        Ok(document
            .select(&card)
            .map(|c| {
                // Some card layouts are themselves the anchor.
                let href = c
                    .value()
                    .attr("href")
                    .map(ToString::to_string)
                    .or_else(|| first_attr(c, &link, "href"));
                RawListing::Unstop(UnstopCard {
                    title: first_text(c, &heading),
                    organization: first_text(c, &organization),
                    href,
                })
            })
            .collect())
    }
}

impl SiteExtractor for LinkedInExtractor {
    fn source_id(&self) -> &'static str {
        "linkedin"
    }

    fn extract(&self, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let card = selector(".base-card")?;
        let title = selector(".base-search-card__title")?;
        let company = selector(".base-search-card__subtitle")?;
        let location = selector(".job-search-card__location")?;
        let link = selector("a.base-card__full-link")?;

        Ok(document
            .select(&card)
            .map(|c| {
                RawListing::LinkedIn(LinkedInCard {
                    title: first_text(c, &title),
                    company: first_text(c, &company),
                    location: first_text(c, &location),
                    href: first_attr(c, &link, "href"),
                })
            })
            .collect())
    }
}

impl SiteExtractor for GenericPageExtractor {
    fn source_id(&self) -> &'static str {
        GENERIC_SOURCE_ID
    }

    /// One listing per page: heading (or `<title>`), meta or `.description`
    /// text, `.company-name`, `.deadline` and `.requirements li`. The link is
    /// the canonical URL when declared, else the page URL. A page with no
    /// title yields nothing.
    fn extract(&self, html: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let heading = selector("h1")?;
        let page_title = selector("title")?;
        let meta_description = selector(r#"meta[name="description"]"#)?;
        let description = selector(".description")?;
        let company = selector(".company-name")?;
        let deadline = selector(".deadline")?;
        let requirement = selector(".requirements li")?;
        let canonical = selector(r#"link[rel="canonical"]"#)?;

        let Some(title) = first_text(root, &heading).or_else(|| first_text(root, &page_title)) else {
            return Ok(Vec::new());
        };
        let requirements = root.select(&requirement).filter_map(clean_text).collect::<Vec<_>>();

        Ok(vec![RawListing::Generic(GenericListing {
            title: Some(title),
            organization: first_text(root, &company),
            description: first_attr(root, &meta_description, "content")
                .or_else(|| first_text(root, &description)),
            link: first_attr(root, &canonical, "href").or_else(|| Some(self.page_url.clone())),
            requirements: (!requirements.is_empty()).then_some(requirements),
            deadline: first_text(root, &deadline),
            ..Default::default()
        })])
    }
}

pub fn extractor_for_source(source_id: &str) -> Option<Box<dyn SiteExtractor>> {
    match source_id {
        "arxiv" => Some(Box::new(ArxivExtractor)),
        "devpost" => Some(Box::new(DevpostExtractor)),
        "unstop" => Some(Box::new(UnstopExtractor)),
        "linkedin" => Some(Box::new(LinkedInExtractor)),
        _ => None,
    }
}

pub fn known_sources() -> &'static [&'static str] {
    &["arxiv", "devpost", "unstop", "linkedin"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_known_source() {
        for id in known_sources() {
            let extractor = extractor_for_source(id).expect("registered");
            assert_eq!(extractor.source_id(), *id);
        }
        assert!(extractor_for_source("indeed").is_none());
    }

    #[test]
    fn generic_page_prefers_heading_meta_and_canonical_link() {
        let html = r#"<html><head><title>Careers | Acme</title>
            <meta name="description" content="Paid summer role">
            <link rel="canonical" href="/careers/intern-2026"></head>
            <body><h1>Firmware Intern</h1><p class="description">ignored</p>
            <span class="company-name">Acme</span><span class="deadline">2026-12-01</span>
            <ul class="requirements"><li>C</li><li> RTOS </li></ul></body></html>"#;

        let listings = GenericPageExtractor::new("https://acme.example/careers?id=7").extract(html).unwrap();

        let [RawListing::Generic(listing)] = listings.as_slice() else {
            panic!("expected one generic listing, got {listings:?}");
        };
        assert_eq!(listing.title.as_deref(), Some("Firmware Intern"));
        assert_eq!(listing.description.as_deref(), Some("Paid summer role"));
        assert_eq!(listing.organization.as_deref(), Some("Acme"));
        assert_eq!(listing.link.as_deref(), Some("/careers/intern-2026"));
        assert_eq!(listing.deadline.as_deref(), Some("2026-12-01"));
        assert_eq!(listing.requirements, Some(vec!["C".to_string(), "RTOS".to_string()]));
    }

    #[test]
    fn generic_page_falls_back_to_title_tag_and_page_url() {
        let html = "<html><head><title> Scholarship </title></head><body><div class=\"description\">Merit award</div></body></html>";
        let listings = GenericPageExtractor::new("https://fund.example/award").extract(html).unwrap();
        let [RawListing::Generic(listing)] = listings.as_slice() else {
            panic!("expected one generic listing");
        };
        assert_eq!(listing.title.as_deref(), Some("Scholarship"));
        assert_eq!(listing.description.as_deref(), Some("Merit award"));
        assert_eq!(listing.link.as_deref(), Some("https://fund.example/award"));
        assert_eq!(listing.requirements, None);

        assert!(GenericPageExtractor::new("https://x.org").extract("<p>no title</p>").unwrap().is_empty());
    }

    #[test]
    fn site_origin_drops_path_and_query() {
        let site = SourceSite::from_listing_url("unstop", "Unstop", "https://unstop.com/competitions?page=2").unwrap();
        assert_eq!(site.origin.as_str(), "https://unstop.com/");
        assert!(SourceSite::from_listing_url("x", "X", "not a url").is_err());
    }

    #[test]
    fn empty_page_yields_no_listings() {
        let html = "<html><body><p>Nothing here</p></body></html>";
        for id in known_sources() {
            let listings = extractor_for_source(id).unwrap().extract(html).unwrap();
            assert!(listings.is_empty(), "{id} should find nothing");
        }
    }

    #[test]
    fn arxiv_strips_labels_and_caps_entries() {
        let mut html = String::from("<dl>");
        for i in 0..12 {
            html.push_str(&format!(
                r#"<dt><a href="/abs/2410.{i:05}" title="Abstract">arXiv:2410.{i:05}</a></dt>
                <dd><div class="list-title mathjax"><span class="descriptor">Title:</span>
                  Paper   {i}</div>
                <div class="list-authors"><span class="descriptor">Authors:</span> A. Author, B. Author</div></dd>"#
            ));
        }
        html.push_str("</dl>");

        let listings = ArxivExtractor.extract(&html).unwrap();
        assert_eq!(listings.len(), ARXIV_ENTRY_LIMIT);
        let RawListing::Arxiv(first) = &listings[0] else {
            panic!("expected arxiv entry");
        };
        assert_eq!(first.title.as_deref(), Some("Paper 0"));
        assert_eq!(first.authors.as_deref(), Some("A. Author, B. Author"));
        assert_eq!(first.abstract_href.as_deref(), Some("/abs/2410.00000"));
    }

    #[test]
    fn arxiv_entry_without_metadata_keeps_link() {
        let html = r#"<dl><dt><a href="/abs/1" title="Abstract">x</a></dt></dl>"#;
        let listings = ArxivExtractor.extract(html).unwrap();
        assert_eq!(
            listings,
            vec![RawListing::Arxiv(ArxivEntry {
                title: None,
                authors: None,
                abstract_href: Some("/abs/1".into()),
            })]
        );
    }

    #[test]
    fn devpost_reads_tiles_and_tolerates_missing_fields() {
        let html = r#"
            <div class="hackathon-tile">
              <a href="https://hack-one.devpost.com/"><h3> Hack One </h3></a>
              <p class="organizer">MLH</p><p class="tagline">Build things</p>
            </div>
            <div class="hackathon-tile"><h3>Hack Two</h3></div>"#;
        let listings = DevpostExtractor.extract(html).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(
            listings[0],
            RawListing::Devpost(DevpostTile {
                title: Some("Hack One".into()),
                organizer: Some("MLH".into()),
                tagline: Some("Build things".into()),
                href: Some("https://hack-one.devpost.com/".into()),
            })
        );
        let RawListing::Devpost(second) = &listings[1] else {
            panic!("expected devpost tile");
        };
        assert_eq!(second.organizer, None);
        assert_eq!(second.href, None);
    }

    #[test]
    fn unstop_accepts_both_card_layouts() {
        let html = r#"
            <a class="c-card" href="/competitions/quiz-1"><h3>Quiz</h3><span class="org-name">IIT</span></a>
            <div class="competitions_card"><h2>Case Study</h2><a href="/competitions/case-2">Open</a></div>"#;
        let listings = UnstopExtractor.extract(html).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(
            listings[0],
            RawListing::Unstop(UnstopCard {
                title: Some("Quiz".into()),
                organization: Some("IIT".into()),
                href: Some("/competitions/quiz-1".into()),
            })
        );
        let RawListing::Unstop(second) = &listings[1] else {
            panic!("expected unstop card");
        };
        assert_eq!(second.href.as_deref(), Some("/competitions/case-2"));
    }

    #[test]
    fn linkedin_reads_search_cards() {
        let html = r#"
            <ul><li><div class="base-card">
              <a class="base-card__full-link" href="https://www.linkedin.com/jobs/view/42"></a>
              <h3 class="base-search-card__title">Software Engineering Intern</h3>
              <h4 class="base-search-card__subtitle"><a>Acme</a></h4>
              <span class="job-search-card__location">Berlin, Germany</span>
            </div></li></ul>"#;
        let listings = LinkedInExtractor.extract(html).unwrap();
        assert_eq!(
            listings,
            vec![RawListing::LinkedIn(LinkedInCard {
                title: Some("Software Engineering Intern".into()),
                company: Some("Acme".into()),
                location: Some("Berlin, Germany".into()),
                href: Some("https://www.linkedin.com/jobs/view/42".into()),
            })]
        );
    }
}
