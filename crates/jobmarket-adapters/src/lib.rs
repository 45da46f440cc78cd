//! Listing-page record extraction and replay of captured pages.
//!
//! Markup knowledge lives entirely in [`ListingSelectors`]; callers only see
//! [`RecordExtractor`] and the [`RawCandidate`]s a [`ListingPage`] yields.

mod replay;

use jobmarket_core::RawCandidate;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use replay::ReplayPageSource;

pub const CRATE_NAME: &str = "jobmarket-adapters";

#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Informational only; a missing field never fails extraction.
    #[error("field `{field}` missing on page {page_index}")]
    FieldMissing { page_index: u32, field: &'static str },
    #[error("markup unrecognized: {reason}")]
    MarkupUnrecognized { reason: String },
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
}

/// Ordered CSS selector fallbacks per field; the first selector that matches wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    /// Present whenever the page rendered a result list, even an empty one.
    pub results_root: Vec<String>,
    /// Present when the portal explicitly reports no matching jobs.
    pub no_results: Vec<String>,
    pub container: Vec<String>,
    pub title: Vec<String>,
    /// Elements whose `href` is the posting link.
    pub link: Vec<String>,
    pub company: Vec<String>,
    pub location: Vec<String>,
    pub experience: Vec<String>,
    pub salary: Vec<String>,
    /// Every match is collected; tags are joined with `", "`.
    pub skills: Vec<String>,
    pub posted: Vec<String>,
    /// Job description body on a posting's detail page.
    pub description: Vec<String>,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            results_root: owned(&["div#listContainer", "section.listContainer"]),
            no_results: owned(&["div.no-result", "div.noResultContainer"]),
            container: owned(&["div.srp-jobtuple-wrapper", "article.jobTuple"]),
            title: owned(&["a.title"]),
            link: owned(&["a.title[href]"]),
            company: owned(&["a.comp-name", "a.subTitle"]),
            location: owned(&["span.locWdth", "li.location"]),
            experience: owned(&["span.expwdth", "li.experience"]),
            salary: owned(&["span.sal", "li.salary"]),
            skills: owned(&["ul.tags-gt li", "ul.tags li"]),
            posted: owned(&["span.job-post-day", "span.postedDate"]),
            description: owned(&[".dang-inner-html", ".job-description", ".JDres"]),
        }
    }
}

#[derive(Debug)]
struct CompiledSelectors {
    results_root: Vec<Selector>,
    no_results: Vec<Selector>,
    container: Vec<Selector>,
    title: Vec<Selector>,
    link: Vec<Selector>,
    company: Vec<Selector>,
    location: Vec<Selector>,
    experience: Vec<Selector>,
    salary: Vec<Selector>,
    skills: Vec<Selector>,
    posted: Vec<Selector>,
    description: Vec<Selector>,
}

fn compile(list: &[String]) -> Result<Vec<Selector>, ExtractionError> {
    list.iter()
        .map(|source| {
            Selector::parse(source).map_err(|e| ExtractionError::InvalidSelector {
                selector: source.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

impl CompiledSelectors {
    fn new(s: &ListingSelectors) -> Result<Self, ExtractionError> {
        if s.container.is_empty() {
            return Err(ExtractionError::InvalidSelector {
                selector: "container".to_string(),
                message: "at least one container selector is required".to_string(),
            });
        }
        Ok(Self {
            results_root: compile(&s.results_root)?,
            no_results: compile(&s.no_results)?,
            container: compile(&s.container)?,
            title: compile(&s.title)?,
            link: compile(&s.link)?,
            company: compile(&s.company)?,
            location: compile(&s.location)?,
            experience: compile(&s.experience)?,
            salary: compile(&s.salary)?,
            skills: compile(&s.skills)?,
            posted: compile(&s.posted)?,
            description: compile(&s.description)?,
        })
    }
}

/// Turns listing HTML into raw candidates.
pub trait RecordExtractor: Send + Sync {
    fn extractor_id(&self) -> &str;

    /// Fails only when the page is not a listing page at all. A recognised
    /// page with no containers parses fine and yields nothing.
    fn parse<'e>(&'e self, page_index: u32, html: &str) -> Result<ListingPage<'e>, ExtractionError>;

    /// Description text of a posting detail page; `None` when no description
    /// element is present.
    fn parse_description(&self, html: &str) -> Option<String>;
}

/// A parsed listing page. Not `Send`; drop it before the next await point.
pub struct ListingPage<'e> {
    page_index: u32,
    document: Html,
    selectors: &'e CompiledSelectors,
    link_base: Option<&'e Url>,
}

impl<'e> ListingPage<'e> {
    pub fn page_index(&self) -> u32 {
        self.page_index
    }

    pub fn reports_no_results(&self) -> bool {
        matches_any(&self.document, &self.selectors.no_results)
    }

    /// Lazily yields one candidate per listing container, skipping
    /// containers in which no field could be read.
    pub fn candidates(&self) -> impl Iterator<Item = RawCandidate> + '_ {
        let container = self
            .selectors
            .container
            .iter()
            .find(|sel| self.document.select(sel).next().is_some());
        container
            .into_iter()
            .flat_map(move |sel| self.document.select(sel))
            .map(move |el| self.candidate_from(el))
            .filter(|candidate| !candidate.is_blank())
    }

    fn candidate_from(&self, el: ElementRef<'_>) -> RawCandidate {
        let s = self.selectors;
        let skills = all_texts(el, &s.skills);
        RawCandidate {
            page_index: self.page_index,
            title: first_text(el, &s.title),
            company: first_text(el, &s.company),
            location: first_text(el, &s.location),
            experience_text: first_text(el, &s.experience),
            salary_text: first_text(el, &s.salary),
            skills_text: (!skills.is_empty()).then(|| skills.join(", ")),
            posted_text: first_text(el, &s.posted),
            source_url: first_attr(el, &s.link, "href").map(|href| self.resolve_link(&href)),
            description_text: None,
        }
    }

    fn resolve_link(&self, href: &str) -> String {
        if let Ok(absolute) = Url::parse(href) {
            return absolute.to_string();
        }
        self.link_base
            .and_then(|base| base.join(href).ok())
            .map(|url| url.to_string())
            .unwrap_or_else(|| href.to_string())
    }
}

/// The fields of `candidate` that came back empty.
pub fn missing_fields(candidate: &RawCandidate) -> Vec<ExtractionError> {
    let fields: [(&'static str, &Option<String>); 8] = [
        ("title", &candidate.title),
        ("company", &candidate.company),
        ("location", &candidate.location),
        ("experience", &candidate.experience_text),
        ("salary", &candidate.salary_text),
        ("skills", &candidate.skills_text),
        ("posted", &candidate.posted_text),
        ("link", &candidate.source_url),
    ];
    fields
        .into_iter()
        .filter(|(_, value)| value.is_none())
        .map(|(field, _)| ExtractionError::FieldMissing {
            page_index: candidate.page_index,
            field,
        })
        .collect()
}

fn matches_any(document: &Html, selectors: &[Selector]) -> bool {
    selectors.iter().any(|sel| document.select(sel).next().is_some())
}

fn clean_text<'a>(parts: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined = parts.collect::<Vec<_>>().join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn first_text(el: ElementRef<'_>, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .find_map(|sel| el.select(sel).find_map(|n| clean_text(n.text())))
}

fn all_texts(el: ElementRef<'_>, selectors: &[Selector]) -> Vec<String> {
    selectors
        .iter()
        .map(|sel| el.select(sel).filter_map(|n| clean_text(n.text())).collect::<Vec<_>>())
        .find(|texts| !texts.is_empty())
        .unwrap_or_default()
}

fn first_attr(el: ElementRef<'_>, selectors: &[Selector], attr: &str) -> Option<String> {
    selectors.iter().find_map(|sel| {
        el.select(sel)
            .filter_map(|n| n.value().attr(attr))
            .find_map(|v| clean_text(std::iter::once(v)))
    })
}

/// Extractor for the job portal's search-result pages.
#[derive(Debug)]
pub struct PortalListingExtractor {
    selectors: CompiledSelectors,
    link_base: Option<Url>,
}

impl PortalListingExtractor {
    /// `link_base` resolves relative posting links (normally the portal's base URL).
    pub fn new(selectors: &ListingSelectors, link_base: Option<&str>) -> Result<Self, ExtractionError> {
        Ok(Self {
            selectors: CompiledSelectors::new(selectors)?,
            link_base: link_base.and_then(|base| Url::parse(base).ok()),
        })
    }

    pub fn with_default_selectors(link_base: Option<&str>) -> Result<Self, ExtractionError> {
        Self::new(&ListingSelectors::default(), link_base)
    }
}

impl RecordExtractor for PortalListingExtractor {
    fn extractor_id(&self) -> &str {
        "portal-listing-v1"
    }

    fn parse<'e>(&'e self, page_index: u32, html: &str) -> Result<ListingPage<'e>, ExtractionError> {
        let document = Html::parse_document(html);
        let recognised = matches_any(&document, &self.selectors.container)
            || matches_any(&document, &self.selectors.results_root)
            || matches_any(&document, &self.selectors.no_results);
        if !recognised {
            return Err(ExtractionError::MarkupUnrecognized {
                reason: format!(
                    "page {page_index} has no listing container, result list or no-results marker"
                ),
            });
        }
        Ok(ListingPage {
            page_index,
            document,
            selectors: &self.selectors,
            link_base: self.link_base.as_ref(),
        })
    }

    fn parse_description(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        self.selectors
            .description
            .iter()
            .find_map(|sel| document.select(sel).find_map(|n| clean_text(n.text())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> PortalListingExtractor {
        PortalListingExtractor::with_default_selectors(Some("https://www.naukri.com")).expect("default selectors")
    }

    #[test]
    fn captcha_page_is_unrecognized() {
        let html = "<html><body><form id='captcha'>Are you human?</form></body></html>";
        let err = extractor().parse(4, html).err().expect("expected an error");
        assert!(matches!(err, ExtractionError::MarkupUnrecognized { .. }), "{err}");
    }

    #[test]
    fn empty_result_list_is_a_valid_zero_candidate_page() {
        let html = "<html><body><div id='listContainer'></div></body></html>";
        let extractor = extractor();
        let page = extractor.parse(9, html).expect("listing markup");
        assert_eq!(page.candidates().count(), 0);
        assert!(!page.reports_no_results());
    }

    #[test]
    fn missing_fields_yield_nulls_not_errors() {
        let html = r#"<div class="srp-jobtuple-wrapper">
              <a class="title" href="/job-listings-x-1">  Analyst
                 Intern </a>
            </div>
            <div class="srp-jobtuple-wrapper"><p>sponsored</p></div>"#;
        let extractor = extractor();
        let page = extractor.parse(1, html).expect("listing markup");
        let candidates: Vec<_> = page.candidates().collect();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.title.as_deref(), Some("Analyst Intern"));
        assert_eq!(c.source_url.as_deref(), Some("https://www.naukri.com/job-listings-x-1"));
        assert!(c.company.is_none() && c.salary_text.is_none() && c.skills_text.is_none());

        let missing: Vec<_> = missing_fields(c)
            .into_iter()
            .map(|e| match e {
                ExtractionError::FieldMissing { field, .. } => field,
                other => panic!("unexpected {other}"),
            })
            .collect();
        assert_eq!(
            missing,
            vec!["company", "location", "experience", "salary", "skills", "posted"]
        );
    }

    #[test]
    fn relative_links_stay_raw_without_a_base() {
        let extractor = PortalListingExtractor::with_default_selectors(None).expect("default selectors");
        let page = extractor
            .parse(1, r#"<div class="srp-jobtuple-wrapper"><a class="title" href="/job-1">BI Analyst</a></div>"#)
            .expect("listing markup");
        let c = page.candidates().next().expect("first item");
        assert_eq!(c.source_url.as_deref(), Some("/job-1"));
    }

    #[test]
    fn selector_overrides_replace_defaults() {
        let selectors = ListingSelectors {
            container: vec!["li.result".into()],
            title: vec!["h3".into()],
            company: vec![".org".into()],
            ..ListingSelectors::default()
        };
        let extractor = PortalListingExtractor::new(&selectors, None).expect("selectors compile");
        let page = extractor
            .parse(2, "<ul><li class='result'><h3>Data Engineer</h3><span class='org'>Hooli</span></li></ul>")
            .expect("listing markup");
        let c = page.candidates().next().expect("first item");
        assert_eq!(c.title.as_deref(), Some("Data Engineer"));
        assert_eq!(c.company.as_deref(), Some("Hooli"));
        assert_eq!(c.page_index, 2);
    }

    #[test]
    fn description_comes_from_the_first_matching_selector() {
        let html = r#"<html><body>
              <section class="job-desc"><div class="dang-inner-html">
                <p>Own weekly reporting in <b>Power BI</b>.</p>
                <ul><li>Strong SQL</li><li>Python for automation</li></ul>
              </div></section>
              <div class="JDres">stale fallback</div>
            </body></html>"#;
        let description = extractor().parse_description(html).expect("description");
        assert_eq!(
            description,
            "Own weekly reporting in Power BI . Strong SQL Python for automation"
        );
        assert!(extractor().parse_description("<html><p>gone</p></html>").is_none());
    }

    #[test]
    fn invalid_selector_is_reported() {
        let selectors = ListingSelectors {
            title: vec!["a[".into()],
            ..ListingSelectors::default()
        };
        let err = PortalListingExtractor::new(&selectors, None).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidSelector { ref selector, .. } if selector == "a["));
    }
}
