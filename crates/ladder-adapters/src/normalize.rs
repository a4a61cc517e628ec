use chrono::{DateTime, NaiveDate};
use ladder_core::{EducationLevel, GenericListing, Opportunity, OpportunityType, RawListing};
use tracing::{debug, warn};
use url::Url;

use crate::SourceSite;

pub const GENERIC_DESCRIPTION: &str = "No description provided.";

const ARXIV_DESCRIPTION: &str = "New Research Publication";
const UNSTOP_DESCRIPTION: &str = "Skills-based career challenge";
const LINKEDIN_DESCRIPTION: &str = "Internship listing";

/// Resolve `href` against the site origin. Blank, fragment-only and
/// `javascript:` links resolve to `None`.
pub fn resolve_link(href: Option<&str>, origin: &Url) -> Option<String> {
    let href = href?.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match origin.join(href) {
        Ok(url) => Some(url.to_string()),
        Err(err) => {
            debug!(href, error = %err, "unresolvable link");
            None
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_deadline(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
        .or_else(|| {
            debug!(raw, "ignoring unparseable deadline");
            None
        })
}

fn coerce_type(raw: Option<&str>, fallback: OpportunityType) -> OpportunityType {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        None => fallback,
        Some(raw) => {
            let coerced = OpportunityType::coerce(raw);
            if !coerced.is_recognized() {
                warn!(value = raw, "unrecognized opportunity type kept verbatim");
            }
            coerced
        }
    }
}

fn coerce_level(raw: Option<&str>, fallback: EducationLevel) -> EducationLevel {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        None => fallback,
        Some(raw) => {
            let coerced = EducationLevel::coerce(raw);
            if !coerced.is_recognized() {
                warn!(value = raw, "unrecognized education level kept verbatim");
            }
            coerced
        }
    }
}

struct Fields {
    title: Option<String>,
    organization: Option<String>,
    description: Option<String>,
    href: Option<String>,
    opportunity_type: OpportunityType,
    education_level: EducationLevel,
    requirements: Vec<String>,
    deadline: Option<NaiveDate>,
    location: Option<String>,
}

fn fields_of(raw: RawListing) -> Fields {
    match raw {
        RawListing::Arxiv(entry) => Fields {
            title: entry.title,
            organization: entry.authors,
            description: Some(ARXIV_DESCRIPTION.to_string()),
            href: entry.abstract_href,
            opportunity_type: OpportunityType::Research,
            education_level: EducationLevel::Graduate,
            requirements: vec!["Literature Review".to_string(), "Academic Writing".to_string()],
            deadline: None,
            location: None,
        },
        RawListing::Devpost(tile) => Fields {
            title: tile.title,
            organization: tile.organizer,
            description: tile.tagline,
            href: tile.href,
            opportunity_type: OpportunityType::Hackathon,
            education_level: EducationLevel::Undergraduate,
            requirements: Vec::new(),
            deadline: None,
            location: None,
        },
        RawListing::Unstop(card) => Fields {
            title: card.title,
            organization: card.organization,
            description: Some(UNSTOP_DESCRIPTION.to_string()),
            href: card.href,
            opportunity_type: OpportunityType::Competition,
            education_level: EducationLevel::Undergraduate,
            requirements: Vec::new(),
            deadline: None,
            location: None,
        },
        RawListing::LinkedIn(card) => Fields {
            title: card.title,
            organization: card.company,
            description: Some(LINKEDIN_DESCRIPTION.to_string()),
            href: card.href,
            opportunity_type: OpportunityType::Internship,
            education_level: EducationLevel::Undergraduate,
            requirements: Vec::new(),
            deadline: None,
            location: card.location,
        },
        RawListing::Generic(GenericListing {
            title,
            organization,
            description,
            link,
            opportunity_type,
            education_level,
            requirements,
            deadline,
            location,
        }) => Fields {
            title,
            organization,
            description,
            href: link,
            opportunity_type: coerce_type(opportunity_type.as_deref(), OpportunityType::Internship),
            education_level: coerce_level(education_level.as_deref(), EducationLevel::Undergraduate),
            requirements: requirements.unwrap_or_default(),
            deadline: parse_deadline(deadline.as_deref()),
            location,
        },
    }
}

/// Map a raw listing into the canonical shape, filling per-site defaults.
///
/// The identifier is the resolved link when there is one, else the title.
pub fn normalize(raw: RawListing, site: &SourceSite) -> Opportunity {
    let fields = fields_of(raw);
    let title = non_blank(fields.title).unwrap_or_default();
    let link = resolve_link(fields.href.as_deref(), &site.origin);
    let id = link.clone().unwrap_or_else(|| title.clone());

    Opportunity {
        id,
        title,
        organization: non_blank(fields.organization).unwrap_or_else(|| site.display_name.clone()),
        description: non_blank(fields.description).unwrap_or_else(|| GENERIC_DESCRIPTION.to_string()),
        opportunity_type: fields.opportunity_type,
        education_level: fields.education_level,
        link,
        requirements: fields
            .requirements
            .into_iter()
            .filter_map(|r| non_blank(Some(r)))
            .collect(),
        deadline: fields.deadline,
        location: non_blank(fields.location),
        source_id: site.source_id.clone(),
    }
}

pub fn normalize_all(raw: Vec<RawListing>, site: &SourceSite) -> Vec<Opportunity> {
    raw.into_iter().map(|r| normalize(r, site)).collect()
}
