//! Core domain model for the opportunity ladder: canonical opportunities,
//! raw per-site listings, and the plain records shared with the app backend.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ladder-core";

/// Declares a canonical string enumeration that keeps unrecognized values
/// verbatim in an `Other` variant instead of rejecting them.
macro_rules! canonical_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub const CANONICAL: &'static [&'static str] = &[$($wire),+];

            /// Case- and separator-insensitive coercion (`"Hackathon"`,
            /// `"high school"` and `"HIGH-SCHOOL"` all match).
            pub fn coerce(raw: &str) -> Self {
                let folded = raw.trim().to_ascii_uppercase().replace([' ', '-'], "_");
                match folded.as_str() {
                    $($wire => Self::$variant,)+
                    _ => Self::Other(raw.trim().to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Other(raw) => raw,
                }
            }

            pub fn is_recognized(&self) -> bool {
                !matches!(self, Self::Other(_))
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self::coerce(&raw)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

canonical_enum!(
    /// Kind of listing.
    OpportunityType {
        Scholarship => "SCHOLARSHIP",
        Internship => "INTERNSHIP",
        Research => "RESEARCH",
        Fellowship => "FELLOWSHIP",
        Competition => "COMPETITION",
        Hackathon => "HACKATHON",
    }
);

canonical_enum!(
    /// Education level a listing targets.
    EducationLevel {
        HighSchool => "HIGH_SCHOOL",
        Undergraduate => "UNDERGRADUATE",
        Graduate => "GRADUATE",
        Professional => "PROFESSIONAL",
    }
);

/// Canonical persisted opportunity row.
///
/// Wire names are snake_case because the app reads `education_level` and
/// `source_id` straight from the datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub organization: String,
    pub description: String,
    #[serde(rename = "type")]
    pub opportunity_type: OpportunityType,
    pub education_level: EducationLevel,
    pub link: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    pub deadline: Option<NaiveDate>,
    #[serde(default)]
    pub location: Option<String>,
    pub source_id: String,
}

impl Opportunity {
    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }

    pub fn has_link(&self) -> bool {
        self.link.as_deref().is_some_and(|l| !l.trim().is_empty())
    }

    /// A row missing both a title and a link never reaches the datastore.
    pub fn is_persistable(&self) -> bool {
        self.has_title() || self.has_link()
    }
}

/// Column an upsert resolves conflicts on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKey {
    #[default]
    Link,
    Title,
}

impl ConflictKey {
    pub fn column(self) -> &'static str {
        match self {
            ConflictKey::Link => "link",
            ConflictKey::Title => "title",
        }
    }

    /// The key value of `opp`, or `None` when the column is blank.
    pub fn key_of(self, opp: &Opportunity) -> Option<&str> {
        let value = match self {
            ConflictKey::Link => opp.link.as_deref()?,
            ConflictKey::Title => opp.title.as_str(),
        };
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

/// Raw per-site listing as read from a page, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawListing {
    Arxiv(ArxivEntry),
    Devpost(DevpostTile),
    Unstop(UnstopCard),
    LinkedIn(LinkedInCard),
    /// Loosely-typed record, e.g. one submitted by hand through the admin panel.
    Generic(GenericListing),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArxivEntry {
    pub title: Option<String>,
    pub authors: Option<String>,
    pub abstract_href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevpostTile {
    pub title: Option<String>,
    pub organizer: Option<String>,
    pub tagline: Option<String>,
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnstopCard {
    pub title: Option<String>,
    pub organization: Option<String>,
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkedInCard {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericListing {
    pub title: Option<String>,
    pub organization: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    #[serde(rename = "type")]
    pub opportunity_type: Option<String>,
    pub education_level: Option<String>,
    pub requirements: Option<Vec<String>>,
    pub deadline: Option<String>,
    pub location: Option<String>,
}

/// Student profile as stored by the app backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub education_level: EducationLevel,
    #[serde(default)]
    pub major: Option<String>,
    #[serde(default)]
    pub gpa: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl UserProfile {
    /// Profile used before anyone signs in.
    pub fn guest() -> Self {
        Self {
            name: "Guest User".to_string(),
            email: String::new(),
            education_level: EducationLevel::Undergraduate,
            major: Some("Exploring".to_string()),
            gpa: None,
            interests: Vec::new(),
            skills: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingStatus {
    Saved,
    Applied,
    Interviewing,
    Offered,
}

/// A user's saved/applied entry pointing at an [`Opportunity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedOpportunity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub opportunity_id: String,
    pub status: TrackingStatus,
    #[serde(default)]
    pub notes: String,
    pub updated_at: DateTime<Utc>,
}

/// Static list of operator emails allowed to trigger a scrape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminAllowList {
    emails: BTreeSet<String>,
}

impl AdminAllowList {
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            emails: emails
                .into_iter()
                .map(|e| fold_email(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Parses a comma-separated list such as `a@x.org, B@y.org`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn is_admin(&self, email: &str) -> bool {
        let email = fold_email(email);
        !email.is_empty() && self.emails.contains(&email)
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

fn fold_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(title: &str, link: Option<&str>) -> Opportunity {
        Opportunity {
            id: link.unwrap_or(title).to_string(),
            title: title.to_string(),
            organization: "Devpost".into(),
            description: String::new(),
            opportunity_type: OpportunityType::Hackathon,
            education_level: EducationLevel::Undergraduate,
            link: link.map(ToString::to_string),
            requirements: vec![],
            deadline: None,
            location: None,
            source_id: "devpost".into(),
        }
    }

    #[test]
    fn coercion_is_case_and_separator_insensitive() {
        assert_eq!(OpportunityType::coerce("hackathon"), OpportunityType::Hackathon);
        assert_eq!(EducationLevel::coerce("High School"), EducationLevel::HighSchool);
        assert_eq!(EducationLevel::coerce(" high-school "), EducationLevel::HighSchool);
        assert_eq!(
            OpportunityType::coerce("Bootcamp"),
            OpportunityType::Other("Bootcamp".into())
        );
        assert!(!OpportunityType::coerce("Bootcamp").is_recognized());
    }

    #[test]
    fn opportunity_uses_app_wire_names() {
        let mut opp = sample("Hack the North", Some("https://devpost.com/h/1"));
        opp.deadline = NaiveDate::from_ymd_opt(2026, 11, 15);
        let json = serde_json::to_value(&opp).unwrap();
        assert_eq!(json["type"], "HACKATHON");
        assert_eq!(json["education_level"], "UNDERGRADUATE");
        assert_eq!(json["deadline"], "2026-11-15");

        let back: Opportunity = serde_json::from_value(json).unwrap();
        assert_eq!(back, opp);
    }

    #[test]
    fn unknown_enum_values_survive_deserialization() {
        let json = serde_json::json!({
            "id": "x", "title": "x", "organization": "o", "description": "",
            "type": "APPRENTICESHIP", "education_level": "POSTDOC",
            "link": null, "deadline": null, "source_id": "manual"
        });
        let opp: Opportunity = serde_json::from_value(json).unwrap();
        assert_eq!(opp.opportunity_type, OpportunityType::Other("APPRENTICESHIP".into()));
        assert_eq!(opp.education_level.as_str(), "POSTDOC");
        assert!(opp.requirements.is_empty());
    }

    #[test]
    fn persistable_requires_title_or_link() {
        assert!(sample("Title only", None).is_persistable());
        assert!(sample("", Some("https://x.org/1")).is_persistable());
        assert!(!sample("  ", None).is_persistable());
        assert!(!sample("", Some(" ")).is_persistable());
    }

    #[test]
    fn conflict_key_reads_the_declared_column() {
        let opp = sample("Hack", Some("https://devpost.com/h/1"));
        assert_eq!(ConflictKey::Link.key_of(&opp), Some("https://devpost.com/h/1"));
        assert_eq!(ConflictKey::Title.key_of(&opp), Some("Hack"));
        assert_eq!(ConflictKey::Link.key_of(&sample("Hack", None)), None);
        assert_eq!(ConflictKey::default().column(), "link");
    }

    #[test]
    fn raw_listing_is_tagged_by_site() {
        let raw = RawListing::Devpost(DevpostTile {
            title: Some("Hack".into()),
            ..Default::default()
        });
        let json = serde_json::to_value(&raw).unwrap();
        assert_eq!(json["kind"], "devpost");
    }

    #[test]
    fn tracking_status_wire_format() {
        let json = serde_json::to_value(TrackingStatus::Interviewing).unwrap();
        assert_eq!(json, "INTERVIEWING");
        let status: TrackingStatus = serde_json::from_value("OFFERED".into()).unwrap();
        assert_eq!(status, TrackingStatus::Offered);
    }

    #[test]
    fn admin_allow_list_ignores_case_and_whitespace() {
        let admins = AdminAllowList::parse("Ops@Example.org, second@example.org,,");
        assert_eq!(admins.len(), 2);
        assert!(admins.is_admin("ops@example.org"));
        assert!(admins.is_admin("  SECOND@example.org "));
        assert!(!admins.is_admin("intruder@example.org"));
        assert!(!admins.is_admin(""));
        assert!(AdminAllowList::default().is_empty());
    }
}
