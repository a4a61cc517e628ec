use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ladder_adapters::{
    extractor_for_source, normalize_all, GenericPageExtractor, SiteExtractor, SourceSite, GENERIC_SOURCE_ID,
};
use ladder_core::{EducationLevel, Opportunity, OpportunityType};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn read_fixture(source_id: &str) -> Result<String> {
    let path = workspace_root()
        .join("fixtures")
        .join(source_id)
        .join("sample")
        .join("listing.html");
    std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

fn scrape_fixture(source_id: &str, display_name: &str, listing_url: &str) -> Result<Vec<Opportunity>> {
    let html = read_fixture(source_id)?;
    let extractor = extractor_for_source(source_id).context("extractor registered")?;
    let site = SourceSite::from_listing_url(source_id, display_name, listing_url)?;
    Ok(normalize_all(extractor.extract(&html)?, &site))
}

#[test]
fn research_index_yields_graduate_research_with_absolute_links() -> Result<()> {
    let opps = scrape_fixture("arxiv", "arXiv", "https://arxiv.org/list/cs/new")?;

    assert_eq!(opps.len(), 2);
    for opp in &opps {
        assert_eq!(opp.opportunity_type, OpportunityType::Research);
        assert_eq!(opp.education_level, EducationLevel::Graduate);
        assert!(opp.link.as_deref().unwrap().starts_with("https://arxiv.org/abs/"));
        assert_eq!(opp.requirements, vec!["Literature Review", "Academic Writing"]);
    }
    assert_eq!(opps[0].title, "Sparse Attention for Long-Context Retrieval");
    assert_eq!(opps[0].organization, "Jane Doe, Richard Roe");
    assert_eq!(opps[0].link.as_deref(), Some("https://arxiv.org/abs/2410.01234"));
    assert_eq!(opps[1].organization, "Kim Lee");
    Ok(())
}

#[test]
fn hackathon_listing_resolves_relative_tiles() -> Result<()> {
    let opps = scrape_fixture("devpost", "Devpost", "https://devpost.com/hackathons")?;

    assert_eq!(opps.len(), 2);
    assert_eq!(opps[0].organization, "Major League Hacking");
    assert_eq!(opps[0].link.as_deref(), Some("https://campus-build.devpost.com/"));
    assert_eq!(opps[1].organization, "Devpost");
    assert_eq!(opps[1].link.as_deref(), Some("https://devpost.com/hackathons/green-code"));
    assert!(opps.iter().all(|o| o.opportunity_type == OpportunityType::Hackathon));
    Ok(())
}

#[test]
fn competition_cards_keep_unusable_entries_for_the_sink_to_drop() -> Result<()> {
    let opps = scrape_fixture("unstop", "Unstop", "https://unstop.com/competitions")?;

    assert_eq!(opps.len(), 3);
    assert_eq!(opps[0].link.as_deref(), Some("https://unstop.com/competitions/national-quiz-2026"));
    assert_eq!(opps[1].organization, "Flipkart");
    assert!(!opps[2].is_persistable());
    Ok(())
}

#[test]
fn internship_search_cards_carry_location() -> Result<()> {
    let opps = scrape_fixture("linkedin", "LinkedIn", "https://www.linkedin.com/jobs/search?keywords=internship")?;

    assert_eq!(opps.len(), 1);
    assert_eq!(opps[0].opportunity_type, OpportunityType::Internship);
    assert_eq!(opps[0].organization, "Acme Robotics");
    assert_eq!(opps[0].location.as_deref(), Some("Remote"));
    Ok(())
}

#[test]
fn submitted_page_becomes_one_dated_opportunity() -> Result<()> {
    let url = "https://northwind.example/fellowships/urf?ref=admin";
    let html = read_fixture(GENERIC_SOURCE_ID)?;
    let site = SourceSite::from_listing_url(GENERIC_SOURCE_ID, "northwind.example", url)?;
    let opps = normalize_all(GenericPageExtractor::new(url).extract(&html)?, &site);

    assert_eq!(opps.len(), 1);
    let opp = &opps[0];
    assert_eq!(opp.title, "Undergraduate Research Fellowship");
    assert_eq!(opp.organization, "Northwind Institute");
    assert_eq!(opp.description, "Ten-week funded summer fellowship in applied robotics.");
    assert_eq!(opp.link.as_deref(), Some(url));
    assert_eq!(opp.deadline, chrono::NaiveDate::from_ymd_opt(2026, 3, 15));
    assert_eq!(opp.requirements, vec!["Sophomore or junior standing", "Python or C++"]);
    assert_eq!(opp.opportunity_type, OpportunityType::Internship);
    assert_eq!(opp.source_id, "manual");
    Ok(())
}
