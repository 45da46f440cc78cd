use chrono::{DateTime, Utc};
use jobmarket_core::{canonical_source_url, IdentityKey, JobPosting, RawCandidate};
use thiserror::Error;

use crate::normalize::Normalizer;
use crate::skills::SkillExtractor;

/// Why a candidate never became a [`JobPosting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("candidate has no title")]
    MissingTitle,
    #[error("candidate has no link, company or location to identify it by")]
    MissingIdentity,
}

/// Normalizes raw candidates into canonical postings.
#[derive(Debug, Clone)]
pub struct CandidateAssembler {
    normalizer: Normalizer,
    skills: SkillExtractor,
}

impl CandidateAssembler {
    pub fn new(normalizer: Normalizer, skills: SkillExtractor) -> Self {
        Self { normalizer, skills }
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn assemble(&self, raw: &RawCandidate, scraped_at: DateTime<Utc>) -> Result<JobPosting, RejectReason> {
        let n = &self.normalizer;
        let title = n.title(raw.title.as_deref()).ok_or(RejectReason::MissingTitle)?;
        let company = n.company(raw.company.as_deref());
        let city = n.city(raw.location.as_deref());
        let source_url = raw.source_url.as_deref().and_then(canonical_source_url);

        if source_url.is_none() && company.is_none() && city.is_none() {
            return Err(RejectReason::MissingIdentity);
        }

        let identity_key = IdentityKey::derive(
            source_url.as_deref(),
            &title,
            company.as_deref(),
            city.as_ref().map(|c| c.name.as_str()),
        );

        let description = raw
            .description_text
            .as_deref()
            .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|text| !text.is_empty());

        Ok(JobPosting {
            identity_key,
            skills: self.skills.extract_with_description(
                raw.skills_text.as_deref(),
                Some(&title),
                description.as_deref(),
            ),
            experience: n.experience(raw.experience_text.as_deref()),
            salary: n.salary(raw.salary_text.as_deref()),
            posted_on: n.posted_on(raw.posted_text.as_deref(), scraped_at),
            title,
            company,
            city,
            source_url,
            description,
            scraped_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::assembler;
    use chrono::{NaiveDate, TimeZone};
    use jobmarket_core::ExperienceLevel;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).single().expect("valid timestamp")
    }

    fn fresher_listing() -> RawCandidate {
        RawCandidate {
            page_index: 1,
            title: Some("Junior Data Analyst".into()),
            company: Some("Globex Solutions".into()),
            location: Some("Gurugram".into()),
            experience_text: Some("Fresher".into()),
            salary_text: Some("Not disclosed".into()),
            skills_text: Some("Advanced Excel, SQL".into()),
            posted_text: Some("Just Now".into()),
            source_url: Some("https://www.naukri.com/job-listings-junior-data-analyst-150324500456?src=x".into()),
            description_text: None,
        }
    }

    #[test]
    fn fresher_listing_normalizes_every_field() {
        let posting = assembler().assemble(&fresher_listing(), at()).expect("valid candidate");
        assert_eq!(posting.title, "Junior Data Analyst");
        assert_eq!(posting.company.as_deref(), Some("Globex Solutions"));
        assert_eq!(posting.city.as_ref().map(|c| c.name.as_str()), Some("Gurgaon"));
        assert_eq!(posting.experience.level(), ExperienceLevel::Entry);
        assert!(!posting.salary.disclosed);
        assert_eq!(posting.posted_on, NaiveDate::from_ymd_opt(2026, 3, 10));
        assert_eq!(
            posting.skills.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["excel", "sql"]
        );
        assert_eq!(
            posting.source_url.as_deref(),
            Some("https://www.naukri.com/job-listings-junior-data-analyst-150324500456")
        );
        assert!(posting.identity_key.is_url_derived());
        assert_eq!(posting.scraped_at, at());
    }

    #[test]
    fn description_feeds_skills_and_is_kept() {
        let mut raw = fresher_listing();
        raw.description_text = Some("  Prepare   MIS reports in Power BI\n and Python. ".into());
        let posting = assembler().assemble(&raw, at()).expect("posting");
        assert_eq!(posting.description.as_deref(), Some("Prepare MIS reports in Power BI and Python."));
        assert_eq!(
            posting.skills.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["excel", "power bi", "python", "sql"]
        );

        raw.description_text = Some("   ".into());
        assert!(assembler().assemble(&raw, at()).expect("posting").description.is_none());
    }

    #[test]
    fn untitled_candidates_are_rejected() {
        let mut raw = fresher_listing();
        raw.title = Some("   ".into());
        assert_eq!(assembler().assemble(&raw, at()), Err(RejectReason::MissingTitle));
    }

    #[test]
    fn candidates_without_any_identity_are_rejected() {
        let raw = RawCandidate {
            title: Some("Data Analyst".into()),
            source_url: Some("javascript:void(0)".into()),
            ..RawCandidate::default()
        };
        assert_eq!(assembler().assemble(&raw, at()), Err(RejectReason::MissingIdentity));
    }

    #[test]
    fn linkless_candidates_fall_back_to_composite_identity() {
        let mut a = fresher_listing();
        a.source_url = None;
        let mut b = a.clone();
        b.company = Some("Globex  Solutions Pvt. Ltd.".into());
        b.location = Some("Gurgaon".into());

        let asm = assembler();
        let pa = asm.assemble(&a, at()).expect("valid candidate");
        let pb = asm.assemble(&b, at()).expect("valid candidate");
        assert!(!pa.identity_key.is_url_derived());
        assert_eq!(pa.identity_key, pb.identity_key);
    }
}
