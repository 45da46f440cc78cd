//! Total, per-field transforms from scraped text to typed values. Nothing in
//! here fails: unreadable input degrades to `None` or an unknown range.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Days, NaiveDate, Utc};
use jobmarket_core::{CityName, ExperienceRange, SalaryRange};
use regex::Regex;

use crate::rules::CityRulesFile;

const ABSOLUTE_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d %b %Y",
    "%d %B %Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

#[derive(Debug, Clone)]
pub struct Normalizer {
    cities: HashMap<String, String>,
    experience_range: Regex,
    experience_open: Regex,
    experience_single: Regex,
    amount: Regex,
    thousands: Regex,
    relative_age: Regex,
    parenthetical: Regex,
    company_suffix: Regex,
}

impl Normalizer {
    pub fn new(cities: &CityRulesFile) -> Result<Self> {
        Ok(Self {
            cities: cities
                .aliases
                .iter()
                .map(|(alias, canonical)| (fold(alias), canonical.trim().to_string()))
                .collect(),
            experience_range: Regex::new(r"(\d+)\s*(?:-|–|to)\s*(\d+)")?,
            experience_open: Regex::new(r"(\d+)\s*\+")?,
            experience_single: Regex::new(r"(\d+)\s*(?:yrs?|years?)\b")?,
            amount: Regex::new(r"\d+(?:,\d+)*(?:\.\d+)?")?,
            thousands: Regex::new(r"\d\s*k\b")?,
            relative_age: Regex::new(
                r"(\d+)\s*\+?\s*(minute|min|hour|hr|day|week|month|year)s?\s*ago",
            )?,
            parenthetical: Regex::new(r"\([^)]*\)")?,
            company_suffix: Regex::new(
                r"(?i)[\s,]+(?:pvt|private|ltd|limited|inc|corp|corporation|llp|llc)\.?$",
            )?,
        })
    }

    /// "2-4 Yrs" -> (2, 4); "5+ Yrs" -> (5, open); "3 Yrs" -> (3, 3); "Fresher" -> (0, 0).
    pub fn experience(&self, text: Option<&str>) -> ExperienceRange {
        let Some(text) = text else {
            return ExperienceRange::unknown();
        };
        let lower = text.to_lowercase();

        if let Some(caps) = self.experience_range.captures(&lower) {
            if let (Some(a), Some(b)) = (parse_u32(&caps[1]), parse_u32(&caps[2])) {
                return ExperienceRange::new(Some(a.min(b)), Some(a.max(b)));
            }
            return ExperienceRange::unknown();
        }
        if let Some(caps) = self.experience_open.captures(&lower) {
            return ExperienceRange::new(parse_u32(&caps[1]), None);
        }
        if let Some(caps) = self.experience_single.captures(&lower) {
            let years = parse_u32(&caps[1]);
            return ExperienceRange::new(years, years);
        }
        if lower.contains("fresher") || lower.contains("entry level") {
            return ExperienceRange::new(Some(0), Some(0));
        }
        ExperienceRange::unknown()
    }

    /// Annual amounts in whole currency units. Lakh/lac figures scale by 1e5,
    /// crore by 1e7 and a `k` suffix by 1e3; bare rupee figures are taken as-is.
    pub fn salary(&self, text: Option<&str>) -> SalaryRange {
        let Some(text) = text else {
            return SalaryRange::undisclosed();
        };
        let lower = text.to_lowercase();
        if ["not disclosed", "not mentioned", "undisclosed", "competitive"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            return SalaryRange::undisclosed();
        }

        let amounts: Vec<f64> = self
            .amount
            .find_iter(&lower)
            .filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .take(2)
            .collect();
        let Some(&first) = amounts.first() else {
            return SalaryRange::undisclosed();
        };

        let scale = if lower.contains("crore") || lower.contains(" cr") {
            10_000_000.0
        } else if lower.contains("lakh") || lower.contains("lac") || lower.contains("lpa") {
            100_000.0
        } else if self.thousands.is_match(&lower) {
            1_000.0
        } else {
            1.0
        };
        let currency = if lower.contains('$') || lower.contains("usd") {
            "USD"
        } else {
            "INR"
        };

        let (min, max) = match amounts.get(1) {
            Some(&second) => (Some(first.min(second) * scale), Some(first.max(second) * scale)),
            None if lower.contains("up to") || lower.contains("upto") => (None, Some(first * scale)),
            None => (Some(first * scale), Some(first * scale)),
        };
        SalaryRange {
            min,
            max,
            currency: Some(currency.to_string()),
            disclosed: true,
        }
    }

    /// First location segment, without country suffix or parenthetical notes,
    /// looked up case-insensitively in the alias table.
    pub fn city(&self, text: Option<&str>) -> Option<CityName> {
        let text = text?;
        let without_notes = self.parenthetical.replace_all(text, " ");
        let first = without_notes
            .split([',', '/', ';', '|'])
            .map(|segment| segment.split_whitespace().collect::<Vec<_>>().join(" "))
            .find(|segment| !segment.is_empty())?;

        match self.cities.get(&first.to_lowercase()) {
            Some(canonical) => Some(CityName {
                name: canonical.clone(),
                unmapped: false,
            }),
            None => Some(CityName {
                name: first,
                unmapped: true,
            }),
        }
    }

    /// Relative ages resolve against `scraped_at`; a month counts as 30 days.
    pub fn posted_on(&self, text: Option<&str>, scraped_at: DateTime<Utc>) -> Option<NaiveDate> {
        let text = text?.trim();
        let lower = text.to_lowercase();
        let today = scraped_at.date_naive();

        if ["just now", "today", "few hours ago", "hours ago", "minutes ago"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            return Some(today);
        }
        if lower.contains("yesterday") {
            return today.checked_sub_days(Days::new(1));
        }
        if let Some(caps) = self.relative_age.captures(&lower) {
            let n: u64 = caps[1].parse().ok()?;
            let days = match &caps[2] {
                "minute" | "min" | "hour" | "hr" => 0,
                "day" => n,
                "week" => n.checked_mul(7)?,
                "month" => n.checked_mul(30)?,
                _ => n.checked_mul(365)?,
            };
            return today.checked_sub_days(Days::new(days));
        }

        let absolute = strip_prefix_ci(text, "posted on")
            .or_else(|| strip_prefix_ci(text, "posted"))
            .unwrap_or(text)
            .trim();
        ABSOLUTE_DATE_FORMATS
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(absolute, format).ok())
    }

    /// Collapses whitespace and strips trailing legal-entity suffixes.
    pub fn company(&self, text: Option<&str>) -> Option<String> {
        let mut name = text?.split_whitespace().collect::<Vec<_>>().join(" ");
        loop {
            let stripped = self.company_suffix.replace(&name, "").into_owned();
            if stripped == name {
                break;
            }
            name = stripped;
        }
        let name = name.trim_matches(|c: char| c == ',' || c == '.' || c.is_whitespace());
        (!name.is_empty()).then(|| name.to_string())
    }

    pub fn title(&self, text: Option<&str>) -> Option<String> {
        let title = text?.split_whitespace().collect::<Vec<_>>().join(" ");
        (!title.is_empty()).then_some(title)
    }
}

fn parse_u32(digits: &str) -> Option<u32> {
    digits.parse().ok()
}

fn fold(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}
