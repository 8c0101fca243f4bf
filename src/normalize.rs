//! Reshapes a raw upstream insight into the flat record the browser reads.
//!
//! `normalize` has no failure path: every missing field falls back to an
//! empty string, an empty list, or zero.

use crate::models::{
    AvailableVersion, License, LookupKey, Malysis, Metadata, NormalizedPackageData,
    PackageStats, RawInsight, RawLicense, RawScorecard, RawVulnerability, Scorecard,
    ScorecardCheck, Vulnerability,
};

const RISK_PREFIX: &str = "RISK_";

/// Severity as it arrived, before conversion to a display string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SeveritySource<'a> {
    /// Structured `severities[].risk`, e.g. `RISK_HIGH`.
    Risk(&'a str),
    /// Flat `severity`, e.g. `HIGH`.
    Plain(&'a str),
    Missing,
}

impl<'a> SeveritySource<'a> {
    /// The structured shape wins when both are present.
    fn of(vuln: &'a RawVulnerability) -> Self {
        let risk = vuln
            .severities
            .iter()
            .flatten()
            .find_map(|s| s.risk.as_deref().filter(|r| !r.is_empty()));

        match (risk, vuln.severity.as_deref()) {
            (Some(risk), _) => SeveritySource::Risk(risk),
            (None, Some(plain)) if !plain.is_empty() => SeveritySource::Plain(plain),
            _ => SeveritySource::Missing,
        }
    }

    fn display(&self) -> String {
        match self {
            SeveritySource::Risk(s) | SeveritySource::Plain(s) => display_severity(s),
            SeveritySource::Missing => String::new(),
        }
    }
}

/// `RISK_CRITICAL` becomes `Critical`; anything without the prefix is kept
/// verbatim.
pub fn display_severity(raw: &str) -> String {
    match raw.strip_prefix(RISK_PREFIX) {
        Some(level) => title_case(level),
        None => raw.to_string(),
    }
}

fn title_case(s: &str) -> String {
    let lower = s.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn normalize(raw: RawInsight, key: &LookupKey) -> NormalizedPackageData {
    let first_project = raw
        .project_insights
        .as_ref()
        .and_then(|projects| projects.first());

    let scorecard = first_project
        .and_then(|p| p.scorecard.as_ref())
        .map(normalize_scorecard)
        .unwrap_or_default();

    let source_url = first_project
        .and_then(|p| p.project.as_ref())
        .and_then(|p| p.url.clone())
        .unwrap_or_default();

    let vulnerabilities: Vec<Vulnerability> = raw
        .vulnerabilities
        .unwrap_or_default()
        .into_iter()
        .map(normalize_vulnerability)
        .collect();

    let licenses: Vec<License> = raw
        .licenses
        .and_then(|l| l.licenses)
        .unwrap_or_default()
        .into_iter()
        .map(normalize_license)
        .collect();

    let available_versions = raw
        .available_versions
        .unwrap_or_default()
        .into_iter()
        .map(|v| AvailableVersion {
            version: v.version.unwrap_or_default(),
            published_at: v.published_at.unwrap_or_default(),
            is_default: v.default_version.unwrap_or_default(),
        })
        .collect();

    let stats = PackageStats {
        vulnerability_count: vulnerabilities.len(),
        scorecard_score: scorecard.score,
        primary_license: primary_license(&licenses),
    };

    NormalizedPackageData {
        ecosystem: key.ecosystem.as_str().to_string(),
        name: key.name.clone(),
        version: key.version.clone(),
        vulnerabilities,
        scorecard,
        licenses,
        available_versions,
        metadata: Metadata {
            analyzed_at: raw.package_published_at.unwrap_or_default(),
            source_url,
            sha256: String::new(),
        },
        stats,
        malysis: Malysis::default(),
    }
}

fn normalize_vulnerability(vuln: RawVulnerability) -> Vulnerability {
    let severity = SeveritySource::of(&vuln).display();

    Vulnerability {
        id: vuln.id.map(|id| id.into_string()).unwrap_or_default(),
        summary: vuln.summary.unwrap_or_default(),
        details: vuln.details.unwrap_or_default(),
        severity,
        aliases: vuln
            .aliases
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.into_string())
            .collect(),
        published_at: vuln.published_at.unwrap_or_default(),
        modified_at: vuln.modified_at.unwrap_or_default(),
        fixed_version: vuln.fixed_version.unwrap_or_default(),
    }
}

fn normalize_scorecard(raw: &RawScorecard) -> Scorecard {
    Scorecard {
        score: raw.score.unwrap_or_default(),
        checks: raw
            .checks
            .iter()
            .flatten()
            .map(|c| ScorecardCheck {
                name: c.name.clone().unwrap_or_default(),
                score: c.score.as_ref().map(|s| s.value()).unwrap_or_default(),
                reason: c.reason.clone().unwrap_or_default(),
                details: c.details.clone().unwrap_or_default(),
            })
            .collect(),
    }
}

fn normalize_license(raw: RawLicense) -> License {
    License {
        spdx_id: raw.spdx_id.unwrap_or_default(),
        name: raw.name.unwrap_or_default(),
        url: raw.url.unwrap_or_default(),
    }
}

fn primary_license(licenses: &[License]) -> String {
    licenses
        .first()
        .and_then(|l| {
            [&l.spdx_id, &l.name]
                .into_iter()
                .find(|s| !s.is_empty())
                .cloned()
        })
        .unwrap_or_else(|| "Unknown".to_string())
}
