use semver::Version;

/// Well-known floating tags, most preferred first.
pub const PREFERRED_TAGS: [&str; 4] = ["stable", "latest", "lts", "alpine"];

/// Chooses the tag to scan from a pre-fetched candidate list.
///
/// Order of preference:
/// 1. the first of [`PREFERRED_TAGS`] present in `candidates`
/// 2. the highest stable (non-prerelease) semantic version among the candidates
/// 3. `fallback` when there are no candidates at all
/// 4. the first candidate
///
/// # Example
///
/// ```
/// use imagescan::resolver::select_tag;
///
/// let tags = vec!["16-bullseye".to_string(), "stable".to_string()];
/// assert_eq!(select_tag(&tags, "latest"), "stable");
/// assert_eq!(select_tag(&[], "latest"), "latest");
/// ```
pub fn select_tag(candidates: &[String], fallback: &str) -> String {
    if candidates.is_empty() {
        return fallback.to_string();
    }

    for preferred in PREFERRED_TAGS {
        if candidates.iter().any(|t| t == preferred) {
            return preferred.to_string();
        }
    }

    if let Some(tag) = highest_stable_version(candidates) {
        return tag.to_string();
    }

    candidates[0].clone()
}

fn highest_stable_version(candidates: &[String]) -> Option<&str> {
    let mut best: Option<(Version, &str)> = None;

    for tag in candidates {
        let Some(version) = parse_version_tag(tag) else {
            continue;
        };
        if !version.pre.is_empty() {
            continue;
        }
        // Strictly greater keeps the earliest candidate on ties ("16" vs "16.0.0").
        if best.as_ref().is_none_or(|(current, _)| version > *current) {
            best = Some((version, tag.as_str()));
        }
    }

    best.map(|(_, tag)| tag)
}

/// Parses image tags that look like versions, padding short forms.
///
/// `"16"` and `"v1.25"` become `16.0.0` and `1.25.0`; a suffix such as
/// `"-bullseye"` is kept as a prerelease so variant tags are never "stable".
fn parse_version_tag(tag: &str) -> Option<Version> {
    let tag = tag.trim_start_matches('v');
    let split_at = tag.find(['-', '+']).unwrap_or(tag.len());
    let (core, rest) = tag.split_at(split_at);

    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);

    Version::parse(&padded).ok()
}
