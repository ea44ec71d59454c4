//! Tracking URLs for published reports.
//!
//! A tracking URL is the published report URL plus a fixed set of
//! attribution parameters. The same inputs always produce the same bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::subjects::slugify;

/// Parameter keys owned by the tracking scheme, in emission order.
const TRACKING_KEYS: [&str; 6] = [
    "rt",
    "subject",
    "utm_campaign",
    "utm_content",
    "utm_medium",
    "utm_source",
];

/// Attribution values shared by every link in a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingParams {
    pub source: String,
    pub medium: String,
    pub campaign: String,
    /// Content variant (e.g. "report-link", "cta-button").
    pub content: String,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            source: "deep-research".to_string(),
            medium: "email".to_string(),
            campaign: "research-report".to_string(),
            content: "report-link".to_string(),
        }
    }
}

/// Short stable token identifying a recipient without exposing the address.
pub fn recipient_token(recipient: &str) -> String {
    let normalized = recipient.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

/// Build the tracking URL for `recipient` from a published report URL.
///
/// Existing query parameters on `base_url` are kept, except ones that
/// collide with tracking keys, which are replaced.
pub fn tracking_url(
    base_url: &str,
    subject_name: &str,
    recipient: &str,
    params: &TrackingParams,
) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base_url)?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_KEYS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let values = [
        recipient_token(recipient),
        slugify(subject_name),
        slugify(&params.campaign),
        slugify(&params.content),
        slugify(&params.medium),
        slugify(&params.source),
    ];

    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        for (key, value) in TRACKING_KEYS.iter().zip(values.iter()) {
            query.append_pair(key, value);
        }
    }

    Ok(url.to_string())
}
