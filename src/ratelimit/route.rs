//! Bucket key generation from request paths.

/// Resources whose ID is part of the bucket identity.
const DEFAULT_MAJORS: &[&str] = &["channels", "guilds", "webhooks"];

/// Builds bucket keys from request paths.
///
/// Numeric path segments are resource IDs. The ID directly after a major
/// resource (for example the channel in `channels/{id}/...`) keeps requests
/// for different channels in separate buckets; every other ID is blanked so
/// all messages of one channel share a bucket.
#[derive(Debug, Clone)]
pub struct RouteKey {
    majors: Vec<String>,
}

impl RouteKey {
    pub fn new() -> Self {
        Self::with_majors(DEFAULT_MAJORS.iter().copied())
    }

    /// Use a custom set of major resources.
    pub fn with_majors<I, S>(majors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            majors: majors.into_iter().map(Into::into).collect(),
        }
    }

    /// Normalize a request path or URL into a bucket key.
    pub fn normalize(&self, path: &str) -> String {
        let path = path.split(['?', '#']).next().unwrap_or_default();

        let mut previous: Option<&str> = None;
        let segments: Vec<&str> = path
            .split('/')
            .map(|segment| {
                let keep = !is_id(segment)
                    || previous.is_some_and(|p| self.majors.iter().any(|m| m == p));
                previous = Some(segment);
                if keep {
                    segment
                } else {
                    ""
                }
            })
            .collect();

        segments.join("/")
    }
}

impl Default for RouteKey {
    fn default() -> Self {
        Self::new()
    }
}

fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}
