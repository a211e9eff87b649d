use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One post from the feed endpoint. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPost {
    /// Post id; replies reference it. The feed serializes it as a string or
    /// a bare number depending on the backend, so both shapes are accepted.
    #[serde(deserialize_with = "post_id")]
    pub count: String,
    #[serde(default)]
    pub body: String,
    pub date: DateTime<Utc>,
}

fn post_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// A dot command extracted from a post body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCommand {
    pub post_id: String,
    /// Keyword including the leading dot, e.g. ".random".
    pub keyword: String,
    /// First word after the keyword; empty when none was given.
    pub argument: String,
}
