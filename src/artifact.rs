use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ArtifactParseError;
use crate::session::Artifact;
use crate::stripper::RawArtifactBlock;

const DEFAULT_LANGUAGE: &str = "text";
const DEFAULT_TITLE: &str = "Untitled";

/// Artifact fields as parsed from markup or received on the wire, before the client
/// stamps them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactPayload {
    #[serde(default)]
    pub id: Option<String>,
    pub language: String,
    pub title: String,
    pub code: String,
}

impl ArtifactPayload {
    /// Creation time is always the local detection instant.
    pub fn into_artifact(self) -> Artifact {
        Artifact {
            id: self.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(|| Uuid::new_v4().to_string()),
            language: self.language,
            title: self.title,
            code: self.code,
            created_at: Utc::now(),
        }
    }
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid attribute regex")
    })
}

#[derive(Debug, Clone, Copy)]
enum Element {
    Language,
    Title,
    Code,
}

impl Element {
    fn re(self) -> &'static Regex {
        static LANGUAGE: OnceLock<Regex> = OnceLock::new();
        static TITLE: OnceLock<Regex> = OnceLock::new();
        static CODE: OnceLock<Regex> = OnceLock::new();
        // Only elements leading the body are metadata; later tags are part of the code.
        let (cell, pattern) = match self {
            Self::Language => (&LANGUAGE, r"(?s)\A\s*<language>(.*?)</language>"),
            Self::Title => (&TITLE, r"(?s)\A\s*<title>(.*?)</title>"),
            Self::Code => (&CODE, r"(?s)\A\s*<code>(.*)</code>\s*\z"),
        };
        cell.get_or_init(|| Regex::new(pattern).expect("valid element regex"))
    }

    fn capture(self, body: &str) -> Option<String> {
        self.re().captures(body).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
    }

    /// Removes the element from the front of `body`, returning its content.
    fn take(self, body: &mut String) -> Option<String> {
        let value = self.capture(body.as_str())?;
        *body = self.re().replace(body.as_str(), "").into_owned();
        Some(value)
    }
}

fn attribute(open_tag: &str, key: &str) -> Option<String> {
    attr_re().captures_iter(open_tag).find_map(|c| {
        if c.get(1)?.as_str().eq_ignore_ascii_case(key) {
            c.get(2).or_else(|| c.get(3)).map(|m| m.as_str().to_string())
        } else {
            None
        }
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parses a completed block into artifact fields.
///
/// Metadata comes from the opening tag's `type`, `language` and `title` attributes,
/// or from `<language>`/`<title>` elements leading the body. A `<code>` element
/// wrapping the rest of the body holds the code; otherwise the rest is the code.
pub fn parse_artifact(block: &RawArtifactBlock) -> Result<ArtifactPayload, ArtifactParseError> {
    if let Some(kind) = non_empty(attribute(&block.open_tag, "type")) {
        if !kind.eq_ignore_ascii_case("code") {
            return Err(ArtifactParseError::UnsupportedType(kind));
        }
    }

    // Metadata elements never belong to the code, whether or not an attribute wins.
    let mut body = block.body.clone();
    let mut language_element = None;
    let mut title_element = None;
    loop {
        if language_element.is_none() {
            if let Some(value) = Element::Language.take(&mut body) {
                language_element = Some(value);
                continue;
            }
        }
        if title_element.is_none() {
            if let Some(value) = Element::Title.take(&mut body) {
                title_element = Some(value);
                continue;
            }
        }
        break;
    }

    let language = non_empty(attribute(&block.open_tag, "language"))
        .or_else(|| non_empty(language_element))
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
    let title = non_empty(attribute(&block.open_tag, "title"))
        .or_else(|| non_empty(title_element))
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let code = Element::Code.capture(&body).unwrap_or(body);

    let code = code.trim().to_string();
    if code.is_empty() {
        return Err(ArtifactParseError::EmptyCode);
    }

    Ok(ArtifactPayload { id: None, language, title, code })
}
