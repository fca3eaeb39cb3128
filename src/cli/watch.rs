//! Line protocol read by `keel watch`.

use serde::Deserialize;

use crate::pipeline::SourceEvent;

/// One line of `watch` input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WatchInput {
    /// Approve the plan waiting in an environment.
    Approve {
        /// Environment name.
        approve: String,
    },
    /// Reject the plan waiting in an environment.
    Reject {
        /// Environment name.
        reject: String,
        /// Why.
        #[serde(default)]
        reason: Option<String>,
    },
    /// A push.
    Event(SourceEvent),
}

impl WatchInput {
    /// Parses one line. Blank lines and `#` comments yield `None`.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for a line that is none of the accepted shapes.
    pub fn parse_line(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let input = WatchInput::parse_line(r#"{"branch": "refs/heads/main", "commit": "9f1c"}"#)
            .expect("parses");
        assert_eq!(
            input,
            Some(WatchInput::Event(SourceEvent::new("refs/heads/main", "9f1c")))
        );
    }

    #[test]
    fn test_parse_signals() {
        assert_eq!(
            WatchInput::parse_line(r#"{"approve": "prod"}"#).expect("parses"),
            Some(WatchInput::Approve {
                approve: String::from("prod")
            })
        );
        assert_eq!(
            WatchInput::parse_line(r#"{"reject": "prod", "reason": "freeze"}"#).expect("parses"),
            Some(WatchInput::Reject {
                reject: String::from("prod"),
                reason: Some(String::from("freeze")),
            })
        );
    }

    #[test]
    fn test_blank_and_garbage() {
        assert_eq!(WatchInput::parse_line("   ").expect("blank"), None);
        assert_eq!(WatchInput::parse_line("# comment").expect("comment"), None);
        assert!(WatchInput::parse_line(r#"{"branch": "main"}"#).is_err());
    }
}
