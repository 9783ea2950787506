use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Frontend,
    Client,
    Admin,
    Unknown,
}

/// An upstream API token of the form `project:environment.secret`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeToken {
    pub token: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub environment: String,
    pub projects: Vec<String>,
}

impl EdgeToken {
    /// Parses a token, returning `None` when it lacks the project or
    /// environment separators.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        let (project, rest) = token.split_once(':')?;
        let (environment, _secret) = rest.split_once('.')?;

        Some(Self {
            token: token.to_string(),
            token_type: TokenType::Unknown,
            environment: environment.to_string(),
            projects: vec![project.to_string()],
        })
    }
}

/// Splits a comma separated token list, dropping blanks.
pub fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Human name of the environment a token belongs to: the text before the
/// first `.`.
pub fn remote_name(token: &str) -> String {
    token.split('.').next().unwrap_or_default().to_string()
}
