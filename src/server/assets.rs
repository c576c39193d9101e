//! Embedded dashboard and login pages.

use crate::utils::error::AssetError;

/// Marker in the dashboard template replaced by the config token.
pub const TOKEN_PLACEHOLDER: &str = "{{AUTH_TOKEN}}";

const INDEX_HTML: &str = include_str!("../../assets/web/index.html");
const LOGIN_HTML: &str = include_str!("../../assets/web/login.html");

/// Pages served by the HTTP front end, checked once at startup.
#[derive(Debug, Clone)]
pub struct Assets {
    dashboard: String,
    login: String,
}

impl Assets {
    /// Loads the pages compiled into the binary.
    pub fn load() -> Result<Self, AssetError> {
        Self::from_sources(INDEX_HTML, LOGIN_HTML)
    }

    pub fn from_sources(dashboard: &str, login: &str) -> Result<Self, AssetError> {
        if dashboard.trim().is_empty() {
            return Err(AssetError::Empty("index.html"));
        }
        if login.trim().is_empty() {
            return Err(AssetError::Empty("login.html"));
        }
        if !dashboard.contains(TOKEN_PLACEHOLDER) {
            return Err(AssetError::MissingPlaceholder(TOKEN_PLACEHOLDER));
        }
        Ok(Self {
            dashboard: dashboard.to_string(),
            login: login.to_string(),
        })
    }

    pub fn login_page(&self) -> &str {
        &self.login
    }

    /// The dashboard with `token` substituted, empty when none is configured.
    pub fn render_dashboard(&self, token: Option<&str>) -> String {
        self.dashboard
            .replace(TOKEN_PLACEHOLDER, &escape_html(token.unwrap_or_default()))
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
