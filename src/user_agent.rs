//! User-Agent string sent with every PubChem request.

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/chemfetch";

/// Default User-Agent: tool name, crate version and contact URL.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("chemfetch/{version} (compound-property-client; +{PROJECT_UA_URL})")
}
