use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::HeaderValue;

use crate::error::Error;
use crate::util::parse_header_value;

pub(crate) const BASIC_AUTH_SCHEME: &str = "Basic";
pub(crate) const BEARER_AUTH_SCHEME: &str = "Bearer";

/// Credentials sent as `Authorization: <scheme> <token>` on every attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    scheme: String,
    token: String,
}

impl Auth {
    pub fn basic(username: &str, password: &str) -> Self {
        let token = STANDARD.encode(format!("{username}:{password}"));
        Self::custom(BASIC_AUTH_SCHEME, token)
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::custom(BEARER_AUTH_SCHEME, token)
    }

    pub fn custom(scheme: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            token: token.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `None` when either part is empty.
    pub(crate) fn header_value(&self) -> Result<Option<HeaderValue>, Error> {
        if self.scheme.is_empty() || self.token.is_empty() {
            return Ok(None);
        }
        let mut value = parse_header_value(
            http::header::AUTHORIZATION.as_str(),
            &format!("{} {}", self.scheme, self.token),
        )?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Auth")
            .field("scheme", &self.scheme)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Auth;

    #[test]
    fn basic_auth_encodes_username_and_password() {
        let auth = Auth::basic("u", "p");
        assert_eq!(auth.scheme(), "Basic");
        assert_eq!(auth.token(), "dTpw");
    }

    #[test]
    fn header_value_joins_scheme_and_token() {
        let value = Auth::bearer("token")
            .header_value()
            .expect("header should parse")
            .expect("header should be present");
        assert_eq!(value.to_str().expect("ascii"), "Bearer token");
        assert!(value.is_sensitive());
    }

    #[test]
    fn header_value_is_absent_when_a_part_is_empty() {
        assert!(
            Auth::custom("", "token")
                .header_value()
                .expect("no parse")
                .is_none()
        );
        assert!(
            Auth::custom("Scheme", "")
                .header_value()
                .expect("no parse")
                .is_none()
        );
    }

    #[test]
    fn debug_output_hides_the_token() {
        let text = format!("{:?}", Auth::bearer("secret-token"));
        assert!(!text.contains("secret-token"));
    }
}
