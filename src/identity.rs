//! Authenticated identity carried through request extensions.
//!
//! Authenticating middleware inserts a [`Subject`] once a credential has been
//! fully validated; the proxy core reads it back when rewriting the outbound
//! request. Inserting again replaces the previous value, so the innermost
//! authenticating middleware wins.

use std::fmt;

use axum::http::Request;

/// Opaque, non-empty identity of the caller (JWT `sub` or OIDC profile name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    /// Returns `None` for an empty identity, which is never propagated.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        (!value.is_empty()).then_some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extension trait to read and attach the subject on a request.
pub trait SubjectExt {
    fn subject(&self) -> Option<&Subject>;

    fn set_subject(&mut self, subject: Subject);
}

impl<B> SubjectExt for Request<B> {
    fn subject(&self) -> Option<&Subject> {
        self.extensions().get::<Subject>()
    }

    fn set_subject(&mut self, subject: Subject) {
        self.extensions_mut().insert(subject);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_empty_subject_rejected() {
        assert!(Subject::new("").is_none());
        assert_eq!(Subject::new("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn test_later_insert_wins() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        assert!(req.subject().is_none());

        req.set_subject(Subject::new("from-oidc").unwrap());
        req.set_subject(Subject::new("from-jwt").unwrap());

        assert_eq!(req.subject().unwrap().as_str(), "from-jwt");
    }
}
