//! Domain error model.
//!
//! Expected failures are values, not panics. Every command, aggregate
//! operation, and storage call returns `DomainResult<T>`; the kind
//! discriminates how the boundary reacts (retry, 4xx mapping, operator
//! alert). Only invariant violations that indicate a programming bug may
//! panic.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Result type used across the domain and infrastructure layers.
pub type DomainResult<T> = Result<T, DomainError>;

/// String-coded error category.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    OptimisticLock,
    Unauthorized,
    Forbidden,
    BusinessRule,
    Concurrency,
    Infrastructure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::OptimisticLock => "optimistic-lock",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::BusinessRule => "business-rule",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP-style status the boundary maps this kind to.
    ///
    /// Delivery failures never reach the original caller; this mapping only
    /// applies to synchronous command results.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::OptimisticLock => 409,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::BusinessRule => 422,
            ErrorKind::Concurrency => 409,
            ErrorKind::Infrastructure => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-level error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DomainError {
    pub kind: ErrorKind,
    pub message: String,
    /// Rule identifier for business-rule and optimistic-lock failures
    /// (e.g. `policy.activate.not_draft`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rule: Option<String>,
    /// Upstream service name for infrastructure failures.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<JsonValue>,
}

impl DomainError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            rule: None,
            service: None,
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn optimistic_lock(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OptimisticLock, message).with_rule(rule)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn business_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessRule, message).with_rule(rule)
    }

    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Concurrency, message)
    }

    pub fn infrastructure(service: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Infrastructure, message);
        err.service = Some(service.into());
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_are_string_coded() {
        assert_eq!(ErrorKind::OptimisticLock.as_str(), "optimistic-lock");
        assert_eq!(ErrorKind::BusinessRule.as_str(), "business-rule");
        assert_eq!(
            serde_json::to_value(ErrorKind::NotFound).unwrap(),
            json!("not-found")
        );
    }

    #[test]
    fn business_rule_carries_rule_id() {
        let err = DomainError::business_rule("policy.activate.not_draft", "policy is active");
        assert_eq!(err.kind, ErrorKind::BusinessRule);
        assert_eq!(err.rule.as_deref(), Some("policy.activate.not_draft"));
    }

    #[test]
    fn infrastructure_carries_service() {
        let err = DomainError::infrastructure("postgres", "connection refused");
        assert_eq!(err.service.as_deref(), Some("postgres"));
        assert_eq!(err.kind.http_status(), 503);
    }

    #[test]
    fn boundary_status_mapping() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::OptimisticLock.http_status(), 409);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::BusinessRule.http_status(), 422);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }
}
