//! Fully-qualified command names.
//!
//! Every command is addressed as `<service>.<method>`. The service half is
//! the only routing key; there is no versioning.

use std::fmt;

/// A command name split into its service and method halves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandName {
    pub service: String,
    pub method: String,
}

impl CommandName {
    /// Parses `name`, qualifying it with `own_service` when it has no dot.
    ///
    /// The split happens on the first `.` only, so `"svc.a.b"` yields
    /// service `"svc"` and method `"a.b"`.
    #[must_use]
    pub fn qualify(name: &str, own_service: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| Self::new(own_service, name))
    }

    /// Parses an already-qualified name. Returns `None` when there is no dot.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        name.split_once('.').map(|(service, method)| Self {
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    /// Builds a name from its two halves.
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Returns `true` when this command belongs to `service`.
    #[must_use]
    pub fn is_owned_by(&self, service: &str) -> bool {
        self.service == service
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_keeps_explicit_service() {
        let name = CommandName::qualify("orderService.create", "billing");
        assert_eq!(name.service, "orderService");
        assert_eq!(name.method, "create");
    }

    #[test]
    fn qualify_prefixes_bare_method_with_own_service() {
        let name = CommandName::qualify("create", "billing");
        assert_eq!(name, CommandName::new("billing", "create"));
        assert_eq!(name.to_string(), "billing.create");
    }

    #[test]
    fn split_happens_on_first_dot_only() {
        let name = CommandName::qualify("svc.nested.method", "other");
        assert_eq!(name.service, "svc");
        assert_eq!(name.method, "nested.method");
    }

    #[test]
    fn parse_rejects_unqualified() {
        assert!(CommandName::parse("create").is_none());
        assert_eq!(
            CommandName::parse("a.b"),
            Some(CommandName::new("a", "b"))
        );
    }

    #[test]
    fn ownership_check() {
        let name = CommandName::new("control", "getServices");
        assert!(name.is_owned_by("control"));
        assert!(!name.is_owned_by("orders"));
    }
}
