use std::fmt;

use serde::{Deserialize, Serialize};

/// The kinds of node a control pipeline can be attached to, either as
/// the origin of a request or as its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    Undefined,
    Any,
    Service,
    Api,
    Notification,
    Schedule,
    Script,
    Broadcast,
    Asset,
}

impl EndpointKind {
    /// Map the name used in the endpoint-type lookup tables onto a kind.
    /// Unknown names map to `Undefined` so a bad row never panics a load.
    pub fn parse(name: &str) -> EndpointKind {
        match name {
            "Any" => EndpointKind::Any,
            "Service" => EndpointKind::Service,
            "API" => EndpointKind::Api,
            "Notification" => EndpointKind::Notification,
            "Schedule" => EndpointKind::Schedule,
            "Script" => EndpointKind::Script,
            "Broadcast" => EndpointKind::Broadcast,
            "Asset" => EndpointKind::Asset,
            _ => EndpointKind::Undefined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Undefined => "Undefined",
            EndpointKind::Any => "Any",
            EndpointKind::Service => "Service",
            EndpointKind::Api => "API",
            EndpointKind::Notification => "Notification",
            EndpointKind::Schedule => "Schedule",
            EndpointKind::Script => "Script",
            EndpointKind::Broadcast => "Broadcast",
            EndpointKind::Asset => "Asset",
        }
    }
}

/// An endpoint of a control pipeline: a kind plus, for the kinds that
/// need one, a name. Endpoints are immutable value objects and are
/// copied freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    kind: EndpointKind,
    name: String,
}

impl Endpoint {
    pub fn new(kind: EndpointKind, name: impl Into<String>) -> Self {
        let name = name.into();
        // Name is only meaningful for the named kinds.
        let name = match kind {
            EndpointKind::Any
            | EndpointKind::Api
            | EndpointKind::Broadcast
            | EndpointKind::Notification => String::new(),
            _ => name,
        };
        Self { kind, name }
    }

    pub fn any() -> Self {
        Self::new(EndpointKind::Any, "")
    }

    pub fn broadcast() -> Self {
        Self::new(EndpointKind::Broadcast, "")
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::new(EndpointKind::Service, name)
    }

    pub fn script(name: impl Into<String>) -> Self {
        Self::new(EndpointKind::Script, name)
    }

    pub fn asset(name: impl Into<String>) -> Self {
        Self::new(EndpointKind::Asset, name)
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_any(&self) -> bool {
        self.kind == EndpointKind::Any
    }

    /// Match this endpoint, used as a pattern, against a candidate.
    /// An `Any` pattern matches everything; otherwise the kinds must be
    /// equal and an empty pattern name acts as a wildcard within the kind.
    pub fn matches(&self, candidate: &Endpoint) -> bool {
        self.kind == EndpointKind::Any
            || (candidate.kind == self.kind
                && (self.name.is_empty() || self.name == candidate.name))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.kind.as_str())
        } else {
            write!(f, "{}({})", self.kind.as_str(), self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_pattern_matches_everything() {
        let pattern = Endpoint::any();
        assert!(pattern.matches(&Endpoint::service("pumpA")));
        assert!(pattern.matches(&Endpoint::broadcast()));
        assert!(pattern.matches(&Endpoint::script("night-shift")));
    }

    #[test]
    fn named_pattern_requires_kind_and_name() {
        let pattern = Endpoint::service("pumpA");
        assert!(pattern.matches(&Endpoint::service("pumpA")));
        assert!(!pattern.matches(&Endpoint::service("pumpB")));
        assert!(!pattern.matches(&Endpoint::asset("pumpA")));
    }

    #[test]
    fn empty_name_is_a_wildcard_within_the_kind() {
        let pattern = Endpoint::new(EndpointKind::Service, "");
        assert!(pattern.matches(&Endpoint::service("pumpA")));
        assert!(pattern.matches(&Endpoint::service("pumpB")));
        assert!(!pattern.matches(&Endpoint::broadcast()));
    }

    #[test]
    fn unnamed_kinds_drop_their_name() {
        let endpoint = Endpoint::new(EndpointKind::Broadcast, "ignored");
        assert_eq!(endpoint.name(), "");
        assert_eq!(endpoint.to_string(), "Broadcast");
        assert_eq!(Endpoint::service("pumpA").to_string(), "Service(pumpA)");
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EndpointKind::Any,
            EndpointKind::Service,
            EndpointKind::Api,
            EndpointKind::Notification,
            EndpointKind::Schedule,
            EndpointKind::Script,
            EndpointKind::Broadcast,
            EndpointKind::Asset,
        ] {
            assert_eq!(EndpointKind::parse(kind.as_str()), kind);
        }
        assert_eq!(EndpointKind::parse("Bogus"), EndpointKind::Undefined);
    }
}
