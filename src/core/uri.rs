//! Purpose: Logical addresses (`UUri`) and their long-form text encoding.
//! Exports: `UUri`, `UResource`.
//! Role: Opaque-to-the-engine identifiers; the engine only asks `is_rpc_method`.
//! Invariants: `parse(display(u)) == u` for every valid address.
//! Invariants: An empty entity name is never a valid address.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

const RPC_RESOURCE: &str = "rpc";
const RPC_RESPONSE_INSTANCE: &str = "response";

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct UResource {
    pub name: String,
    pub instance: Option<String>,
    pub message: Option<String>,
}

impl UResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
            message: None,
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct UUri {
    pub authority: Option<String>,
    pub entity: String,
    pub entity_version: Option<u32>,
    pub resource: UResource,
}

impl UUri {
    pub fn new(entity: impl Into<String>, entity_version: Option<u32>) -> Self {
        Self {
            authority: None,
            entity: entity.into(),
            entity_version,
            resource: UResource::default(),
        }
    }

    /// Topic address `/entity/version/name.instance#message`.
    pub fn topic(
        entity: impl Into<String>,
        entity_version: u32,
        name: impl Into<String>,
        instance: Option<&str>,
        message: Option<&str>,
    ) -> Self {
        let mut resource = UResource::new(name);
        resource.instance = instance.map(str::to_string);
        resource.message = message.map(str::to_string);
        Self::new(entity, Some(entity_version)).with_resource(resource)
    }

    /// Method address `/entity/version/rpc.method`.
    pub fn rpc_method(entity: impl Into<String>, entity_version: u32, method: &str) -> Self {
        Self::new(entity, Some(entity_version))
            .with_resource(UResource::new(RPC_RESOURCE).with_instance(method))
    }

    /// Address replies are sent back to, `/entity/version/rpc.response`.
    pub fn rpc_response(entity: impl Into<String>, entity_version: u32) -> Self {
        Self::new(entity, Some(entity_version))
            .with_resource(UResource::new(RPC_RESOURCE).with_instance(RPC_RESPONSE_INSTANCE))
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_resource(mut self, resource: UResource) -> Self {
        self.resource = resource;
        self
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        let invalid = |message: &str| {
            Error::new(ErrorKind::InvalidArgument).with_message(format!("{message}: {value:?}"))
        };

        let (authority, path) = if let Some(rest) = value.strip_prefix("//") {
            let (authority, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
            if authority.is_empty() {
                return Err(invalid("empty authority"));
            }
            (Some(authority.to_string()), path)
        } else if value.starts_with('/') {
            (None, value)
        } else {
            return Err(invalid("address must start with '/'"));
        };

        let path = path.strip_prefix('/').unwrap_or(path);
        let mut parts = path.splitn(3, '/');
        let entity = parts.next().unwrap_or_default();
        if entity.is_empty() {
            return Err(invalid("missing entity"));
        }

        let entity_version = match parts.next() {
            None | Some("") => None,
            Some(version) => Some(
                version
                    .parse::<u32>()
                    .map_err(|_| invalid("entity version must be an integer"))?,
            ),
        };

        let resource = match parts.next() {
            None | Some("") => UResource::default(),
            Some(resource) => parse_resource(resource),
        };

        Ok(Self {
            authority,
            entity: entity.to_string(),
            entity_version,
            resource,
        })
    }

    pub fn is_rpc_method(&self) -> bool {
        self.resource.name == RPC_RESOURCE
            && self
                .resource
                .instance
                .as_deref()
                .is_some_and(|instance| !instance.is_empty() && instance != RPC_RESPONSE_INSTANCE)
    }

    pub fn is_rpc_response(&self) -> bool {
        self.resource.name == RPC_RESOURCE
            && self.resource.instance.as_deref() == Some(RPC_RESPONSE_INSTANCE)
    }

    pub fn is_empty(&self) -> bool {
        self.entity.is_empty()
    }

    /// Long-form text that parses back to exactly `self`.
    ///
    /// `Display` renders any value; this rejects the ones whose text would lose or alter
    /// parts, such as an empty entity or a resource with no name.
    pub fn to_long_form(&self) -> Result<String, Error> {
        let text = self.to_string();
        match Self::parse(&text) {
            Ok(parsed) if parsed == *self => Ok(text),
            Ok(_) => Err(Error::new(ErrorKind::InvalidArgument)
                .with_message(format!("address does not survive its long form: {text:?}"))),
            Err(err) => Err(err),
        }
    }
}

fn parse_resource(value: &str) -> UResource {
    let (head, message) = match value.split_once('#') {
        Some((head, message)) => (head, Some(message.to_string())),
        None => (value, None),
    };
    let (name, instance) = match head.split_once('.') {
        Some((name, instance)) => (name, Some(instance.to_string())),
        None => (head, None),
    };
    UResource {
        name: name.to_string(),
        instance,
        message,
    }
}

impl fmt::Display for UUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(authority) = &self.authority {
            write!(f, "//{authority}")?;
        }
        write!(f, "/{}", self.entity)?;
        if self.entity_version.is_none() && self.resource.is_empty() {
            return Ok(());
        }
        f.write_str("/")?;
        if let Some(version) = self.entity_version {
            write!(f, "{version}")?;
        }
        if self.resource.is_empty() {
            return Ok(());
        }
        write!(f, "/{}", self.resource.name)?;
        if let Some(instance) = &self.resource.instance {
            write!(f, ".{instance}")?;
        }
        if let Some(message) = &self.resource.message {
            write!(f, "#{message}")?;
        }
        Ok(())
    }
}

impl FromStr for UUri {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{UResource, UUri};
    use crate::core::error::ErrorKind;

    #[test]
    fn long_form_round_trip() {
        let cases = [
            "/body.access",
            "/body.access/1",
            "/body.access/1/door.front_left#Door",
            "/body.access//door",
            "//vcu.vin/body.access/1/rpc.UpdateDoor",
        ];
        for text in cases {
            let uri = UUri::parse(text).expect("parse");
            assert_eq!(uri.to_string(), text);
        }
    }

    #[test]
    fn parse_splits_resource_parts() {
        let uri: UUri = "/hartley/2/raise.salary#Raise".parse().expect("parse");
        assert_eq!(uri.entity, "hartley");
        assert_eq!(uri.entity_version, Some(2));
        assert_eq!(
            uri.resource,
            UResource::new("raise")
                .with_instance("salary")
                .with_message("Raise")
        );
        assert_eq!(uri.authority, None);
    }

    #[test]
    fn parse_rejects_malformed() {
        for text in ["", "body", "/", "///x", "/body/v1"] {
            let err = UUri::parse(text).expect_err("should fail");
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{text}");
        }
    }

    #[test]
    fn long_form_rejects_lossy_addresses() {
        let text = UUri::topic("body", 1, "door", Some("front"), Some("Door"))
            .to_long_form()
            .expect("long form");
        assert_eq!(text, "/body/1/door.front#Door");

        let nameless = UUri::new("body", Some(1))
            .with_resource(UResource::default().with_instance("front"));
        let cases = [
            UUri::default(),
            UUri::new("body", None).with_authority(""),
            UUri::new("a/b", Some(1)),
            nameless,
        ];
        for uri in cases {
            let err = uri.to_long_form().expect_err("lossy");
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{uri:?}");
        }
    }

    #[test]
    fn rpc_classification() {
        assert!(UUri::rpc_method("body", 1, "UpdateDoor").is_rpc_method());
        assert!(!UUri::rpc_response("body", 1).is_rpc_method());
        assert!(UUri::rpc_response("body", 1).is_rpc_response());
        assert!(!UUri::topic("body", 1, "door", Some("front"), None).is_rpc_method());
        assert!(!UUri::parse("/body/1/rpc").expect("parse").is_rpc_method());
    }
}
