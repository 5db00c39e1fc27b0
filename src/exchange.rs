// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing entities of the broker. This module defines the
//! supported exchange kinds and a builder for the exchange declared by both the
//! consumer topology and the producer.

use crate::errors::AmqpError;
use std::{fmt, str::FromStr};

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Any plugin-provided exchange type, passed through by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    /// Parses the kind names used in configuration (`topic`, `direct`, ...).
    /// Names starting with `x-` are plugin exchange types.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other if other.starts_with("x-") => Ok(ExchangeKind::Custom(other.to_owned())),
            _ => Err(AmqpError::InvalidExchangeKind(s.to_owned())),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Headers => f.write_str("headers"),
            ExchangeKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Definition of a RabbitMQ exchange with its declaration flags.
///
/// Definitions are owned so that they can be replayed verbatim on every reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is a durable Direct exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: true,
            internal: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange transient, lost on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_configured_kinds() {
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!(" Fanout ".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!(
            "x-delayed-message".parse::<ExchangeKind>(),
            Ok(ExchangeKind::Custom("x-delayed-message".to_owned()))
        );
        assert_eq!(
            "bogus".parse::<ExchangeKind>(),
            Err(AmqpError::InvalidExchangeKind("bogus".to_owned()))
        );
    }

    #[test]
    fn maps_to_lapin_kinds() {
        let kind: lapin::ExchangeKind = (&ExchangeKind::Topic).into();
        assert!(matches!(kind, lapin::ExchangeKind::Topic));

        let kind: lapin::ExchangeKind = (&ExchangeKind::Custom("x-custom".to_owned())).into();
        assert!(matches!(kind, lapin::ExchangeKind::Custom(name) if name == "x-custom"));
    }

    #[test]
    fn defaults_to_durable_direct() {
        let def = ExchangeDefinition::new("orders");
        assert_eq!(def.exchange_kind(), &ExchangeKind::Direct);
        assert!(def.durable);
        assert!(!def.delete);
        assert!(!def.internal);
    }
}
