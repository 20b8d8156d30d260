//! Discovery queries and their canonical cache keys.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::instance::{Protocol, ServiceInstance};

/// Separator between cache key segments.
pub const KEY_DELIMITER: char = '|';

const WILDCARD: &str = "*";

/// Characters with structural meaning inside a key, plus `%` itself.
const KEY_RESERVED: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b'|')
    .add(b',')
    .add(b'=')
    .add(b'*');

fn escape(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, KEY_RESERVED).into()
}

/// Filter describing which instances of a service a caller wants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceQuery {
    pub service_name: String,
    pub version: Option<String>,
    pub environment: Option<String>,
    pub zone: Option<String>,
    pub region: Option<String>,
    /// Every tag must be present on the instance
    pub tags: HashSet<String>,
    /// Every label must be present with an equal value
    pub labels: HashMap<String, String>,
    /// Accepted protocols; empty accepts any
    pub protocols: Vec<Protocol>,
    pub include_unhealthy: bool,
    pub max_instances: Option<usize>,
    pub exclude_instances: HashSet<String>,
}

impl ServiceQuery {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        if !self.protocols.contains(&protocol) {
            self.protocols.push(protocol);
        }
        self
    }

    pub fn include_unhealthy(mut self, include: bool) -> Self {
        self.include_unhealthy = include;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = Some(max);
        self
    }

    pub fn exclude(mut self, instance_id: impl Into<String>) -> Self {
        self.exclude_instances.insert(instance_id.into());
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::invalid("service_name", "must not be empty"));
        }
        if self.service_name.contains(KEY_DELIMITER) {
            return Err(ConfigError::invalid(
                "service_name",
                format!("must not contain `{}`", KEY_DELIMITER),
            ));
        }
        if self.max_instances == Some(0) {
            return Err(ConfigError::invalid(
                "max_instances",
                "must be greater than zero when set",
            ));
        }
        Ok(())
    }

    /// Deterministic key identifying this query in the discovery cache.
    ///
    /// Logically equal queries produce the same key regardless of the
    /// insertion order of their tag, label, protocol or exclusion sets.
    /// Every value is percent-encoded, so distinct queries never share a
    /// key. The first segment is always the service name.
    pub fn cache_key(&self) -> String {
        let or_wildcard = |v: &Option<String>| match v {
            Some(v) => escape(v).into_owned(),
            None => WILDCARD.to_string(),
        };

        let mut tags: Vec<Cow<'_, str>> = self.tags.iter().map(|t| escape(t)).collect();
        tags.sort_unstable();

        let mut labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect();
        labels.sort_unstable();

        let mut protocols: Vec<Protocol> = self.protocols.clone();
        protocols.sort_unstable();
        protocols.dedup();
        let protocols: Vec<&str> = protocols.iter().map(Protocol::as_str).collect();

        let mut excluded: Vec<Cow<'_, str>> =
            self.exclude_instances.iter().map(|id| escape(id)).collect();
        excluded.sort_unstable();

        [
            escape(&self.service_name).into_owned(),
            or_wildcard(&self.version),
            or_wildcard(&self.environment),
            or_wildcard(&self.zone),
            or_wildcard(&self.region),
            format!("tags={}", tags.join(",")),
            format!("labels={}", labels.join(",")),
            format!("protocols={}", protocols.join(",")),
            format!("unhealthy={}", self.include_unhealthy),
            format!("exclude={}", excluded.join(",")),
        ]
        .join(&KEY_DELIMITER.to_string())
    }

    /// Whether `instance` satisfies every predicate of this query.
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        let meta = &instance.metadata;
        let field_ok = |want: &Option<String>, have: &Option<String>| match want {
            Some(w) => have.as_deref() == Some(w.as_str()),
            None => true,
        };

        instance.service_name == self.service_name
            && field_ok(&self.version, &meta.version)
            && field_ok(&self.environment, &meta.environment)
            && field_ok(&self.zone, &meta.zone)
            && field_ok(&self.region, &meta.region)
            && self.tags.iter().all(|t| meta.tags.contains(t))
            && self
                .labels
                .iter()
                .all(|(k, v)| meta.labels.get(k) == Some(v))
            && (self.protocols.is_empty() || self.protocols.contains(&instance.endpoint.protocol))
            && !self.exclude_instances.contains(&instance.instance_id)
            && (self.include_unhealthy || instance.is_healthy())
    }
}

/// Service name segment of a cache key produced by [`ServiceQuery::cache_key`].
pub fn service_of_key(key: &str) -> Cow<'_, str> {
    let segment = key.split(KEY_DELIMITER).next().unwrap_or(key);
    percent_decode_str(segment).decode_utf8_lossy()
}
