// Target module - the entities the agent monitors
//
// Two shapes of target exist:
// 1. Geo targets: a latitude/longitude pair, used by the carbon collectors
// 2. Peer targets: a node address with optional cluster/domain labels, used by
//    the latency probe and the synthetic sensors
//
// Each agent mode works with exactly one kind, and the Control API parses
// request bodies according to that kind.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::metrics::Attributes;

/// Errors raised while turning request input into targets or keys
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    #[error("Bad Format: request body must be a JSON object")]
    NotAnObject,

    #[error("Bad Format: {0}")]
    InvalidJson(String),

    #[error("Bad Format: missing field '{0}'")]
    MissingField(&'static str),

    #[error("Bad Format: invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Which target shape an agent mode works with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Geo,
    Peer,
}

/// A geographic point, kept as the decimal strings the caller supplied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeoTarget {
    pub lat: String,
    pub lon: String,
}

/// A remote node reached by address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerTarget {
    pub node_ip: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// One monitored entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Target {
    Geo(GeoTarget),
    Peer(PeerTarget),
}

/// Identity used for deduplication and removal
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    Geo { lat: String, lon: String },
    Peer(String),
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Geo { lat, lon } => write!(f, "lat={}, lon={}", lat, lon),
            TargetKey::Peer(ip) => write!(f, "IP {}", ip),
        }
    }
}

impl Target {
    #[cfg(test)]
    pub fn geo(lat: impl Into<String>, lon: impl Into<String>) -> Self {
        Target::Geo(GeoTarget {
            lat: lat.into(),
            lon: lon.into(),
        })
    }

    #[cfg(test)]
    pub fn peer(node_ip: impl Into<String>) -> Self {
        Target::Peer(PeerTarget {
            node_ip: node_ip.into(),
            cluster: None,
            domain: None,
        })
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Geo(_) => TargetKind::Geo,
            Target::Peer(_) => TargetKind::Peer,
        }
    }

    pub fn key(&self) -> TargetKey {
        match self {
            Target::Geo(geo) => TargetKey::Geo {
                lat: geo.lat.clone(),
                lon: geo.lon.clone(),
            },
            Target::Peer(peer) => TargetKey::Peer(peer.node_ip.clone()),
        }
    }

    /// Display attributes attached to every sample produced for this target
    pub fn attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        match self {
            Target::Geo(geo) => {
                attributes.insert("latitude".to_string(), geo.lat.clone());
                attributes.insert("longitude".to_string(), geo.lon.clone());
            }
            Target::Peer(peer) => {
                attributes.insert("node_ip".to_string(), peer.node_ip.clone());
                if let Some(cluster) = &peer.cluster {
                    attributes.insert("cluster".to_string(), cluster.clone());
                }
                if let Some(domain) = &peer.domain {
                    attributes.insert("domain".to_string(), domain.clone());
                }
            }
        }
        attributes
    }
}

impl TargetKind {
    /// Parses an add-target request body
    ///
    /// # Arguments
    /// * `body` - Decoded JSON request body
    ///
    /// # Returns
    /// * `Ok(Target)` - A target of this kind
    /// * `Err(TargetError)` - Required fields absent or malformed
    pub fn parse_target(&self, body: &Value) -> Result<Target, TargetError> {
        let object = body.as_object().ok_or(TargetError::NotAnObject)?;

        match self {
            TargetKind::Geo => {
                let lat = required_field(object, "lat")?;
                let lon = required_field(object, "lon")?;
                validate_coordinate("lat", &lat, 90.0)?;
                validate_coordinate("lon", &lon, 180.0)?;
                Ok(Target::Geo(GeoTarget { lat, lon }))
            }
            TargetKind::Peer => {
                let node_ip = required_field(object, "node_ip")?;
                Ok(Target::Peer(PeerTarget {
                    node_ip,
                    cluster: optional_field(object, "cluster")?,
                    domain: optional_field(object, "domain")?,
                }))
            }
        }
    }

    /// Parses a remove-target request into an identity key
    ///
    /// The key may come from the JSON body (`{lat, lon}` or `{node_ip}`) or
    /// from query parameters (`?lat=&lon=` or `?ip=`). Query parameters win
    /// when both are present.
    pub fn parse_key(
        &self,
        body: Option<&Value>,
        query: &HashMap<String, String>,
    ) -> Result<TargetKey, TargetError> {
        match self {
            TargetKind::Geo => {
                if let (Some(lat), Some(lon)) = (query.get("lat"), query.get("lon")) {
                    return Ok(TargetKey::Geo {
                        lat: lat.clone(),
                        lon: lon.clone(),
                    });
                }
                let object = body
                    .and_then(Value::as_object)
                    .ok_or(TargetError::NotAnObject)?;
                Ok(TargetKey::Geo {
                    lat: required_field(object, "lat")?,
                    lon: required_field(object, "lon")?,
                })
            }
            TargetKind::Peer => {
                if let Some(ip) = query.get("ip").filter(|ip| !ip.is_empty()) {
                    return Ok(TargetKey::Peer(ip.clone()));
                }
                match body.and_then(Value::as_object) {
                    Some(object) => Ok(TargetKey::Peer(required_field(object, "node_ip")?)),
                    None => Err(TargetError::MissingField("ip")),
                }
            }
        }
    }
}

/// Reads a non-empty scalar field as a string
///
/// Numbers are accepted and kept in their JSON text form so that
/// `{"lat": 48.86}` and `{"lat": "48.86"}` name the same point.
fn required_field(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, TargetError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(TargetError::MissingField(field)),
        Some(value) => {
            let text = scalar_to_string(field, value)?;
            if text.trim().is_empty() {
                return Err(TargetError::InvalidField {
                    field,
                    reason: "must not be empty".to_string(),
                });
            }
            Ok(text)
        }
    }
}

fn optional_field(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, TargetError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(field, value).map(Some),
    }
}

fn scalar_to_string(field: &'static str, value: &Value) -> Result<String, TargetError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(TargetError::InvalidField {
            field,
            reason: "expected a string or number".to_string(),
        }),
    }
}

pub(crate) fn validate_coordinate(
    field: &'static str,
    value: &str,
    limit: f64,
) -> Result<(), TargetError> {
    let parsed: f64 = value.trim().parse().map_err(|_| TargetError::InvalidField {
        field,
        reason: format!("'{}' is not a decimal number", value),
    })?;

    if !parsed.is_finite() || parsed.abs() > limit {
        return Err(TargetError::InvalidField {
            field,
            reason: format!("{} is outside [-{}, {}]", parsed, limit, limit),
        });
    }

    Ok(())
}
