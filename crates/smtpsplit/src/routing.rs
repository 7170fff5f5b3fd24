//! The static table that decides which backend receives mail
//! for a given recipient domain.
use rfc5321::ForwardPath;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("routes must contain at least one domain")]
    Empty,
    #[error("route for {domain:?} has an empty domain name")]
    EmptyDomain { domain: String },
    #[error("routes for {first:?} and {second:?} collide once lower-cased")]
    Duplicate { first: String, second: String },
    #[error("route for {domain:?} has invalid address {address:?}: expected host:port")]
    InvalidAddress { domain: String, address: String },
}

/// Maps a lower-cased recipient domain to the `host:port` of
/// the backend that accepts mail for it.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RoutingTable {
    routes: HashMap<String, String>,
}

impl RoutingTable {
    pub fn new(routes: BTreeMap<String, String>) -> Result<Self, RoutingError> {
        if routes.is_empty() {
            return Err(RoutingError::Empty);
        }

        let mut normalized: HashMap<String, String> = HashMap::new();
        let mut original_keys: HashMap<String, String> = HashMap::new();

        for (domain, address) in routes {
            let key = domain.trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(RoutingError::EmptyDomain { domain });
            }
            if !is_valid_address(&address) {
                return Err(RoutingError::InvalidAddress { domain, address });
            }
            if let Some(first) = original_keys.get(&key) {
                return Err(RoutingError::Duplicate {
                    first: first.clone(),
                    second: domain,
                });
            }
            original_keys.insert(key.clone(), domain);
            normalized.insert(key, address);
        }

        Ok(Self { routes: normalized })
    }

    /// Case-insensitive lookup of the backend for `domain`
    pub fn lookup(&self, domain: &str) -> Option<&str> {
        if let Some(address) = self.routes.get(domain) {
            return Some(address);
        }
        self.routes
            .get(&domain.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// Returns the normalized domain and backend address for a
    /// recipient, or None if the recipient cannot be routed.
    pub fn route_for(&self, recipient: &ForwardPath) -> Option<(String, &str)> {
        let domain = recipient.domain()?.to_string().to_ascii_lowercase();
        let address = self.lookup(&domain)?;
        Some((domain, address))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

fn is_valid_address(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let host = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host);
            !host.is_empty() && port.parse::<u16>().is_ok()
        }
        None => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use maplit::btreemap;

    fn table() -> RoutingTable {
        RoutingTable::new(btreemap! {
            "A.com".to_string() => "10.0.0.1:25".to_string(),
            "b.com".to_string() => "10.0.0.2:25".to_string(),
            "v6.com".to_string() => "[::1]:2525".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let table = table();
        assert_equal!(table.lookup("a.com"), Some("10.0.0.1:25"));
        assert_equal!(table.lookup("A.COM"), Some("10.0.0.1:25"));
        assert_equal!(table.lookup("v6.com"), Some("[::1]:2525"));
        assert_equal!(table.lookup("unknown.com"), None);
        assert_equal!(table.len(), 3);
    }

    #[test]
    fn route_for_recipient() {
        let table = table();
        let rcpt = ForwardPath::try_from("Someone@B.Com").unwrap();
        assert_equal!(
            table.route_for(&rcpt),
            Some(("b.com".to_string(), "10.0.0.2:25"))
        );
        let rcpt = ForwardPath::try_from("r3@unknown.com").unwrap();
        assert_equal!(table.route_for(&rcpt), None);
        assert_equal!(table.route_for(&ForwardPath::Postmaster), None);
    }

    #[test]
    fn rejects_bad_tables() {
        assert_equal!(RoutingTable::new(BTreeMap::new()), Err(RoutingError::Empty));
        assert_equal!(
            RoutingTable::new(btreemap! {
                "a.com".to_string() => "10.0.0.1".to_string(),
            }),
            Err(RoutingError::InvalidAddress {
                domain: "a.com".to_string(),
                address: "10.0.0.1".to_string(),
            })
        );
        assert_equal!(
            RoutingTable::new(btreemap! {
                "a.com".to_string() => "host:smtp".to_string(),
            }),
            Err(RoutingError::InvalidAddress {
                domain: "a.com".to_string(),
                address: "host:smtp".to_string(),
            })
        );
        assert_equal!(
            RoutingTable::new(btreemap! {
                "A.com".to_string() => "10.0.0.1:25".to_string(),
                "a.com".to_string() => "10.0.0.2:25".to_string(),
            }),
            Err(RoutingError::Duplicate {
                first: "A.com".to_string(),
                second: "a.com".to_string(),
            })
        );
        assert_equal!(
            RoutingTable::new(btreemap! {
                " ".to_string() => "10.0.0.2:25".to_string(),
            }),
            Err(RoutingError::EmptyDomain {
                domain: " ".to_string(),
            })
        );
    }

    #[test]
    fn serializes_as_map() {
        let table = RoutingTable::new(btreemap! {
            "A.com".to_string() => "10.0.0.1:25".to_string(),
        })
        .unwrap();
        assert_equal!(
            serde_json::to_string(&table).unwrap(),
            r#"{"a.com":"10.0.0.1:25"}"#
        );
    }
}
