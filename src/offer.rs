//! Service tiers a purchaser can buy and the hotspot profile each one maps to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Purchaser-facing tier code, e.g. `"1h"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferCode(String);

impl OfferCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OfferCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a user profile configured on the hotspot controller, e.g. `"1H"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileName(String);

impl ProfileName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProfileName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of offers accepted by this engine.
///
/// Offers absent from the catalog are rejected both at session creation and when a
/// confirmation is reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferCatalog(HashMap<OfferCode, ProfileName>);

impl Default for OfferCatalog {
    fn default() -> Self {
        [("1h", "1H"), ("1d", "1D"), ("1w", "1W")]
            .into_iter()
            .collect()
    }
}

impl<C: Into<String>, P: Into<String>> FromIterator<(C, P)> for OfferCatalog {
    fn from_iter<I: IntoIterator<Item = (C, P)>>(iter: I) -> Self {
        OfferCatalog(
            iter.into_iter()
                .map(|(code, profile)| (OfferCode::new(code), ProfileName::new(profile)))
                .collect(),
        )
    }
}

impl OfferCatalog {
    /// Looks up an offer by the code the purchaser sent.
    pub fn lookup(&self, code: &str) -> Option<(&OfferCode, &ProfileName)> {
        self.0.get_key_value(code)
    }

    pub fn profile(&self, offer: &OfferCode) -> Option<&ProfileName> {
        self.0.get(offer)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::borrow::Borrow<str> for OfferCode {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_maps_tiers() {
        let catalog = OfferCatalog::default();
        let (code, profile) = catalog.lookup("1d").unwrap();
        assert_eq!(code.as_str(), "1d");
        assert_eq!(profile.as_str(), "1D");
        assert!(catalog.lookup("1y").is_none());
    }

    #[test]
    fn test_catalog_deserializes_from_map() {
        let catalog: OfferCatalog = serde_json::from_str(r#"{"30m": "HALF-HOUR"}"#).unwrap();
        assert_eq!(
            catalog.profile(&OfferCode::new("30m")),
            Some(&ProfileName::new("HALF-HOUR"))
        );
        assert!(catalog.lookup("1h").is_none());
    }
}
