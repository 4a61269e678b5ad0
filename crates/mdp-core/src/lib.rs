//! Core domain model for the deal pipeline: listing candidates, persisted deal records,
//! price history, and the identity key that ties them together.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "mdp-core";

/// Normalized identity of a property: trimmed, lowercased address.
pub fn identity_key(address: &str) -> String {
    address.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PropertyType {
    SingleFamily,
    Multifamily,
    Land,
    #[default]
    Unknown,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::SingleFamily => "single_family",
            PropertyType::Multifamily => "multifamily",
            PropertyType::Land => "land",
            PropertyType::Unknown => "unknown",
        }
    }

    /// Accepts the canonical tags plus the spellings extraction tends to produce
    /// ("single family", "Multi-Family", "lot").
    pub fn from_loose(raw: &str) -> Self {
        match loose_token(raw).as_str() {
            "single_family" | "singlefamily" | "single_family_home" | "house" | "sfh" => {
                PropertyType::SingleFamily
            }
            "multifamily" | "multi_family" | "multi_family_home" | "duplex" | "triplex"
            | "fourplex" => PropertyType::Multifamily,
            "land" | "lot" | "lots" | "lots_land" | "vacant_land" => PropertyType::Land,
            _ => PropertyType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ListingStatus {
    ForSale,
    Pending,
    Sold,
    #[default]
    Unknown,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::ForSale => "for_sale",
            ListingStatus::Pending => "pending",
            ListingStatus::Sold => "sold",
            ListingStatus::Unknown => "unknown",
        }
    }

    pub fn from_loose(raw: &str) -> Self {
        match loose_token(raw).as_str() {
            "for_sale" | "forsale" | "active" | "for_sale_by_owner" => ListingStatus::ForSale,
            "pending" | "under_contract" | "contingent" => ListingStatus::Pending,
            "sold" | "recently_sold" => ListingStatus::Sold,
            _ => ListingStatus::Unknown,
        }
    }
}

fn loose_token(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

macro_rules! loose_enum_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = Option::<JsonValue>::deserialize(deserializer)?;
                Ok(raw
                    .as_ref()
                    .and_then(JsonValue::as_str)
                    .map(<$ty>::from_loose)
                    .unwrap_or_default())
            }
        }
    };
}

loose_enum_serde!(PropertyType);
loose_enum_serde!(ListingStatus);

/// One property as extracted from a single search page. Every field except the
/// address is advisory; extraction output is noisy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingCandidate {
    #[serde(default, deserialize_with = "lenient::string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub neighborhood: Option<String>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub price: Option<f64>,
    #[serde(rename = "lotSize", default, deserialize_with = "lenient::number")]
    pub lot_size: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub beds: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub baths: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub sqft: Option<f64>,
    #[serde(rename = "propertyType", default)]
    pub property_type: PropertyType,
    #[serde(default)]
    pub status: ListingStatus,
    #[serde(default, deserialize_with = "lenient::string")]
    pub url: Option<String>,
}

impl ListingCandidate {
    /// Identity key, or `None` when the address is missing or blank.
    pub fn identity_key(&self) -> Option<String> {
        let key = identity_key(self.address.as_deref()?);
        (!key.is_empty()).then_some(key)
    }

    /// Zero and negative prices are placeholders for "not listed", not observations.
    pub fn known_price(&self) -> Option<f64> {
        self.price.filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub price: f64,
    #[serde(with = "timestamp")]
    pub date: DateTime<Utc>,
}

/// Persisted, deduplicated listing with its observed price history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub neighborhood: String,
    #[serde(default, deserialize_with = "lenient::number")]
    pub price: Option<f64>,
    #[serde(rename = "lotSize", default, deserialize_with = "lenient::number")]
    pub lot_size: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub beds: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub baths: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number")]
    pub sqft: Option<f64>,
    #[serde(rename = "propertyType", default)]
    pub property_type: PropertyType,
    #[serde(default)]
    pub status: ListingStatus,
    #[serde(default)]
    pub zoning: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub url: Option<String>,
    #[serde(with = "timestamp")]
    pub added_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default, deserialize_with = "lenient::price_history")]
    pub price_history: Vec<PriceEntry>,
    /// Fields written by other consumers of the dataset; carried through untouched.
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl DealRecord {
    /// Builds a brand-new record first observed at `now`.
    pub fn from_candidate(candidate: ListingCandidate, now: DateTime<Utc>) -> Self {
        let price = candidate.known_price();
        let price_history = price
            .map(|price| vec![PriceEntry { price, date: now }])
            .unwrap_or_default();
        Self {
            address: candidate.address.unwrap_or_default(),
            neighborhood: candidate.neighborhood.unwrap_or_default(),
            price,
            lot_size: candidate.lot_size,
            beds: candidate.beds,
            baths: candidate.baths,
            sqft: candidate.sqft,
            property_type: candidate.property_type,
            status: candidate.status,
            zoning: String::new(),
            url: candidate.url,
            added_at: now,
            last_seen: now,
            is_new: true,
            price_history,
            extra: JsonMap::new(),
        }
    }

    pub fn identity_key(&self) -> String {
        identity_key(&self.address)
    }

    /// Most recently recorded price: the last history entry, or the bare `price`
    /// field for records that never accumulated history.
    pub fn previous_price(&self) -> Option<f64> {
        match self.price_history.last() {
            Some(entry) => Some(entry.price),
            None => self.price,
        }
    }

    /// Appends `price` to the history and makes it the live price.
    pub fn record_price(&mut self, price: f64, observed_at: DateTime<Utc>) {
        self.price_history.push(PriceEntry {
            price,
            date: observed_at,
        });
        self.price = Some(price);
    }
}

/// Parses the timestamp formats found in persisted datasets: RFC 3339, plus the
/// legacy `YYYY-MM-DD HH:MM[:SS]` and bare `YYYY-MM-DD` forms (read as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp {raw:?}")))
    }
}

/// Deserializers that never fail on a wrong-typed value; they map it to `None`.
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value as JsonValue;

    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let raw = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(number_from_json))
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let raw = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match raw {
            Some(JsonValue::String(s)) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn number_from_json(value: &JsonValue) -> Option<f64> {
        match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => parse_numeric_text(s),
            _ => None,
        }
        .filter(|n| n.is_finite())
    }

    /// History entries whose price or date cannot be read are dropped; the rest keep
    /// their order.
    pub fn price_history<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<super::PriceEntry>, D::Error> {
        let raw = Option::<JsonValue>::deserialize(deserializer)?;
        let Some(JsonValue::Array(entries)) = raw else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let price = entry.get("price").and_then(number_from_json)?;
                let date = entry
                    .get("date")
                    .and_then(JsonValue::as_str)
                    .and_then(super::parse_timestamp)?;
                Some(super::PriceEntry { price, date })
            })
            .collect())
    }

    /// "$525,000" -> 525000, "1.2M" -> 1200000, "850k" -> 850000.
    pub fn parse_numeric_text(text: &str) -> Option<f64> {
        let lower = text.trim().to_ascii_lowercase();
        let after_digit = |body: &&str| body.ends_with(|c: char| c.is_ascii_digit());
        let (body, multiplier) = if let Some(body) = lower.strip_suffix('m').filter(after_digit) {
            (body, 1_000_000.0)
        } else if let Some(body) = lower.strip_suffix('k').filter(after_digit) {
            (body, 1_000.0)
        } else {
            (lower.as_str(), 1.0)
        };
        let cleaned: String = body
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        if cleaned.is_empty() {
            return None;
        }
        cleaned.parse::<f64>().ok().map(|n| n * multiplier)
    }
}
