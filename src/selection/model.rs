//! Selection data types

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Input slot a selection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Departure,
    Arrival,
}

impl InputType {
    pub const ALL: [InputType; 2] = [InputType::Departure, InputType::Arrival];

    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Departure => "departure",
            InputType::Arrival => "arrival",
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "departure" => Ok(InputType::Departure),
            "arrival" => Ok(InputType::Arrival),
            other => Err(ValidationError::UnknownInputType(other.to_string())),
        }
    }
}

/// Candidate airport as delivered by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub country: String,
    #[serde(deserialize_with = "coordinate")]
    pub lat: f64,
    #[serde(deserialize_with = "coordinate")]
    pub lng: f64,
}

impl Location {
    pub fn new(city: impl Into<String>, country: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            city: city.into(),
            country: country.into(),
            lat,
            lng,
        }
    }
}

/// One active selection per input type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub city: String,
    pub country: String,
    #[serde(deserialize_with = "coordinate")]
    pub lat: f64,
    #[serde(deserialize_with = "coordinate")]
    pub lng: f64,
    #[serde(rename = "inputType")]
    pub input_type: InputType,
    #[serde(rename = "userID")]
    pub user_id: String,
}

impl SelectionRecord {
    pub fn new(location: Location, input_type: InputType, user_id: impl Into<String>) -> Self {
        Self {
            city: location.city,
            country: location.country,
            lat: location.lat,
            lng: location.lng,
            input_type,
            user_id: user_id.into(),
        }
    }

    pub fn coordinates(&self) -> [f64; 2] {
        [self.lat, self.lng]
    }
}

/// Route derived from a departure and an arrival selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlightRecord {
    pub departure: [f64; 2],
    pub arrival: [f64; 2],
}

// Airport feeds carry coordinates either as numbers or as numeric strings
fn coordinate<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid coordinate {s:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_type_parse() {
        assert_eq!("arrival".parse::<InputType>().unwrap(), InputType::Arrival);
        assert_eq!(
            "layover".parse::<InputType>(),
            Err(ValidationError::UnknownInputType("layover".into()))
        );
    }

    #[test]
    fn test_selection_record_wire_names() {
        let record = SelectionRecord::new(
            Location::new("Lisbon", "Portugal", 38.77, -9.13),
            InputType::Departure,
            "u-1",
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["inputType"], "departure");
        assert_eq!(value["userID"], "u-1");
        assert_eq!(value["lat"], 38.77);
    }

    #[test]
    fn test_string_coordinates_accepted() {
        let loc: Location = serde_json::from_value(json!({
            "city": "Oslo", "country": "Norway", "lat": "59.91", "lng": 10.75
        }))
        .unwrap();
        assert_eq!(loc.lat, 59.91);
        assert_eq!(loc.lng, 10.75);

        let bad = serde_json::from_value::<Location>(json!({
            "city": "Oslo", "country": "Norway", "lat": "north", "lng": 10.75
        }));
        assert!(bad.is_err());
    }
}
