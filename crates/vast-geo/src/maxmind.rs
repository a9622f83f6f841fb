//! MaxMind GeoIP2 City web service client.

use serde::Deserialize;
use tracing::{error, warn};

use crate::error::{GeoError, GeoResult};
use crate::GeoLocation;

const CITY_ENDPOINT: &str = "https://geoip.maxmind.com/geoip/v2.1/city";

/// Subset of the GeoIP2 City response we consume.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct CityResponse {
    #[serde(default)]
    country: Country,
    #[serde(default)]
    traits: Traits,
    #[serde(default)]
    city: City,
    #[serde(default)]
    location: Location,
    #[serde(default)]
    subdivisions: Vec<Subdivision>,
}

#[derive(Debug, Default, Deserialize)]
struct Country {
    #[serde(default)]
    iso_code: String,
}

#[derive(Debug, Default, Deserialize)]
struct Traits {
    #[serde(default)]
    isp: String,
    #[serde(default)]
    organization: String,
    #[serde(default)]
    domain: String,
}

#[derive(Debug, Default, Deserialize)]
struct City {
    #[serde(default)]
    names: Names,
}

#[derive(Debug, Default, Deserialize)]
struct Names {
    #[serde(default)]
    en: String,
}

#[derive(Debug, Default, Deserialize)]
struct Location {
    #[serde(default, rename = "accuracy_radius")]
    accuracy: f64,
    #[serde(default, rename = "latitude")]
    lat: f64,
    #[serde(default, rename = "longitude")]
    long: f64,
}

#[derive(Debug, Default, Deserialize)]
struct Subdivision {
    #[serde(default)]
    names: Names,
}

impl CityResponse {
    /// Flattens the nested response into a [`GeoLocation`].
    ///
    /// The human-readable location is the city name with subdivision names
    /// appended from the most to the least specific, skipping any that
    /// repeat the city itself. The organization is kept only when it differs
    /// from the ISP.
    pub(crate) fn into_location(self) -> GeoLocation {
        let mut location = self.city.names.en.clone();
        for sub in self.subdivisions.iter().rev() {
            // St.-Petersburg => St Petersburg
            let name = sub.names.en.replace("St.-", "St ");
            if name == self.city.names.en {
                continue;
            }
            if !location.is_empty() {
                location.push_str(", ");
            }
            location.push_str(&name);
        }

        let organization = if self.traits.organization != self.traits.isp {
            self.traits.organization
        } else {
            String::new()
        };

        GeoLocation {
            country: self.country.iso_code,
            location,
            lat: self.location.lat,
            long: self.location.long,
            accuracy: self.location.accuracy,
            isp: self.traits.isp,
            organization,
            domain: self.traits.domain,
        }
    }
}

/// Performs one City lookup against the MaxMind web service.
///
/// Returns `Ok(None)` for IPs the database does not know (HTTP 404); this is
/// a valid negative answer, not an error. 401/402 map to
/// [`GeoError::AuthRejected`] so the caller can stop querying.
pub(crate) async fn query(
    client: &reqwest::Client,
    user: &str,
    pass: &str,
    ip: &str,
) -> GeoResult<Option<GeoLocation>> {
    let url = format!("{CITY_ENDPOINT}/{ip}");
    let resp = client
        .get(&url)
        .basic_auth(user, Some(pass))
        .send()
        .await?;

    let status = resp.status();
    if status.as_u16() == 404 {
        warn!(ip, "IP not found by MaxMind");
        return Ok(None);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        error!(ip, status = status.as_u16(), %body, "MaxMind lookup failed");
        if status.as_u16() == 401 || status.as_u16() == 402 {
            return Err(GeoError::AuthRejected(status.as_u16()));
        }
        return Err(GeoError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    let decoded: CityResponse = resp.json().await?;
    Ok(Some(decoded.into_location()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> CityResponse {
        serde_json::from_str(json).expect("valid fixture")
    }

    #[test]
    fn full_response_flattens() {
        let resp = parse(
            r#"{
                "country": {"iso_code": "DE"},
                "city": {"names": {"en": "Falkenstein"}},
                "location": {"accuracy_radius": 20, "latitude": 50.4779, "longitude": 12.3713},
                "traits": {"isp": "Hetzner Online", "organization": "Hetzner", "domain": "hetzner.de"},
                "subdivisions": [{"names": {"en": "Saxony"}}]
            }"#,
        );
        let loc = resp.into_location();
        assert_eq!(loc.country, "DE");
        assert_eq!(loc.location, "Falkenstein, Saxony");
        assert_eq!(loc.isp, "Hetzner Online");
        assert_eq!(loc.organization, "Hetzner");
        assert!((loc.lat - 50.4779).abs() < 1e-9);
        assert!((loc.accuracy - 20.0).abs() < 1e-9);
    }

    #[test]
    fn subdivisions_append_most_specific_first() {
        let resp = parse(
            r#"{
                "city": {"names": {"en": "Brooklyn"}},
                "subdivisions": [
                    {"names": {"en": "New York"}},
                    {"names": {"en": "Kings County"}}
                ]
            }"#,
        );
        assert_eq!(resp.into_location().location, "Brooklyn, Kings County, New York");
    }

    #[test]
    fn subdivision_equal_to_city_is_skipped() {
        let resp = parse(
            r#"{
                "city": {"names": {"en": "Berlin"}},
                "subdivisions": [{"names": {"en": "Berlin"}}]
            }"#,
        );
        assert_eq!(resp.into_location().location, "Berlin");
    }

    #[test]
    fn saint_prefix_is_normalized() {
        let resp = parse(
            r#"{
                "city": {"names": {"en": "Petersburg"}},
                "subdivisions": [{"names": {"en": "St.-Petersburg"}}]
            }"#,
        );
        assert_eq!(resp.into_location().location, "Petersburg, St Petersburg");
    }

    #[test]
    fn organization_matching_isp_is_dropped() {
        let resp = parse(
            r#"{"traits": {"isp": "OVH SAS", "organization": "OVH SAS"}}"#,
        );
        assert_eq!(resp.into_location().organization, "");
    }

    #[test]
    fn empty_response_yields_default_location() {
        let loc = parse("{}").into_location();
        assert_eq!(loc, GeoLocation::default());
    }
}
