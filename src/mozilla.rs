//! Mozilla Location Service wire codec.
//!
//! Builds `geolocate`/`geosubmit`-style JSON request bodies out of Wi-Fi and
//! cell observations and parses the JSON response back into a
//! [`LocationValue`]. Modeled after the request/response struct pairs in
//! `router/valhalla_api.rs`: a `#[derive(Serialize)]` request type and a
//! `#[derive(Deserialize)]` response type with the minimum nesting needed.

use serde::{Deserialize, Serialize};

use crate::location::LocationValue;

const BSSID_LEN: usize = 6;
const MAX_SSID_LEN: usize = 32;

/// Cellular technology generation, used to pick the MLS `radioType` string.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tec {
    Gsm,
    Umts,
    Lte,
}

impl Tec {
    fn radio_type(self) -> &'static str {
        match self {
            Tec::Gsm => "gsm",
            Tec::Umts => "wcdma",
            Tec::Lte => "lte",
        }
    }
}

/// A single observed cell tower.
#[derive(Clone, Debug)]
pub struct Tower3G {
    /// PLMN operator code, `"{mcc}{mnc}"`, 5 or 6 digits.
    pub operator_code: String,
    pub location_area_code: u32,
    pub cell_id: u32,
    pub tec: Tec,
}

impl Tower3G {
    /// Split the operator code into (MCC, MNC), as MLS wants them separate.
    ///
    /// Mirrors `operator_code_to_mcc_mnc` in the original GeoClue source: the
    /// first three digits are the MCC, everything after is the MNC.
    pub(crate) fn mcc_mnc(&self) -> Option<(u32, u32)> {
        if self.operator_code.len() < 5 || !self.operator_code.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let (mcc, mnc) = self.operator_code.split_at(3);
        Some((mcc.parse().ok()?, mnc.parse().ok()?))
    }
}

/// A single observed Wi-Fi access point.
#[derive(Clone, Debug)]
pub struct Bss {
    pub bssid: [u8; BSSID_LEN],
    pub ssid: Vec<u8>,
    /// Signal strength in dBm.
    pub signal_strength: i32,
    /// Seconds since the AP was last seen.
    pub age_secs: u64,
    pub frequency: Option<u32>,
}

impl Bss {
    fn bssid_string(&self) -> String {
        self.bssid.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
    }

    /// BSS entries that MLS should never be told about: no BSSID, empty
    /// SSID, or an SSID carrying the opt-out `_nomap` suffix.
    fn should_ignore(&self) -> bool {
        if self.bssid == [0; BSSID_LEN] {
            return true;
        }
        if self.ssid.is_empty() || self.ssid.len() > MAX_SSID_LEN {
            return true;
        }
        self.ssid.ends_with(b"_nomap")
    }
}

#[derive(Serialize)]
struct CellTower {
    #[serde(rename = "cellId")]
    cell_id: u32,
    #[serde(rename = "mobileCountryCode")]
    mobile_country_code: u32,
    #[serde(rename = "mobileNetworkCode")]
    mobile_network_code: u32,
    #[serde(rename = "locationAreaCode")]
    location_area_code: u32,
    #[serde(rename = "radioType", skip_serializing_if = "Option::is_none")]
    radio_type: Option<&'static str>,
}

#[derive(Serialize)]
struct WifiAccessPoint {
    #[serde(rename = "macAddress")]
    mac_address: String,
    #[serde(rename = "signalStrength")]
    signal_strength: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency: Option<u32>,
}

#[derive(Serialize)]
struct LocateRequest {
    #[serde(rename = "radioType", skip_serializing_if = "Option::is_none")]
    radio_type: Option<&'static str>,
    #[serde(rename = "cellTowers", skip_serializing_if = "Vec::is_empty")]
    cell_towers: Vec<CellTower>,
    #[serde(rename = "wifiAccessPoints", skip_serializing_if = "Vec::is_empty")]
    wifi_access_points: Vec<WifiAccessPoint>,
}

#[derive(Deserialize)]
struct LocateResponseLocation {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct LocateResponse {
    #[serde(default)]
    location: Option<LocateResponseLocation>,
    #[serde(default)]
    accuracy: Option<f64>,
    #[serde(default)]
    fallback: Option<String>,
    #[serde(default)]
    error: Option<ServerError>,
}

#[derive(Deserialize)]
struct ServerError {
    #[serde(default)]
    message: Option<String>,
}

/// Errors that can occur while building or parsing a [`MozillaQuery`].
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("server error: {0}")]
    Server(String),
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response is missing a usable location")]
    MissingLocation,
    #[error("response location is out of range: {0},{1}")]
    InvalidLocation(f64, f64),
}

/// A parsed MLS `geolocate` response, with a human-readable description of
/// which data sources contributed to it.
pub struct LocateResult {
    pub location: LocationValue,
    /// E.g. `"3GPP + WiFi"`, `"GeoIP"`, or `"{fallback} fallback (from ... data)"`.
    pub description: String,
}

/// Stateful MLS query builder/parser, one per aggregation cycle.
///
/// Tracks submission dedup flags (`bss_submitted`, `tower_submitted`) across
/// calls the way the original GeoClue `GClueMozilla` object does: a BSS set
/// is only ever submitted once until it's marked dirty again, and a tower is
/// only resubmitted if the towers involved actually changed.
#[derive(Default)]
pub struct MozillaQuery {
    tower: Option<Tower3G>,
    tower_submitted: bool,
    bss_submitted: bool,
}

impl MozillaQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the currently visible cell tower.
    ///
    /// An absent tower clears validity. Setting an identical tower to the one
    /// already stored does not reset the `tower_submitted` flag.
    /// The currently recorded cell tower, if any.
    pub fn tower(&self) -> Option<&Tower3G> {
        self.tower.as_ref()
    }

    pub fn set_tower(&mut self, tower: Option<Tower3G>) {
        match (&self.tower, &tower) {
            (Some(old), Some(new)) if Self::tower_identical(old, new) => {},
            _ => self.tower_submitted = false,
        }
        self.tower = tower;
    }

    fn tower_identical(a: &Tower3G, b: &Tower3G) -> bool {
        a.operator_code == b.operator_code
            && a.location_area_code == b.location_area_code
            && a.cell_id == b.cell_id
            && a.tec == b.tec
    }

    /// Mark the current BSS set as needing resubmission, e.g. after a new
    /// Wi-Fi scan produced different access points.
    pub fn set_bss_dirty(&mut self) {
        self.bss_submitted = false;
    }

    /// Build a `geolocate` request body for the given Wi-Fi scan.
    ///
    /// Cell data is only included when skip_tower is false and the tower's
    /// operator code parses into an MCC/MNC pair. Wi-Fi data is only included
    /// once there are at least two non-ignored BSS entries, matching MLS's
    /// own minimum-observation requirement.
    pub fn create_locate_request(
        &self,
        bsses: &[Bss],
        skip_tower: bool,
    ) -> (LocateRequestBody, String) {
        let mut cell_towers = Vec::new();
        let mut radio_type = None;
        let mut used_cell = false;
        if !skip_tower
            && let Some(tower) = &self.tower
            && let Some((mcc, mnc)) = tower.mcc_mnc()
        {
            radio_type = Some(tower.tec.radio_type());
            cell_towers.push(CellTower {
                cell_id: tower.cell_id,
                mobile_country_code: mcc,
                mobile_network_code: mnc,
                location_area_code: tower.location_area_code,
                radio_type,
            });
            used_cell = true;
        }

        let non_ignored: Vec<&Bss> = bsses.iter().filter(|bss| !bss.should_ignore()).collect();
        let used_wifi = non_ignored.len() >= 2;
        let wifi_access_points = if used_wifi {
            non_ignored
                .iter()
                .map(|bss| WifiAccessPoint {
                    mac_address: bss.bssid_string(),
                    signal_strength: bss.signal_strength,
                    age: Some(bss.age_secs * 1000),
                    frequency: None,
                })
                .collect()
        } else {
            Vec::new()
        };

        let description = match (used_cell, used_wifi) {
            (true, true) => "3GPP + WiFi",
            (true, false) => "3GPP",
            (false, true) => "WiFi",
            (false, false) => "GeoIP",
        };

        (LocateRequestBody(LocateRequest { radio_type, cell_towers, wifi_access_points }), description.into())
    }

    /// Parse a `geolocate` JSON response body.
    pub fn parse_locate_response(
        &self,
        body: &[u8],
        query_description: String,
    ) -> Result<LocateResult, QueryError> {
        let response: LocateResponse = serde_json::from_slice(body)?;
        if let Some(error) = response.error {
            let message = error.message.unwrap_or_else(|| "Unknown error".into());
            return Err(QueryError::Server(message));
        }

        let location = response.location.ok_or(QueryError::MissingLocation)?;
        let description = match response.fallback {
            Some(fallback) if !fallback.is_empty() => {
                format!("{fallback} fallback (from {query_description} data)")
            },
            _ => query_description,
        };

        let mut location = LocationValue::new(location.lat, location.lng, response.accuracy)
            .ok_or(QueryError::InvalidLocation(location.lat, location.lng))?;
        location.description = Some(description.clone());

        Ok(LocateResult { location, description })
    }

    /// Mark the current tower/BSS set as submitted.
    ///
    /// Called right after a `geosubmit` request is handed to the HTTP
    /// client, deliberately before the response arrives: this prevents a
    /// slow or failing submit from being retried in a tight loop.
    pub fn mark_submitted(&mut self) {
        self.bss_submitted = true;
        self.tower_submitted = true;
    }

    /// Whether a `geosubmit` request is worth sending at all: skipped once
    /// both the BSS set and the (still valid) tower are already submitted.
    pub fn needs_submit(&self) -> bool {
        !(self.bss_submitted && (self.tower.is_none() || self.tower_submitted))
    }
}

/// Opaque wrapper so callers serialize via `serde_json::to_vec` without
/// reaching into the request's internals.
pub struct LocateRequestBody(LocateRequest);

impl LocateRequestBody {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bss(bssid: u8, ssid: &str) -> Bss {
        Bss { bssid: [bssid; BSSID_LEN], ssid: ssid.into(), signal_strength: -50, age_secs: 1, frequency: None }
    }

    #[test]
    fn ignores_nomap_and_empty_ssid() {
        assert!(bss(1, "_nomap").should_ignore());
        assert!(bss(1, "home_nomap").should_ignore());
        assert!(bss(1, "").should_ignore());
        assert!(!bss(1, "home").should_ignore());
    }

    #[test]
    fn needs_two_bsses_for_wifi_data() {
        let query = MozillaQuery::new();
        let (_, description) = query.create_locate_request(&[bss(1, "a")], false);
        assert_eq!(description, "GeoIP");

        let (_, description) = query.create_locate_request(&[bss(1, "a"), bss(2, "b")], false);
        assert_eq!(description, "WiFi");
    }

    #[test]
    fn mcc_mnc_splits_operator_code() {
        let tower =
            Tower3G { operator_code: "262011".into(), location_area_code: 1, cell_id: 2, tec: Tec::Lte };
        assert_eq!(tower.mcc_mnc(), Some((262, 11)));
    }

    #[test]
    fn submit_suppressed_once_everything_is_submitted() {
        let mut query = MozillaQuery::new();
        assert!(query.needs_submit());
        query.mark_submitted();
        assert!(!query.needs_submit());

        query.set_bss_dirty();
        assert!(query.needs_submit());
    }

    #[test]
    fn identical_tower_keeps_submitted_flag() {
        let mut query = MozillaQuery::new();
        let tower =
            Tower3G { operator_code: "262011".into(), location_area_code: 1, cell_id: 2, tec: Tec::Lte };
        query.set_tower(Some(tower.clone()));
        query.mark_submitted();
        query.set_tower(Some(tower));
        assert!(!query.needs_submit());
    }
}
