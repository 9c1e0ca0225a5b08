//! Google Places lead search (text search + place details).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use super::types::{AdapterResult, LeadSearch, SearchFilters, SearchPage};
use crate::error::AdapterError;
use crate::leads::model::Lead;

const TEXT_SEARCH_URL: &str = "https://maps.googleapis.com/maps/api/place/textsearch/json";
const DETAILS_URL: &str = "https://maps.googleapis.com/maps/api/place/details/json";

pub struct PlacesSearch {
    client: reqwest::Client,
    api_key: SecretString,
}

#[derive(Debug, Deserialize)]
struct TextSearchResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<Place>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Place {
    place_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    formatted_address: String,
    #[serde(default)]
    rating: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    result: PlaceDetails,
}

#[derive(Debug, Default, Deserialize)]
struct PlaceDetails {
    #[serde(default)]
    formatted_phone_number: Option<String>,
    #[serde(default)]
    website: Option<String>,
}

/// Map a Places API `status` to an adapter result.
fn check_status(status: &str, message: Option<&str>) -> AdapterResult<()> {
    let reason = || format!("{status}: {}", message.unwrap_or(""));
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => Err(AdapterError::transient("search", reason())),
        "REQUEST_DENIED" => Err(AdapterError::unavailable("search", reason())),
        _ => Err(AdapterError::semantic("search", reason())),
    }
}

impl PlacesSearch {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    /// Phone and website. Failures degrade to empty details.
    async fn details(&self, place_id: &str) -> PlaceDetails {
        let result = self
            .client
            .get(DETAILS_URL)
            .query(&[
                ("place_id", place_id),
                ("fields", "formatted_phone_number,website"),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await;
        let resp = match result {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(place_id, status = %resp.status(), "Place details failed");
                return PlaceDetails::default();
            }
            Err(e) => {
                warn!(place_id, error = %e, "Place details failed");
                return PlaceDetails::default();
            }
        };
        resp.json::<DetailsResponse>()
            .await
            .map(|d| d.result)
            .unwrap_or_default()
    }
}

fn to_lead(place: Place, details: PlaceDetails, area: &str, category: &str) -> Lead {
    let mut lead = Lead::new(place.place_id, place.name)
        .with_address(place.formatted_address)
        .with_city(area.trim())
        .with_phone(details.formatted_phone_number.unwrap_or_default())
        .with_category(category);
    lead.rating = place.rating;
    lead.has_website = details.website.is_some_and(|w| !w.trim().is_empty());
    lead
}

#[async_trait]
impl LeadSearch for PlacesSearch {
    async fn search_leads(
        &self,
        area: &str,
        filters: &SearchFilters,
        page: Option<&str>,
    ) -> AdapterResult<SearchPage> {
        let query = format!("{} in {area}", filters.category);
        let mut params = vec![("key", self.api_key.expose_secret().to_string())];
        match page {
            Some(token) => params.push(("pagetoken", token.to_string())),
            None => params.push(("query", query.clone())),
        }

        let resp = self
            .client
            .get(TEXT_SEARCH_URL)
            .query(&params)
            .send()
            .await
            .map_err(|e| AdapterError::transient("search", e.to_string()))?;
        if resp.status().is_server_error() {
            return Err(AdapterError::transient("search", format!("HTTP {}", resp.status())));
        }
        let body: TextSearchResponse = resp
            .json()
            .await
            .map_err(|e| AdapterError::semantic("search", format!("bad response body: {e}")))?;
        check_status(&body.status, body.error_message.as_deref())?;
        debug!(query = %query, results = body.results.len(), "Places text search");

        let mut leads = Vec::with_capacity(body.results.len());
        for place in body.results {
            let details = self.details(&place.place_id).await;
            leads.push(to_lead(place, details, area, &filters.category));
        }

        Ok(SearchPage {
            leads,
            next_page: body.next_page_token,
            degraded: false,
        })
    }
}
