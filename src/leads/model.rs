//! Lead data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outreach status of a lead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Discovered, not yet contacted. Also the neutral value for merges.
    #[default]
    New,
    Contacted,
    HotLead,
    NotInterested,
    Scheduled,
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::HotLead => "hot_lead",
            Self::NotInterested => "not_interested",
            Self::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "hot_lead" => Ok(Self::HotLead),
            "not_interested" => Ok(Self::NotInterested),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(format!("Unknown lead status: {s}")),
        }
    }
}

/// A discovered business, keyed by its external place identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    /// Stable external key (maps place id).
    pub place_id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub rating: Option<f64>,
    /// Business category the search matched (e.g. "restaurant").
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub has_website: bool,
    #[serde(default)]
    pub status: LeadStatus,
    #[serde(default)]
    pub notes: String,
    /// First time any discovery reported this identity.
    pub discovered_at: DateTime<Utc>,
}

impl Lead {
    /// Create a lead with only identity and name populated.
    pub fn new(place_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            place_id: place_id.into(),
            name: name.into(),
            address: String::new(),
            city: String::new(),
            phone: String::new(),
            email: String::new(),
            rating: None,
            category: String::new(),
            has_website: false,
            status: LeadStatus::New,
            notes: String::new(),
            discovered_at: Utc::now(),
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = phone.into();
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = city.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_status(mut self, status: LeadStatus) -> Self {
        self.status = status;
        self
    }
}

/// Filter for [`LeadRegistry::list`](super::registry::LeadRegistry::list).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadFilter {
    pub status: Option<LeadStatus>,
    pub city: Option<String>,
    pub has_website: Option<bool>,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        if let Some(status) = self.status {
            if lead.status != status {
                return false;
            }
        }
        if let Some(ref city) = self.city {
            if !lead.city.eq_ignore_ascii_case(city) {
                return false;
            }
        }
        if let Some(has_website) = self.has_website {
            if lead.has_website != has_website {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_display() {
        for status in [
            LeadStatus::New,
            LeadStatus::Contacted,
            LeadStatus::HotLead,
            LeadStatus::NotInterested,
            LeadStatus::Scheduled,
        ] {
            assert_eq!(status.to_string().parse::<LeadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn filter_matches_city_case_insensitive() {
        let lead = Lead::new("p1", "Joe's Cafe").with_city("Austin");
        let filter = LeadFilter {
            city: Some("austin".into()),
            ..Default::default()
        };
        assert!(filter.matches(&lead));

        let filter = LeadFilter {
            status: Some(LeadStatus::Scheduled),
            ..Default::default()
        };
        assert!(!filter.matches(&lead));
    }

    #[test]
    fn lead_deserializes_with_defaults() {
        let lead: Lead = serde_json::from_value(serde_json::json!({
            "place_id": "p1",
            "name": "Joe's Cafe",
            "discovered_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(lead.status, LeadStatus::New);
        assert!(lead.phone.is_empty());
        assert!(lead.rating.is_none());
    }
}
