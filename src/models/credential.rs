//! Provider OAuth credentials per athlete.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Athlete's provider OAuth credentials.
///
/// Owned by the token manager; only its refresh path writes new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AthleteCredential {
    pub athlete_id: u64,
    pub access_token: String,
    pub refresh_token: String,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
    /// Granted OAuth scopes
    pub scopes: Vec<String>,
}

impl AthleteCredential {
    /// True when the token expires within `margin` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - now < margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at: DateTime<Utc>) -> AthleteCredential {
        AthleteCredential {
            athlete_id: 1,
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at,
            scopes: vec![],
        }
    }

    #[test]
    fn refresh_needed_inside_margin() {
        let now = Utc::now();
        let margin = Duration::minutes(5);
        assert!(credential(now + Duration::minutes(3)).needs_refresh(now, margin));
        assert!(credential(now - Duration::minutes(1)).needs_refresh(now, margin));
        assert!(!credential(now + Duration::minutes(30)).needs_refresh(now, margin));
    }
}
