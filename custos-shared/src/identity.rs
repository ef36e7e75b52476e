use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("site_id must not be empty")]
    EmptySiteId,
    #[error("reseller_id is required when deployment_mode is reseller")]
    MissingResellerId,
    #[error("reseller_id must be empty when deployment_mode is direct")]
    UnexpectedResellerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    #[default]
    Direct,
    Reseller,
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Direct => "direct",
            DeploymentMode::Reseller => "reseller",
        }
    }
}

/// Immutable identity of one appliance. `reseller_id` is populated iff the
/// appliance was deployed through a reseller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteIdentity {
    pub site_id: String,
    pub host_id: String,
    pub deployment_mode: DeploymentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reseller_id: Option<String>,
}

impl SiteIdentity {
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.site_id.trim().is_empty() {
            return Err(IdentityError::EmptySiteId);
        }
        let has_reseller = self
            .reseller_id
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false);
        match self.deployment_mode {
            DeploymentMode::Reseller if !has_reseller => Err(IdentityError::MissingResellerId),
            DeploymentMode::Direct if has_reseller => Err(IdentityError::UnexpectedResellerId),
            _ => Ok(()),
        }
    }
}
